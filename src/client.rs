//! Blocking HTTP client for the conversion API, plus an async wrapper that
//! plugs into the poller.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::ClientError;
use crate::poller::StatusSource;
use crate::protocol::{
    ErrorResponse, ExtractRequest, ExtractResponse, StatusResponse, SubmitRequest, SubmitResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("tubeconvert/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct ApiClient {
    agent: ureq::Agent,
    base: Url,
    cookie: Option<String>,
}

/// An open artifact download.
pub struct Download {
    pub url: Url,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub reader: Box<dyn Read + Send + Sync + 'static>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let mut base = Url::parse(base_url.trim()).map_err(|err| ClientError::Decode {
            url: base_url.to_string(),
            reason: format!("invalid API base URL: {err}"),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .user_agent(USER_AGENT)
            .build();
        Ok(Self {
            agent,
            base,
            cookie: None,
        })
    }

    /// Opaque `Cookie` header value sent with every request.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolves an API path or a server-provided URL against the base origin.
    /// Absolute URLs are returned unchanged.
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, ClientError> {
        if let Ok(absolute) = Url::parse(path_or_url) {
            return Ok(absolute);
        }
        self.base
            .join(path_or_url.trim_start_matches('/'))
            .map_err(|err| ClientError::Decode {
                url: path_or_url.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn submit(&self, source_url: &str) -> Result<SubmitResponse, ClientError> {
        let url = self.resolve("api/convert")?;
        let body = SubmitRequest {
            url: source_url.to_string(),
            cookie: self.cookie.clone(),
        };
        let response = self
            .request("POST", &url)
            .send_json(&body)
            .map_err(|err| map_error(&url, err))?;
        decode(&url, response)
    }

    /// Asks the server what a link points at without starting a conversion.
    pub fn extract(&self, source_url: &str) -> Result<ExtractResponse, ClientError> {
        let url = self.resolve("api/extract")?;
        let body = ExtractRequest {
            url: source_url.to_string(),
            cookie: self.cookie.clone(),
        };
        let response = self
            .request("POST", &url)
            .send_json(&body)
            .map_err(|err| map_error(&url, err))?;
        decode(&url, response)
    }

    pub fn status(&self, id: &str) -> Result<StatusResponse, ClientError> {
        let url = self.resolve(&format!("api/status/{}", urlencoding::encode(id)))?;
        let response = self
            .request("GET", &url)
            .call()
            .map_err(|err| map_error(&url, err))?;
        decode(&url, response)
    }

    pub fn open_download(&self, download_url: &str) -> Result<Download, ClientError> {
        let url = self.resolve(download_url)?;
        let response = self
            .request("GET", &url)
            .call()
            .map_err(|err| map_error(&url, err))?;
        let content_length = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let content_type = response.header("Content-Type").map(str::to_string);
        Ok(Download {
            url,
            content_length,
            content_type,
            reader: response.into_reader(),
        })
    }

    /// Downloads to `dest` through a `.part` file that is only renamed into
    /// place once the announced length has been received in full.
    pub fn download_to(&self, download_url: &str, dest: &Path) -> Result<u64, ClientError> {
        let mut download = self.open_download(download_url)?;
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(dest);
        let result = write_download(&mut download, &partial);
        match result {
            Ok(written) => {
                fs::rename(&partial, dest)?;
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&partial);
                Err(err)
            }
        }
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let request = self.agent.request_url(method, url);
        match &self.cookie {
            Some(cookie) => request.set("Cookie", cookie),
            None => request,
        }
    }
}

fn write_download(download: &mut Download, partial: &Path) -> Result<u64, ClientError> {
    let mut file = File::create(partial)?;
    let written = io::copy(&mut download.reader, &mut file)?;
    file.flush()?;
    if let Some(expected) = download.content_length {
        if written != expected {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "download from {} ended after {written} of {expected} bytes",
                    download.url
                ),
            )));
        }
    }
    Ok(written)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn decode<T: serde::de::DeserializeOwned>(
    url: &Url,
    response: ureq::Response,
) -> Result<T, ClientError> {
    response.into_json::<T>().map_err(|err| ClientError::Decode {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

fn map_error(url: &Url, err: ureq::Error) -> ClientError {
    match err {
        ureq::Error::Status(status, response) => {
            let status_text = response.status_text().to_string();
            match response.into_json::<ErrorResponse>() {
                Ok(envelope) => ClientError::Api {
                    status,
                    code: envelope.error,
                    message: envelope.message,
                },
                Err(_) => ClientError::Api {
                    status,
                    code: format!("Http{status}"),
                    message: status_text,
                },
            }
        }
        ureq::Error::Transport(transport) => ClientError::Transport {
            url: url.to_string(),
            reason: transport.to_string(),
        },
    }
}

/// Runs [`ApiClient`] calls on the blocking pool so they can be awaited.
#[derive(Clone)]
pub struct AsyncApiClient {
    inner: Arc<ApiClient>,
}

impl AsyncApiClient {
    pub fn new(client: ApiClient) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    pub fn blocking(&self) -> &ApiClient {
        &self.inner
    }

    pub async fn run<T, F>(&self, call: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&ApiClient) -> Result<T, ClientError> + Send + 'static,
    {
        let client = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&client))
            .await
            .map_err(|err| ClientError::Io(io::Error::other(err)))?
    }

    pub async fn submit(&self, source_url: &str) -> Result<SubmitResponse, ClientError> {
        let source_url = source_url.to_string();
        self.run(move |client| client.submit(&source_url)).await
    }

    pub async fn extract(&self, source_url: &str) -> Result<ExtractResponse, ClientError> {
        let source_url = source_url.to_string();
        self.run(move |client| client.extract(&source_url)).await
    }

    pub async fn status(&self, id: &str) -> Result<StatusResponse, ClientError> {
        let id = id.to_string();
        self.run(move |client| client.status(&id)).await
    }

    pub async fn download_to(&self, download_url: &str, dest: &Path) -> Result<u64, ClientError> {
        let download_url = download_url.to_string();
        let dest = dest.to_path_buf();
        self.run(move |client| client.download_to(&download_url, &dest)).await
    }
}

#[async_trait]
impl StatusSource for AsyncApiClient {
    async fn fetch_status(&self, id: &str) -> Result<StatusResponse, ClientError> {
        self.status(id).await
    }
}
