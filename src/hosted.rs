//! Conversion backend that relays jobs to another conversion API.
//!
//! The upstream speaks the same submit/status/files protocol as this server,
//! so a hosted worker is just a poll session whose progress is re-emitted as
//! worker events.

use std::io::{self, Read};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;

use crate::backend::{
    ArtifactBody, ConversionBackend, ConversionRequest, WorkerHandle, WorkerReporter,
};
use crate::client::{ApiClient, AsyncApiClient, Download};
use crate::error::{BackendError, PollError};
use crate::job::{ArtifactLocation, JobStatus, WorkerEvent};
use crate::poller::{PollPolicy, poll_until_terminal};
use crate::protocol::VideoInfo;
use crate::source::SourceUrl;

const PROXY_CHUNK: usize = 64 * 1024;
const PROXY_BUFFER: usize = 8;

#[derive(Debug, Clone)]
pub struct HostedSettings {
    pub upstream: String,
    /// Stream artifacts through this server instead of redirecting to them.
    pub proxy_downloads: bool,
    pub poll: PollPolicy,
}

pub struct HostedBackend {
    client: ApiClient,
    proxy_downloads: bool,
    poll: PollPolicy,
}

impl HostedBackend {
    pub fn new(settings: HostedSettings, cookie: Option<String>) -> Result<Self, BackendError> {
        let client = ApiClient::new(&settings.upstream)
            .map_err(|err| BackendError::Upstream(err.to_string()))?
            .with_cookie(cookie);
        Ok(Self {
            client,
            proxy_downloads: settings.proxy_downloads,
            poll: settings.poll,
        })
    }

    /// Upstream client carrying the request's own cookies, if any, in place
    /// of the configured ones.
    fn upstream_for(&self, cookies: Option<&str>) -> AsyncApiClient {
        let mut client = self.client.clone();
        if cookies.is_some() {
            client = client.with_cookie(cookies.map(str::to_string));
        }
        AsyncApiClient::new(client)
    }
}

#[async_trait]
impl ConversionBackend for HostedBackend {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn dispatch(&self, request: ConversionRequest) -> Result<WorkerHandle, BackendError> {
        let upstream = self.upstream_for(request.cookies.as_deref());
        let source = request.source.canonical();
        let receipt = upstream
            .submit(&source)
            .await
            .map_err(|err| BackendError::Upstream(err.to_string()))?;
        tracing::debug!(job_id = %request.job_id, upstream_id = %receipt.id, "relayed to upstream");

        let (reporter, handle) = WorkerHandle::channel();
        tokio::spawn(follow_upstream(
            upstream,
            receipt.id,
            self.poll.clone(),
            reporter,
        ));
        Ok(handle)
    }

    async fn open_artifact(
        &self,
        artifact: &ArtifactLocation,
    ) -> Result<ArtifactBody, BackendError> {
        let ArtifactLocation::Remote(url) = artifact else {
            return Err(BackendError::Unavailable(
                "hosted backend has no local artifacts".into(),
            ));
        };
        if !self.proxy_downloads {
            return Ok(ArtifactBody::Redirect(url.clone()));
        }

        let client = self.client.clone();
        let url = url.clone();
        let download = tokio::task::spawn_blocking(move || client.open_download(&url))
            .await
            .map_err(|err| BackendError::Io(io::Error::other(err)))?
            .map_err(|err| BackendError::Upstream(err.to_string()))?;
        Ok(proxy_stream(download))
    }

    async fn describe(
        &self,
        source: &SourceUrl,
        cookies: Option<&str>,
    ) -> Result<VideoInfo, BackendError> {
        let response = self
            .upstream_for(cookies)
            .extract(&source.canonical())
            .await
            .map_err(|err| BackendError::Upstream(err.to_string()))?;
        Ok(response.info)
    }
}

async fn follow_upstream(
    upstream: AsyncApiClient,
    upstream_id: String,
    policy: PollPolicy,
    reporter: WorkerReporter,
) {
    reporter.send(WorkerEvent::Started).await;

    let mut last_title: Option<String> = None;
    let session = poll_until_terminal(&upstream, &upstream_id, &policy, |progress| {
        if progress.status == JobStatus::Processing {
            reporter.offer(WorkerEvent::Progress(progress.progress));
        }
        if let Some(title) = &progress.title {
            // Remembered only once queued, so a full buffer retries next poll.
            if last_title.as_ref() != Some(title)
                && reporter.offer(WorkerEvent::Title(title.clone()))
            {
                last_title = Some(title.clone());
            }
        }
    });
    let outcome = tokio::select! {
        outcome = session => outcome,
        () = reporter.closed() => {
            tracing::debug!(upstream_id = %upstream_id, "job abandoned, no longer following upstream");
            return;
        }
    };

    let event = match outcome {
        Ok(done) => match upstream.blocking().resolve(&done.download_url) {
            Ok(url) => WorkerEvent::Completed {
                artifact: ArtifactLocation::Remote(url.to_string()),
                title: done.title,
            },
            Err(err) => WorkerEvent::Failed(format!("upstream returned a bad download URL: {err}")),
        },
        Err(PollError::WorkerReportedFailure(detail)) => WorkerEvent::Failed(detail),
        Err(err) => WorkerEvent::Failed(format!("lost track of upstream job: {err}")),
    };
    reporter.send(event).await;
}

/// Streams an upstream download chunk by chunk. A body shorter than the
/// announced length ends with `UnexpectedEof` instead of looking complete.
fn proxy_stream(download: Download) -> ArtifactBody {
    let length = download.content_length;
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PROXY_BUFFER);
    tokio::task::spawn_blocking(move || pump(download, tx));

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    ArtifactBody::Stream {
        body: Box::pin(body),
        length,
    }
}

fn pump(mut download: Download, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = vec![0u8; PROXY_CHUNK];
    let mut total: u64 = 0;
    loop {
        match download.reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        }
    }

    if let Some(expected) = download.content_length {
        if total < expected {
            let _ = tx.blocking_send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("upstream sent {total} of {expected} bytes"),
            )));
        }
    }
}
