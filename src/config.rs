#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::hosted::HostedSettings;
use crate::poller::PollPolicy;
use crate::security::is_safe_token;
use crate::ytdlp::YtDlpSettings;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_AUDIO_FORMAT: &str = "mp3";
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
/// Hosted conversions of long videos routinely outlast the interactive
/// client's one-minute budget.
pub const HOSTED_POLL_CEILING: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    YtDlp,
    Hosted,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ytdlp" | "yt-dlp" => Ok(Self::YtDlp),
            "hosted" => Ok(Self::Hosted),
            other => bail!("unknown CONVERSION_BACKEND `{other}` (expected ytdlp or hosted)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl StoreKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown JOB_STORE `{other}` (expected memory or sqlite)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub ytdlp_bin: PathBuf,
    pub audio_format: String,
    /// Opaque cookie blob forwarded when a request brings none.
    pub cookie_header: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub upstream_api_url: Option<String>,
    pub proxy_downloads: bool,
    pub job_store: StoreKind,
    pub job_retention: Duration,
}

impl ServerSettings {
    pub fn artifact_dir(&self) -> PathBuf {
        self.data_root.join("artifacts")
    }

    pub fn job_db_path(&self) -> PathBuf {
        self.data_root.join("jobs.db")
    }

    pub fn ytdlp_settings(&self) -> YtDlpSettings {
        YtDlpSettings {
            program: self.ytdlp_bin.clone(),
            output_dir: self.artifact_dir(),
            audio_format: self.audio_format.clone(),
            cookies_file: self.cookies_file.clone(),
        }
    }

    pub fn hosted_settings(&self) -> Result<HostedSettings> {
        let upstream = self
            .upstream_api_url
            .clone()
            .ok_or_else(|| anyhow!("UPSTREAM_API_URL not set"))?;
        Ok(HostedSettings {
            upstream,
            proxy_downloads: self.proxy_downloads,
            poll: PollPolicy::default().with_ceiling(HOSTED_POLL_CEILING),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<BackendKind>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_server_settings(overrides: ServerOverrides) -> Result<ServerSettings> {
    let file_vars = read_env_file(env_path_or_default(overrides.env_path.as_deref()))?;
    build_server_settings(&file_vars, env_var_string, overrides)
}

fn build_server_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ServerOverrides,
) -> Result<ServerSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("DATA_ROOT"))
        .ok_or_else(|| anyhow!("DATA_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| lookup("TUBECONVERT_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("TUBECONVERT_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let backend = match overrides.backend {
        Some(kind) => kind,
        None => lookup("CONVERSION_BACKEND")
            .map(|value| BackendKind::parse(&value))
            .transpose()?
            .unwrap_or(BackendKind::YtDlp),
    };
    let audio_format = lookup("AUDIO_FORMAT")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string());
    if !is_safe_token(&audio_format) {
        bail!("AUDIO_FORMAT `{audio_format}` is not a plain format name");
    }
    let upstream_api_url = lookup("UPSTREAM_API_URL");
    if backend == BackendKind::Hosted && upstream_api_url.is_none() {
        bail!("CONVERSION_BACKEND=hosted requires UPSTREAM_API_URL");
    }
    let proxy_downloads = lookup("PROXY_DOWNLOADS")
        .map(|value| parse_bool("PROXY_DOWNLOADS", &value))
        .transpose()?
        .unwrap_or(false);
    let job_store = lookup("JOB_STORE")
        .map(|value| StoreKind::parse(&value))
        .transpose()?
        .unwrap_or(StoreKind::Memory);
    let retention_secs = lookup("JOB_RETENTION_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_SECS);

    Ok(ServerSettings {
        data_root: PathBuf::from(data_root),
        host,
        port,
        backend,
        ytdlp_bin: PathBuf::from(
            lookup("YTDLP_BIN").unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string()),
        ),
        audio_format,
        cookie_header: lookup("COOKIE_HEADER"),
        cookies_file: lookup("COOKIES_FILE").map(PathBuf::from),
        upstream_api_url,
        proxy_downloads,
        job_store,
        job_retention: Duration::from_secs(retention_secs),
    })
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub cookie_header: Option<String>,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub api_base_url: Option<String>,
    pub cookie_header: Option<String>,
    pub poll_interval: Option<Duration>,
    pub poll_ceiling: Option<Duration>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_client_settings(overrides: ClientOverrides) -> Result<ClientSettings> {
    let file_vars = read_env_file(env_path_or_default(overrides.env_path.as_deref()))?;
    Ok(build_client_settings(&file_vars, env_var_string, overrides))
}

fn build_client_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ClientOverrides,
) -> ClientSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let seconds = |key: &str| {
        lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    };

    let api_base_url = overrides
        .api_base_url
        .and_then(non_blank)
        .or_else(|| lookup("API_BASE_URL"))
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let cookie_header = overrides
        .cookie_header
        .and_then(non_blank)
        .or_else(|| lookup("COOKIE_HEADER"));

    let mut poll = PollPolicy::default();
    if let Some(interval) = overrides.poll_interval.or_else(|| seconds("POLL_INTERVAL_SECS")) {
        poll = poll.with_interval(interval);
    }
    if let Some(ceiling) = overrides.poll_ceiling.or_else(|| seconds("POLL_CEILING_SECS")) {
        poll = poll.with_ceiling(ceiling);
    }

    ClientSettings {
        api_base_url,
        cookie_header,
        poll,
    }
}

fn env_path_or_default(path: Option<&Path>) -> &Path {
    path.unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH))
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} must be true or false, got `{other}`"),
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
