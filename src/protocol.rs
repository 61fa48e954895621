//! Request and response bodies shared by the HTTP server and its clients.

use serde::{Deserialize, Deserializer, Serialize};

use crate::job::{ConversionJob, JobId, JobStatus};

pub const CONVERT_PATH: &str = "/api/convert";
pub const STATUS_ROUTE: &str = "/api/status/{id}";
pub const FILES_ROUTE: &str = "/files/{file}";
pub const EXTRACT_PATH: &str = "/api/extract";

pub fn status_path(id: &JobId) -> String {
    format!("/api/status/{id}")
}

pub fn download_path(id: &JobId, ext: &str) -> String {
    format!("/files/{id}.{ext}")
}

/// Splits a `/files/{id}.{ext}` segment back into the job id and extension.
pub fn parse_download_file(file: &str) -> Option<(JobId, &str)> {
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file, None),
    };
    let id = JobId::parse(stem)?;
    Some((id, ext.unwrap_or("")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(alias = "fileId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

impl SubmitResponse {
    /// Where to poll for this job. Servers that leave out `statusUrl` serve
    /// status on the standard route.
    pub fn status_location(&self) -> String {
        self.status_url
            .clone()
            .unwrap_or_else(|| format!("/api/status/{}", urlencoding::encode(&self.id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default, alias = "fileId")]
    pub id: String,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "lenient_progress")]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Snapshot of a job as clients see it. The download URL is only present
    /// once the job has completed; the error only once it has failed.
    pub fn from_job(job: &ConversionJob) -> Self {
        Self {
            success: true,
            id: job.id().to_string(),
            status: job.status(),
            progress: job.progress(),
            title: job.title().map(str::to_string),
            download_url: job
                .artifact()
                .map(|artifact| download_path(job.id(), &artifact.extension())),
            error: job.error_detail().map(str::to_string),
        }
    }
}

/// Body of `POST /api/extract`. Same shape as a submission.
pub type ExtractRequest = SubmitRequest;

/// What a video is, looked up without converting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Length in whole seconds.
    #[serde(
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<u64>,
    /// Direct link to the best audio-only stream. Short-lived and tied to
    /// the requesting address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub success: bool,
    #[serde(flatten)]
    pub info: VideoInfo,
}

/// Accepts any JSON number (or `null`) and floors it into 0..=100.
fn lenient_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 100.0).floor() as u8)
        .unwrap_or(0))
}

/// Whole seconds from a number or a numeric string; some servers send
/// lengths as text.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(f64),
        Text(String),
    }

    let value = Option::<Seconds>::deserialize(deserializer)?;
    Ok(value
        .and_then(|value| match value {
            Seconds::Number(secs) => Some(secs),
            Seconds::Text(text) => text.trim().parse::<f64>().ok(),
        })
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.floor() as u64))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: code.into(),
            message: message.into(),
        }
    }
}
