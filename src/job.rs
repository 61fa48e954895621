//! Conversion jobs and the state machine that drives them.
//!
//! A job only ever moves forward: `Pending -> Processing -> Completed` or
//! `Failed`, with `Pending -> Failed` allowed when a worker dies before its
//! first progress signal. The only input is a [`WorkerEvent`]; the artifact
//! location and failure detail live inside the terminal variants, so a job
//! can never expose an artifact before it has completed.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransitionError;
use crate::security::is_safe_token;
use crate::source::SourceUrl;

const JOB_ID_BYTES: usize = 16;
const MAX_JOB_ID_LEN: usize = 64;
const DEFAULT_ARTIFACT_EXT: &str = "mp3";

/// Detail recorded when a worker fails without saying why.
pub const UNKNOWN_FAILURE: &str = "conversion failed without an error message";

/// Opaque job identifier: 128 random bits, URL-safe base64.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; JOB_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Accepts ids coming back from callers. Anything that is not a short
    /// URL-safe token is rejected before it reaches a store.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        (value.len() <= MAX_JOB_ID_LEN && is_safe_token(value)).then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire-level name of a job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a finished conversion can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// Output written by a local worker.
    File(PathBuf),
    /// Absolute URL resolved by a hosted worker.
    Remote(String),
}

impl ArtifactLocation {
    /// File extension of the artifact, used for the public download path.
    pub fn extension(&self) -> String {
        let ext = match self {
            Self::File(path) => extension_of(path),
            Self::Remote(url) => Url::parse(url)
                .ok()
                .and_then(|url| extension_of(Path::new(url.path()))),
        };
        ext.filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_ARTIFACT_EXT.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Completed { artifact: ArtifactLocation },
    Failed { detail: String },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Processing => JobStatus::Processing,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Everything a conversion worker can tell us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started,
    Progress(u8),
    Title(String),
    Completed {
        artifact: ArtifactLocation,
        title: Option<String>,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    id: JobId,
    source: SourceUrl,
    state: JobState,
    progress: u8,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversionJob {
    pub fn new(id: JobId, source: SourceUrl) -> Self {
        let now = Utc::now();
        Self {
            id,
            source,
            state: JobState::Pending,
            progress: 0,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds a job read back from persistent storage.
    pub(crate) fn restore(
        id: JobId,
        source: SourceUrl,
        state: JobState,
        progress: u8,
        title: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let progress = match state {
            JobState::Completed { .. } => 100,
            _ => progress.min(100),
        };
        Self {
            id,
            source,
            state,
            progress,
            title,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn source(&self) -> &SourceUrl {
        &self.source
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn artifact(&self) -> Option<&ArtifactLocation> {
        match &self.state {
            JobState::Completed { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { detail } => Some(detail),
            _ => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Applies one worker event. Terminal jobs reject every event and are
    /// left untouched.
    pub fn apply(&mut self, event: WorkerEvent) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status(),
            });
        }

        match event {
            WorkerEvent::Started => {
                self.state = JobState::Processing;
            }
            WorkerEvent::Progress(percent) => {
                self.state = JobState::Processing;
                self.progress = self.progress.max(percent.min(100));
            }
            WorkerEvent::Title(title) => {
                if let Some(title) = non_empty(title) {
                    self.title = Some(title);
                }
            }
            WorkerEvent::Completed { artifact, title } => {
                if self.state == JobState::Pending {
                    return Err(TransitionError::NotStarted {
                        id: self.id.clone(),
                    });
                }
                if let Some(title) = title.and_then(non_empty) {
                    self.title = Some(title);
                }
                self.progress = 100;
                self.state = JobState::Completed { artifact };
            }
            WorkerEvent::Failed(detail) => {
                let detail = non_empty(detail).unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
                self.state = JobState::Failed { detail };
            }
        }

        self.updated_at = Utc::now();
        Ok(())
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
