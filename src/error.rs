//! Error taxonomy shared by the server, the workers and the clients.

use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::source::SourceUrlError;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("job {id} is already {status}")]
    Terminal { id: JobId, status: JobStatus },
    /// A worker reported a result for a job it never reported starting.
    #[error("job {id} cannot complete before it has started processing")]
    NotStarted { id: JobId },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("job {0} not found")]
    Missing(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("job database error: {0}")]
    Database(#[from] libsql::Error),
    #[error("stored job {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("could not launch {tool}: {reason}")]
    Launch { tool: String, reason: String },
    #[error("upstream service error: {0}")]
    Upstream(String),
    #[error("artifact unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by [`crate::service::JobService`]. Each variant maps to
/// one stable wire code so clients can branch without parsing messages.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid source URL: {0}")]
    InvalidInput(#[from] SourceUrlError),
    #[error("conversion worker could not be started: {0}")]
    WorkerDispatchFailed(#[source] BackendError),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} has not finished yet")]
    NotReady(JobId),
    #[error("job {id} failed: {detail}")]
    JobFailed { id: JobId, detail: String },
    #[error("artifact delivery failed: {0}")]
    DeliveryFailure(#[source] BackendError),
    #[error("video lookup failed: {0}")]
    LookupFailed(#[source] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::WorkerDispatchFailed(_) => "WorkerDispatchFailed",
            Self::NotFound(_) => "NotFound",
            Self::NotReady(_) => "NotReady",
            Self::JobFailed { .. } => "JobFailed",
            Self::DeliveryFailure(_) => "DeliveryFailure",
            Self::LookupFailed(_) => "LookupFailed",
            Self::Store(_) => "Internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("server answered {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ways a client-side polling session can end without a completed job.
#[derive(Debug, Error)]
pub enum PollError {
    /// The ceiling elapsed first. The job may still finish unobserved.
    #[error("gave up after {elapsed:?} without a final status; the job may still finish")]
    Timeout { elapsed: Duration },
    #[error("conversion failed: {0}")]
    WorkerReportedFailure(String),
    #[error("status request rejected: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("status request failed: {0}")]
    Transport(String),
}

impl PollError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Timeout",
            Self::WorkerReportedFailure(_) => "WorkerReportedFailure",
            Self::Rejected { .. } => "Rejected",
            Self::Transport(_) => "Transport",
        }
    }
}

impl From<ClientError> for PollError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api { code, message, .. } => Self::Rejected { code, message },
            other => Self::Transport(other.to_string()),
        }
    }
}
