//! Client-side status polling.
//!
//! [`poll_until_terminal`] queries a [`StatusSource`] until the job reaches a
//! terminal state or the ceiling elapses. Dropping the returned future is the
//! cancellation mechanism: the server is never told, and the job keeps
//! running there.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{ClientError, PollError};
use crate::job::{JobStatus, UNKNOWN_FAILURE};
use crate::protocol::StatusResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Multiplier applied to the interval after each non-terminal answer.
    pub backoff: f64,
    /// Total time budget for the whole session, request time included.
    pub ceiling: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(5),
            backoff: 1.5,
            ceiling: Duration::from_secs(60),
        }
    }
}

impl PollPolicy {
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self.max_interval = self.max_interval.max(interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.backoff.max(1.0));
        grown.min(self.max_interval)
    }
}

/// Anything that can answer "what is the status of job `id`".
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, id: &str) -> Result<StatusResponse, ClientError>;
}

/// Progress observed while the job is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollProgress {
    pub status: JobStatus,
    pub progress: u8,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub id: String,
    pub title: Option<String>,
    /// As reported by the server; may be relative to the API origin.
    pub download_url: String,
}

pub async fn poll_until_terminal<S, F>(
    source: &S,
    id: &str,
    policy: &PollPolicy,
    mut on_progress: F,
) -> Result<CompletedJob, PollError>
where
    S: StatusSource + ?Sized,
    F: FnMut(&PollProgress),
{
    let started = Instant::now();
    let deadline = started + policy.ceiling;
    let mut interval = policy.initial_interval;
    let mut shown: u8 = 0;
    let mut title: Option<String> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(started));
        }

        let status = match tokio::time::timeout(remaining, source.fetch_status(id)).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out(started)),
        };
        if let Some(found) = status.title.clone().filter(|t| !t.trim().is_empty()) {
            title = Some(found);
        }

        match status.status {
            JobStatus::Completed => {
                let download_url = status.download_url.ok_or_else(|| PollError::Rejected {
                    code: "MissingDownloadUrl".into(),
                    message: format!("job {id} completed without a download URL"),
                })?;
                tracing::debug!(job_id = id, "job completed");
                return Ok(CompletedJob {
                    id: id.to_string(),
                    title,
                    download_url,
                });
            }
            JobStatus::Failed => {
                let detail = status
                    .error
                    .filter(|detail| !detail.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
                return Err(PollError::WorkerReportedFailure(detail));
            }
            JobStatus::Pending | JobStatus::Processing => {
                shown = shown.max(status.progress.min(100));
                on_progress(&PollProgress {
                    status: status.status,
                    progress: shown,
                    title: title.clone(),
                });
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(started));
        }
        tokio::time::sleep(interval.min(remaining)).await;
        interval = policy.next_interval(interval);
    }
}

fn timed_out(started: Instant) -> PollError {
    PollError::Timeout {
        elapsed: started.elapsed(),
    }
}
