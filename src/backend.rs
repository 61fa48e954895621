//! The seam between the job service and whatever performs conversions.
//!
//! A backend accepts a [`ConversionRequest`] and hands back a
//! [`WorkerHandle`]: the receiving end of the worker's event stream. The
//! service owns the handle and is the only thing that turns those events into
//! job state.

use std::io;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::job::{ArtifactLocation, JobId, WorkerEvent};
use crate::protocol::VideoInfo;
use crate::source::SourceUrl;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub job_id: JobId,
    pub source: SourceUrl,
    /// Opaque cookie blob forwarded to the worker for sign-in gated videos.
    pub cookies: Option<String>,
}

/// Sending side of a worker's event stream.
#[derive(Debug, Clone)]
pub struct WorkerReporter {
    tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerReporter {
    /// Delivers an event, waiting for buffer space. Returns false once the
    /// receiving side is gone.
    pub async fn send(&self, event: WorkerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Non-blocking delivery for progress updates, where a later update
    /// supersedes a dropped one. Returns whether the event was queued.
    pub fn offer(&self, event: WorkerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the handle is dropped. Workers stop at that point.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    rx: mpsc::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    pub fn channel() -> (WorkerReporter, WorkerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (WorkerReporter { tx }, WorkerHandle { rx })
    }

    /// Next event, or `None` once every reporter has been dropped.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.rx.recv().await
    }
}

pub enum ArtifactBody {
    /// Client should fetch the artifact from this absolute URL.
    Redirect(String),
    Stream {
        body: BoxStream<'static, io::Result<Bytes>>,
        length: Option<u64>,
    },
}

impl std::fmt::Debug for ArtifactBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
            Self::Stream { length, .. } => f
                .debug_struct("Stream")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

#[async_trait]
pub trait ConversionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a conversion. Must return promptly; the work itself continues
    /// in the background and reports through the returned handle. An error
    /// here means no worker was started at all.
    async fn dispatch(&self, request: ConversionRequest) -> Result<WorkerHandle, BackendError>;

    /// Opens a completed artifact for delivery.
    async fn open_artifact(&self, artifact: &ArtifactLocation)
    -> Result<ArtifactBody, BackendError>;

    /// Looks up a video's title, thumbnail and length without converting it.
    async fn describe(
        &self,
        _source: &SourceUrl,
        _cookies: Option<&str>,
    ) -> Result<VideoInfo, BackendError> {
        Err(BackendError::Unavailable(format!(
            "{} backend cannot look up videos",
            self.name()
        )))
    }

    /// Releases an artifact whose job has expired.
    async fn discard_artifact(&self, _artifact: &ArtifactLocation) -> Result<(), BackendError> {
        Ok(())
    }
}
