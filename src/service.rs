//! Submission, status and delivery on top of an injected store and backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::backend::{ArtifactBody, ConversionBackend, ConversionRequest, WorkerHandle};
use crate::error::{ServiceError, StoreError, TransitionError};
use crate::job::{ArtifactLocation, ConversionJob, JobId, JobState, WorkerEvent};
use crate::protocol::{VideoInfo, status_path};
use crate::source::SourceUrl;
use crate::store::JobStore;

/// Detail recorded when a worker's event stream ends without a verdict.
pub const WORKER_VANISHED: &str = "conversion worker exited without reporting a result";

/// Detail recorded when a worker reports a result for a job it never started.
pub const SKIPPED_PROCESSING: &str = "conversion worker reported a result before starting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub id: JobId,
    pub status_url: String,
}

/// A completed job opened for delivery.
#[derive(Debug)]
pub struct Delivery {
    pub job: ConversionJob,
    pub body: ArtifactBody,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn ConversionBackend>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, backend: Arc<dyn ConversionBackend>) -> Self {
        Self { store, backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Validates the URL, starts a worker and records a pending job. Returns
    /// as soon as the worker is running; conversion continues in the
    /// background. Nothing is stored when validation or dispatch fails.
    pub async fn submit(
        &self,
        raw_url: &str,
        cookies: Option<String>,
    ) -> Result<SubmitReceipt, ServiceError> {
        let source = SourceUrl::parse(raw_url)?;
        let id = JobId::generate();
        let request = ConversionRequest {
            job_id: id.clone(),
            source: source.clone(),
            cookies: cookies.filter(|c| !c.trim().is_empty()),
        };

        let handle = self.backend.dispatch(request).await.map_err(|err| {
            tracing::warn!(job_id = %id, backend = self.backend.name(), error = %err, "dispatch failed");
            ServiceError::WorkerDispatchFailed(err)
        })?;

        let video_id = source.video_id().to_string();
        // Insert before draining so the first event always finds its record.
        if let Err(err) = self.store.insert(ConversionJob::new(id.clone(), source)).await {
            tracing::error!(
                job_id = %id,
                error = %err,
                "could not record job, stopping its worker"
            );
            // Closing the event stream tells the worker to stop and clean up.
            drop(handle);
            return Err(err.into());
        }
        tracing::info!(
            job_id = %id,
            video_id,
            backend = self.backend.name(),
            "job submitted"
        );

        tokio::spawn(drain_worker_events(
            Arc::clone(&self.store),
            id.clone(),
            handle,
        ));

        Ok(SubmitReceipt {
            status_url: status_path(&id),
            id,
        })
    }

    /// Looks up a video without creating a job.
    pub async fn describe(
        &self,
        raw_url: &str,
        cookies: Option<String>,
    ) -> Result<VideoInfo, ServiceError> {
        let source = SourceUrl::parse(raw_url)?;
        let cookies = cookies.filter(|c| !c.trim().is_empty());
        self.backend
            .describe(&source, cookies.as_deref())
            .await
            .map_err(|err| {
                tracing::warn!(video_id = source.video_id(), error = %err, "video lookup failed");
                ServiceError::LookupFailed(err)
            })
    }

    pub async fn status(&self, id: &JobId) -> Result<ConversionJob, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    /// Opens the artifact of a completed job. Delivery failures never change
    /// the job's state.
    pub async fn artifact(&self, id: &JobId) -> Result<Delivery, ServiceError> {
        let job = self.status(id).await?;
        let artifact = match job.state() {
            JobState::Pending | JobState::Processing => {
                return Err(ServiceError::NotReady(id.clone()));
            }
            JobState::Failed { detail } => {
                return Err(ServiceError::JobFailed {
                    id: id.clone(),
                    detail: detail.clone(),
                });
            }
            JobState::Completed { artifact } => artifact.clone(),
        };

        let body = self.backend.open_artifact(&artifact).await.map_err(|err| {
            tracing::warn!(job_id = %id, error = %err, "artifact delivery failed");
            ServiceError::DeliveryFailure(err)
        })?;
        Ok(Delivery { job, body })
    }

    /// Drops terminal jobs older than `retention` and discards their
    /// artifacts. Returns how many jobs were removed.
    pub async fn purge_expired(&self, retention: Duration) -> Result<usize, ServiceError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };

        let removed = self.store.remove_finished_before(cutoff).await?;
        for job in &removed {
            if let Some(artifact) = job.artifact() {
                discard(&*self.backend, job.id(), artifact).await;
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "purged expired jobs");
        }
        Ok(removed.len())
    }
}

async fn discard(backend: &dyn ConversionBackend, id: &JobId, artifact: &ArtifactLocation) {
    if let Err(err) = backend.discard_artifact(artifact).await {
        tracing::warn!(job_id = %id, error = %err, "could not discard artifact");
    }
}

/// Applies every event from one worker to its job until a terminal state.
/// This task is the only writer of the job's record.
async fn drain_worker_events(store: Arc<dyn JobStore>, id: JobId, mut handle: WorkerHandle) {
    while let Some(event) = handle.next_event().await {
        match store.apply(&id, event).await {
            Ok(job) => {
                tracing::debug!(job_id = %id, state = %job.status(), progress = job.progress(), "job updated");
                if job.status().is_terminal() {
                    log_terminal(&job);
                    return;
                }
            }
            Err(StoreError::Transition(err @ TransitionError::NotStarted { .. })) => {
                tracing::warn!(job_id = %id, error = %err, "worker skipped processing");
                fail_job(&*store, &id, SKIPPED_PROCESSING).await;
                return;
            }
            Err(StoreError::Transition(err)) => {
                tracing::warn!(job_id = %id, error = %err, "ignoring event for finished job");
                return;
            }
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "could not record worker event");
            }
        }
    }

    fail_job(&*store, &id, WORKER_VANISHED).await;
}

async fn fail_job(store: &dyn JobStore, id: &JobId, detail: &str) {
    match store.apply(id, WorkerEvent::Failed(detail.into())).await {
        Ok(job) => log_terminal(&job),
        Err(err) => tracing::error!(job_id = %id, error = %err, "could not fail abandoned job"),
    }
}

fn log_terminal(job: &ConversionJob) {
    match job.error_detail() {
        Some(detail) => tracing::warn!(job_id = %job.id(), detail, "job failed"),
        None => tracing::info!(job_id = %job.id(), title = job.title().unwrap_or(""), "job completed"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedBackend, wait_for};
    use super::*;
    use crate::job::JobStatus;
    use crate::store::MemoryJobStore;
    use std::path::PathBuf;

    fn service_with(
        backend: ScriptedBackend,
    ) -> (JobService, Arc<ScriptedBackend>, Arc<MemoryJobStore>) {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryJobStore::new());
        let service = JobService::new(store.clone(), backend.clone());
        (service, backend, store)
    }

    fn mp3() -> ArtifactLocation {
        ArtifactLocation::File(PathBuf::from("/data/artifacts/out.mp3"))
    }

    #[tokio::test]
    async fn submit_returns_pending_job_immediately() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        let receipt = service
            .submit("https://youtube.com/watch?v=abcdefghijk", None)
            .await
            .unwrap();

        assert_eq!(receipt.status_url, format!("/api/status/{}", receipt.id));
        let job = service.status(&receipt.id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress(), 0);
        assert!(job.artifact().is_none());
        assert_eq!(backend.last_request().job_id, receipt.id);
    }

    #[tokio::test]
    async fn invalid_url_stores_nothing() {
        let (service, backend, store) = service_with(ScriptedBackend::default());
        let err = service.submit("not-a-url", None).await.unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
        assert!(store.is_empty());
        assert!(backend.reporters.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_stores_nothing() {
        let (service, _backend, store) = service_with(ScriptedBackend {
            refuse_dispatch: true,
            ..Default::default()
        });
        let err = service
            .submit("https://youtu.be/dQw4w9WgXcQ", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WorkerDispatchFailed");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cookies_reach_the_worker_and_blank_ones_are_dropped() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        service
            .submit("https://youtu.be/dQw4w9WgXcQ", Some("SID=1".into()))
            .await
            .unwrap();
        assert_eq!(backend.last_request().cookies.as_deref(), Some("SID=1"));

        service
            .submit("https://youtu.be/dQw4w9WgXcQ", Some("  ".into()))
            .await
            .unwrap();
        assert!(backend.last_request().cookies.is_none());
    }

    #[tokio::test]
    async fn same_url_twice_creates_two_jobs() {
        let (service, _backend, store) = service_with(ScriptedBackend::default());
        let a = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        let b = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn worker_events_drive_job_to_completion() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        let receipt = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        let reporter = backend.last_reporter();

        reporter.send(WorkerEvent::Progress(30)).await;
        let job = wait_for(&service, &receipt.id, |j| j.progress() == 30).await;
        assert_eq!(job.status(), JobStatus::Processing);
        assert!(matches!(
            service.artifact(&receipt.id).await,
            Err(ServiceError::NotReady(_))
        ));

        reporter
            .send(WorkerEvent::Completed {
                artifact: mp3(),
                title: Some("Sample Track".into()),
            })
            .await;
        let job = wait_for(&service, &receipt.id, |j| j.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);

        // Completed reads are stable.
        let again = service.status(&receipt.id).await.unwrap();
        assert_eq!(again, job);

        let delivery = service.artifact(&receipt.id).await.unwrap();
        assert!(matches!(delivery.body, ArtifactBody::Stream { length: Some(8), .. }));
        assert_eq!(delivery.job.title(), Some("Sample Track"));
    }

    #[tokio::test]
    async fn events_after_terminal_state_are_ignored() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        let receipt = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        let reporter = backend.last_reporter();

        reporter.send(WorkerEvent::Failed("video unavailable".into())).await;
        reporter.offer(WorkerEvent::Progress(90));
        let job = wait_for(&service, &receipt.id, |j| j.status().is_terminal()).await;
        assert_eq!(job.error_detail(), Some("video unavailable"));
        assert_eq!(job.progress(), 0);

        match service.artifact(&receipt.id).await {
            Err(ServiceError::JobFailed { detail, .. }) => assert_eq!(detail, "video unavailable"),
            other => panic!("expected JobFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_that_disappears_fails_the_job() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        let receipt = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        backend.last_reporter().send(WorkerEvent::Started).await;
        backend.abandon_all();

        let job = wait_for(&service, &receipt.id, |j| j.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error_detail(), Some(WORKER_VANISHED));
    }

    #[tokio::test]
    async fn result_without_start_fails_the_job() {
        let (service, backend, _store) = service_with(ScriptedBackend::default());
        let receipt = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        backend
            .last_reporter()
            .send(WorkerEvent::Completed {
                artifact: mp3(),
                title: Some("Cached".into()),
            })
            .await;

        let job = wait_for(&service, &receipt.id, |j| j.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error_detail(), Some(SKIPPED_PROCESSING));
        assert!(job.artifact().is_none());
    }

    /// Store that refuses every new record.
    struct FullStore;

    #[async_trait::async_trait]
    impl JobStore for FullStore {
        async fn insert(&self, job: ConversionJob) -> Result<(), StoreError> {
            Err(StoreError::Duplicate(job.id().clone()))
        }

        async fn get(&self, _id: &JobId) -> Result<Option<ConversionJob>, StoreError> {
            Ok(None)
        }

        async fn apply(
            &self,
            id: &JobId,
            _event: WorkerEvent,
        ) -> Result<ConversionJob, StoreError> {
            Err(StoreError::Missing(id.clone()))
        }

        async fn remove_finished_before(
            &self,
            _cutoff: chrono::DateTime<Utc>,
        ) -> Result<Vec<ConversionJob>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unrecorded_job_stops_its_worker() {
        let backend = Arc::new(ScriptedBackend::default());
        let service = JobService::new(Arc::new(FullStore), backend.clone());

        let err = service
            .submit("https://youtu.be/dQw4w9WgXcQ", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Internal");
        let reporter = backend.last_reporter();
        assert!(reporter.is_closed());
        assert!(!reporter.send(WorkerEvent::Started).await);
    }

    #[tokio::test]
    async fn describe_validates_then_asks_the_backend() {
        let (service, _backend, store) = service_with(ScriptedBackend::default());
        let info = service
            .describe("https://youtu.be/dQw4w9WgXcQ", Some("SID=1".into()))
            .await
            .unwrap();
        assert_eq!(info.title, "Video dQw4w9WgXcQ");
        assert_eq!(info.thumbnail.as_deref(), Some("https://thumbs.test/SID=1.jpg"));
        assert!(store.is_empty());

        let blank = service
            .describe("https://youtu.be/dQw4w9WgXcQ", Some(" ".into()))
            .await
            .unwrap();
        assert!(blank.thumbnail.is_none());

        let err = service.describe("https://vimeo.com/1", None).await.unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[tokio::test]
    async fn describe_failure_is_reported_as_lookup_failure() {
        let (service, _backend, _store) = service_with(ScriptedBackend {
            refuse_dispatch: true,
            ..Default::default()
        });
        let err = service
            .describe("https://youtu.be/dQw4w9WgXcQ", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LookupFailed");
        assert!(err.to_string().contains("Private video"));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (service, _backend, _store) = service_with(ScriptedBackend::default());
        let id = JobId::parse("missing").unwrap();
        assert!(matches!(service.status(&id).await, Err(ServiceError::NotFound(_))));
        assert!(matches!(service.artifact(&id).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn delivery_failure_keeps_job_completed() {
        let (service, backend, _store) = service_with(ScriptedBackend {
            fail_delivery: true,
            ..Default::default()
        });
        let receipt = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        let reporter = backend.last_reporter();
        reporter.send(WorkerEvent::Started).await;
        reporter
            .send(WorkerEvent::Completed {
                artifact: mp3(),
                title: None,
            })
            .await;
        wait_for(&service, &receipt.id, |j| j.status().is_terminal()).await;

        let err = service.artifact(&receipt.id).await.unwrap_err();
        assert_eq!(err.code(), "DeliveryFailure");
        assert_eq!(
            service.status(&receipt.id).await.unwrap().status(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn purge_discards_artifacts_of_finished_jobs_only() {
        let (service, backend, store) = service_with(ScriptedBackend::default());
        let done = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        let reporter = backend.last_reporter();
        reporter.send(WorkerEvent::Started).await;
        reporter
            .send(WorkerEvent::Completed {
                artifact: mp3(),
                title: None,
            })
            .await;
        wait_for(&service, &done.id, |j| j.status().is_terminal()).await;
        let running = service.submit("https://youtu.be/dQw4w9WgXcQ", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        assert_eq!(service.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(service.purge_expired(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(backend.discarded.lock().as_slice(), &[mp3()]);
        assert!(service.status(&running.id).await.is_ok());
        assert_eq!(store.len(), 1);
    }
}
