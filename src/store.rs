//! Job Store abstraction plus the in-memory implementation.
//!
//! The store is injected into the service; nothing in the crate keeps job
//! state in a global. Each `apply` is one atomic read-modify-write of a
//! single record, which is all the locking the protocol needs: the drain task
//! of a job is its only writer and every other caller only reads.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::job::{ConversionJob, JobId, WorkerEvent};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a freshly created job. Ids are never reused, so an existing
    /// record with the same id is an error rather than an overwrite.
    async fn insert(&self, job: ConversionJob) -> Result<(), StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<ConversionJob>, StoreError>;

    /// Applies a worker event and returns the updated job.
    async fn apply(&self, id: &JobId, event: WorkerEvent) -> Result<ConversionJob, StoreError>;

    /// Removes terminal jobs last updated before `cutoff` and returns them so
    /// the caller can release their artifacts.
    async fn remove_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversionJob>, StoreError>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, ConversionJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: ConversionJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(job.id()) {
            return Err(StoreError::Duplicate(job.id().clone()));
        }
        jobs.insert(job.id().clone(), job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<ConversionJob>, StoreError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn apply(&self, id: &JobId, event: WorkerEvent) -> Result<ConversionJob, StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::Missing(id.clone()))?;
        job.apply(event)?;
        Ok(job.clone())
    }

    async fn remove_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversionJob>, StoreError> {
        let mut jobs = self.jobs.lock();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.status().is_terminal() && job.updated_at() < cutoff)
            .map(|job| job.id().clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|id| jobs.remove(id))
            .collect())
    }
}
