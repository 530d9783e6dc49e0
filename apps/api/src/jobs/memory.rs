//! In-memory job store used by the workflow tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::store::{JobStore, NewJob, StatusUpdate, StoreError};
use crate::merge::{self, ContentFragment, Document, MergeOutcome};
use crate::models::{Job, JobStatus};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(job);
        job.revision += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Created,
            progress: 0,
            payload: new_job.payload,
            document: Document::new(new_job.document_html),
            error_message: None,
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job.clone());
        Ok(job)
    }

    async fn fetch(&self, id: Uuid) -> Result<Job, StoreError> {
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, StoreError> {
        self.update(id, |job| {
            job.status = update.status;
            if let Some(progress) = update.progress {
                job.progress = progress;
            }
            job.error_message = update.error_message;
        })
    }

    async fn apply_fragment(
        &self,
        id: Uuid,
        fragment: &ContentFragment,
    ) -> Result<(Job, MergeOutcome), StoreError> {
        let current = self.fetch(id).await?;
        let outcome = merge::apply(&current.document, fragment);
        if outcome.is_duplicate() {
            return Ok((current, outcome));
        }
        let document = outcome.document.clone();
        let job = self.update(id, |job| job.document = document)?;
        Ok((job, outcome))
    }
}
