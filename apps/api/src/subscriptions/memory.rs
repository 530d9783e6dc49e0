//! In-memory change source used by the registry tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::source::{ChangeFeed, ChangeSource, ChangeStream, SourceError};
use crate::merge::Document;
use crate::models::{Job, JobStatus};

pub fn test_job(id: Uuid, revision: i64, status: JobStatus) -> Job {
    Job {
        id,
        status,
        progress: 0,
        payload: json!({}),
        document: Document::new("<html><body><main></main></body></html>"),
        error_message: None,
        revision,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct MemorySource {
    opens: AtomicUsize,
    feeds: Mutex<HashMap<String, Vec<ChangeFeed>>>,
    scripted_failures: Mutex<VecDeque<SourceError>>,
    fail_all: Mutex<Option<fn() -> SourceError>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The next opens fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SourceError>) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }

    /// Every open fails until cleared with `None`.
    pub fn fail_always(&self, make: Option<fn() -> SourceError>) {
        *self.fail_all.lock().unwrap_or_else(PoisonError::into_inner) = make;
    }

    pub fn live_feeds(&self, resource_id: &str) -> usize {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = feeds.get_mut(resource_id) else {
            return 0;
        };
        list.retain(|feed| !feed.is_closed());
        list.len()
    }

    /// Waits until a stream for `resource_id` is open.
    pub async fn wait_for_feed(&self, resource_id: &str) {
        while self.live_feeds(resource_id) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    pub async fn emit(&self, resource_id: &str, job: Job) {
        for feed in self.snapshot_feeds(resource_id) {
            feed.send(Ok(job.clone())).await;
        }
    }

    pub async fn break_streams(&self, resource_id: &str, make: fn() -> SourceError) {
        for feed in self.snapshot_feeds(resource_id) {
            feed.send(Err(make())).await;
        }
    }

    fn snapshot_feeds(&self, resource_id: &str) -> Vec<ChangeFeed> {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds
            .get(resource_id)
            .map(|list| list.iter().filter(|f| !f.is_closed()).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn open_change_stream(&self, resource_id: &str) -> Result<ChangeStream, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self
            .scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(err);
        }
        if let Some(make) = *self.fail_all.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(make());
        }

        let (feed, stream) = ChangeStream::pair(64);
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource_id.to_string())
            .or_default()
            .push(feed);
        Ok(stream)
    }
}
