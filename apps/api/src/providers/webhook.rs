//! Pairs provider completion callbacks with the workflows waiting on them.
//!
//! Callbacks can arrive before the workflow registers (fast providers, or a
//! restart between submit and wait); those are buffered for a while.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ProviderStatus;

const EARLY_TTL: Duration = Duration::from_secs(3600);
const MAX_EARLY: usize = 1024;

#[derive(Debug, Clone)]
pub struct WebhookCompletion {
    pub provider_job_id: String,
    pub status: ProviderStatus,
}

type Key = (String, String);

#[derive(Default)]
struct HubState {
    waiters: HashMap<Key, oneshot::Sender<ProviderStatus>>,
    early: HashMap<Key, (Instant, ProviderStatus)>,
}

#[derive(Default)]
pub struct WebhookHub {
    state: Mutex<HubState>,
}

impl WebhookHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once the provider reports a terminal status for the job.
    pub fn register(
        &self,
        provider_id: &str,
        provider_job_id: &str,
    ) -> oneshot::Receiver<ProviderStatus> {
        let key = (provider_id.to_string(), provider_job_id.to_string());
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((_, status)) = state.early.remove(&key) {
            debug!("delivering buffered webhook for {provider_id}/{provider_job_id}");
            let _ = tx.send(status);
        } else {
            state.waiters.insert(key, tx);
        }
        rx
    }

    pub fn cancel(&self, provider_id: &str, provider_job_id: &str) {
        let key = (provider_id.to_string(), provider_job_id.to_string());
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .remove(&key);
    }

    /// Returns true when a waiting workflow received the completion.
    pub fn complete(&self, provider_id: &str, completion: WebhookCompletion) -> bool {
        let key = (provider_id.to_string(), completion.provider_job_id);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(waiter) = state.waiters.remove(&key) {
            if waiter.send(completion.status.clone()).is_ok() {
                return true;
            }
        }

        let now = Instant::now();
        state
            .early
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < EARLY_TTL);
        if state.early.len() >= MAX_EARLY {
            warn!("webhook buffer full, dropping completion for {}/{}", key.0, key.1);
            return false;
        }
        state.early.insert(key, (now, completion.status));
        false
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GeneratedVideo, GenerationOutput};

    fn done() -> WebhookCompletion {
        WebhookCompletion {
            provider_job_id: "vid-1".to_string(),
            status: ProviderStatus::completed(GenerationOutput::with_video(GeneratedVideo {
                url: "https://cdn/v.mp4".to_string(),
                poster_url: None,
            })),
        }
    }

    #[tokio::test]
    async fn test_completion_reaches_registered_waiter() {
        let hub = WebhookHub::new();
        let rx = hub.register("heygen", "vid-1");
        assert_eq!(hub.pending(), 1);

        assert!(hub.complete("heygen", done()));
        let status = rx.await.unwrap();
        assert!(status.output.unwrap().video.is_some());
        assert_eq!(hub.pending(), 0);
    }

    #[tokio::test]
    async fn test_early_completion_is_buffered() {
        let hub = WebhookHub::new();
        assert!(!hub.complete("heygen", done()));

        let status = hub.register("heygen", "vid-1").await.unwrap();
        assert!(status.output.is_some());
    }

    #[tokio::test]
    async fn test_completion_for_other_provider_does_not_match() {
        let hub = WebhookHub::new();
        let mut rx = hub.register("heygen", "vid-1");
        assert!(!hub.complete("runway", done()));
        assert!(rx.try_recv().is_err());
    }
}
