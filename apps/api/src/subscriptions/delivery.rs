//! Per-subscription delivery task.
//!
//! The upstream task pushes into an unbounded queue so one slow consumer never
//! stalls fan-out; this task coalesces changes within the debounce window and
//! forwards them over a bounded channel to the consumer.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::Job;
use crate::resilience::ErrorCategory;

#[derive(Debug, Clone)]
pub enum Notification {
    /// First message on every subscription: the cached snapshot, if any.
    Initial(Option<Arc<Job>>),
    Change(Arc<Job>),
    Error(SubscriptionFailure),
}

impl Notification {
    fn is_coalescable(&self) -> bool {
        matches!(self, Notification::Change(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionFailure {
    pub resource_id: String,
    pub reason: String,
    #[serde(flatten)]
    pub category: ErrorCategory,
    pub attempts: u32,
    /// The upstream stays down until `force_refresh`.
    pub degraded: bool,
}

/// Trailing-edge debounce: within `window` of the first pending change only
/// the latest is delivered. Non-change notifications flush the pending change
/// first and are then delivered as-is.
pub(crate) async fn run_delivery(
    mut input: mpsc::UnboundedReceiver<Notification>,
    output: mpsc::Sender<Notification>,
    window: Duration,
) {
    loop {
        let Some(first) = input.recv().await else {
            return;
        };

        if window.is_zero() || !first.is_coalescable() {
            if output.send(first).await.is_err() {
                return;
            }
            continue;
        }

        let mut pending = first;
        let mut follow_up = None;
        let mut input_closed = false;
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = input.recv() => match next {
                    Some(n) if n.is_coalescable() => pending = n,
                    Some(n) => {
                        follow_up = Some(n);
                        break;
                    }
                    None => {
                        input_closed = true;
                        break;
                    }
                },
                _ = &mut deadline => break,
            }
        }

        // Unsubscribed mid-window: nothing more is delivered.
        if input_closed {
            return;
        }
        if output.send(pending).await.is_err() {
            return;
        }
        if let Some(n) = follow_up {
            if output.send(n).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::subscriptions::memory::test_job;
    use uuid::Uuid;

    fn change(id: Uuid, revision: i64) -> Notification {
        Notification::Change(Arc::new(test_job(id, revision, JobStatus::Processing)))
    }

    fn revision(n: &Notification) -> i64 {
        match n {
            Notification::Change(job) => job.revision,
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_delivers_everything() {
        let id = Uuid::new_v4();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(run_delivery(in_rx, out_tx, Duration::ZERO));

        for r in 1..=3 {
            in_tx.send(change(id, r)).unwrap();
        }
        for r in 1..=3 {
            assert_eq!(revision(&out_rx.recv().await.unwrap()), r);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_delivers_last_only() {
        let id = Uuid::new_v4();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(run_delivery(in_rx, out_tx, Duration::from_millis(100)));

        for r in 1..=5 {
            in_tx.send(change(id, r)).unwrap();
        }
        assert_eq!(revision(&out_rx.recv().await.unwrap()), 5);

        tokio::time::sleep(Duration::from_millis(500)).await;
        in_tx.send(change(id, 6)).unwrap();
        assert_eq!(revision(&out_rx.recv().await.unwrap()), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_flushes_pending_change_first() {
        let id = Uuid::new_v4();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(run_delivery(in_rx, out_tx, Duration::from_secs(10)));

        in_tx.send(change(id, 1)).unwrap();
        in_tx
            .send(Notification::Error(SubscriptionFailure {
                resource_id: id.to_string(),
                reason: "boom".to_string(),
                category: ErrorCategory::Transient,
                attempts: 3,
                degraded: true,
            }))
            .unwrap();

        assert_eq!(revision(&out_rx.recv().await.unwrap()), 1);
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            Notification::Error(f) if f.degraded
        ));
    }
}
