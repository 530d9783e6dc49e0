//! The remote change source contract.
//!
//! A source opens one `ChangeStream` per resource; the stream yields job
//! snapshots in emission order and stops producing once dropped or closed.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::jobs::store::StoreError;
use crate::models::Job;
use crate::resilience::{Classify, ErrorCategory};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid resource id '{0}'")]
    InvalidResourceId(String),

    #[error("change stream closed by the source")]
    Closed,

    #[error("opening change stream timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("listener error: {0}")]
    Listener(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for SourceError {
    fn category(&self) -> ErrorCategory {
        match self {
            SourceError::InvalidResourceId(_) => ErrorCategory::Validation,
            SourceError::Closed | SourceError::Timeout(_) => ErrorCategory::Transient,
            SourceError::Listener(e) => crate::jobs::store::classify_sqlx(e),
            SourceError::Store(e) => e.category(),
        }
    }
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn open_change_stream(&self, resource_id: &str) -> Result<ChangeStream, SourceError>;
}

/// Consumer side of a change stream.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<Job, SourceError>>,
    _guard: DropGuard,
}

/// Producer side, held by the source's pump task.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: mpsc::Sender<Result<Job, SourceError>>,
    closed: CancellationToken,
}

impl ChangeStream {
    pub fn pair(capacity: usize) -> (ChangeFeed, ChangeStream) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let feed = ChangeFeed {
            tx,
            closed: closed.clone(),
        };
        let stream = ChangeStream {
            rx,
            _guard: closed.drop_guard(),
        };
        (feed, stream)
    }

    /// Next change, or `None` once the source has stopped.
    pub async fn next(&mut self) -> Option<Result<Job, SourceError>> {
        self.rx.recv().await
    }

    pub fn close(self) {}
}

impl ChangeFeed {
    /// Returns false once the consumer is gone.
    pub async fn send(&self, item: Result<Job, SourceError>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }

    /// Resolves when the consumer drops or closes the stream.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}
