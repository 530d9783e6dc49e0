//! `LISTEN/NOTIFY` change source for job rows.
//!
//! The `jobs_notify_change` trigger publishes the job id on `job_changes` after
//! every insert or update; each stream re-reads the row it cares about.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use super::source::{ChangeFeed, ChangeSource, ChangeStream, SourceError};
use crate::jobs::store::{fetch_job, StoreError};

pub const CHANGE_CHANNEL: &str = "job_changes";

#[derive(Clone)]
pub struct PgChangeSource {
    pool: PgPool,
}

impl PgChangeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn open_change_stream(&self, resource_id: &str) -> Result<ChangeStream, SourceError> {
        let job_id = Uuid::parse_str(resource_id)
            .map_err(|_| SourceError::InvalidResourceId(resource_id.to_string()))?;

        // Listen before the first read so no update can slip in between.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let current = fetch_job(&self.pool, job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;

        let (feed, stream) = ChangeStream::pair(32);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if feed.send(Ok(current)).await {
                pump(pool, listener, job_id, feed).await;
            }
            debug!("change listener for job {job_id} closed");
        });

        Ok(stream)
    }
}

async fn pump(pool: PgPool, mut listener: PgListener, job_id: Uuid, feed: ChangeFeed) {
    let wanted = job_id.to_string();

    loop {
        let notification = tokio::select! {
            _ = feed.closed() => return,
            n = listener.try_recv() => n,
        };

        match notification {
            Ok(Some(n)) if n.payload() != wanted => continue,
            Ok(Some(_)) => {}
            // Connection dropped; the listener reconnects on the next call but
            // anything published meanwhile is lost, so re-read the row.
            Ok(None) => warn!("change listener for job {job_id} lost its connection, resyncing"),
            Err(e) => {
                feed.send(Err(SourceError::Listener(e))).await;
                return;
            }
        }

        // Each wake-up reads the row as it is now. Updates landing between two
        // reads collapse into the later revision.
        let item = match fetch_job(&pool, job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(SourceError::Store(StoreError::NotFound(job_id))),
            Err(e) => Err(SourceError::Store(e)),
        };
        let failed = item.is_err();
        if !feed.send(item).await || failed {
            return;
        }
    }
}
