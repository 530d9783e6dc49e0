use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::merge::{self, ContentFragment, MergeOutcome};
use crate::models::job::UnknownStatus;
use crate::models::{Job, JobRow, JobStatus};
use crate::resilience::{Classify, ErrorCategory};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job row: {0}")]
    Corrupt(#[from] UnknownStatus),
}

impl Classify for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            StoreError::NotFound(_) | StoreError::Corrupt(_) => ErrorCategory::Validation,
            StoreError::Database(e) => classify_sqlx(e),
        }
    }
}

/// Maps a sqlx error onto the retry taxonomy using the Postgres SQLSTATE class
/// where one is available.
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorCategory {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("28000") | Some("28P01") => ErrorCategory::Authentication,
            Some(code) if code.starts_with("22") || code.starts_with("23") => {
                ErrorCategory::Validation
            }
            Some(code) if code.starts_with("57") => ErrorCategory::ProviderUnavailable,
            _ => ErrorCategory::Transient,
        },
        sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            ErrorCategory::Validation
        }
        sqlx::Error::Configuration(_) => ErrorCategory::Authentication,
        _ => ErrorCategory::Transient,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub document_html: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            error_message: None,
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Persistence for jobs. Every successful write is observable through the
/// change source.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    async fn fetch(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, StoreError>;

    /// Merges `fragment` into the stored document atomically. A fragment that
    /// was already applied leaves the row untouched.
    async fn apply_fragment(
        &self,
        id: Uuid,
        fragment: &ContentFragment,
    ) -> Result<(Job, MergeOutcome), StoreError>;
}

pub async fn fetch_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Job::try_from).transpose()?)
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        let payload = if new_job.payload.is_null() {
            Value::Object(Default::default())
        } else {
            new_job.payload
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, status, payload, document_html)
            VALUES ($1, 'created', $2, $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&payload)
        .bind(&new_job.document_html)
        .fetch_one(&self.pool)
        .await?;

        info!("Created job {id}");
        Ok(Job::try_from(row)?)
    }

    async fn fetch(&self, id: Uuid) -> Result<Job, StoreError> {
        fetch_job(&self.pool, id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $2,
                progress = COALESCE($3, progress),
                error_message = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.progress.map(i16::from))
        .bind(&update.error_message)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        debug!("Job {id} is now {}", update.status);
        Ok(Job::try_from(row)?)
    }

    async fn apply_fragment(
        &self,
        id: Uuid,
        fragment: &ContentFragment,
    ) -> Result<(Job, MergeOutcome), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let current = Job::try_from(row)?;

        let outcome = merge::apply(&current.document, fragment);
        if outcome.is_duplicate() {
            tx.rollback().await?;
            debug!("Fragment {} already applied to job {id}", fragment.id);
            return Ok((current, outcome));
        }

        let applied: Vec<String> = outcome.document.applied_fragments.iter().cloned().collect();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET document_html = $2,
                applied_fragments = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&outcome.document.html)
        .bind(&applied)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Applied fragment {} to job {id}", fragment.id);
        Ok((Job::try_from(row)?, outcome))
    }
}
