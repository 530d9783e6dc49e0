//! Generation providers.
//!
//! Every provider implements [`GenerationProvider`]; the set is closed and
//! tagged by [`ProviderKind`]. Providers never retry on their own: errors are
//! classified and the generation workflow decides what to do with them.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::merge::{ContentFragment, InsertionStrategy};
use crate::resilience::{Classify, ErrorCategory};

pub mod claude;
pub mod handlers;
pub mod heygen;
pub mod metrics;
pub mod prompts;
pub mod runway;
#[cfg(test)]
pub mod scripted;
pub mod selector;
pub mod webhook;

pub use metrics::{Outcome, ProviderHealth, ProviderRecord};
pub use selector::{ProviderSelector, Selection, SelectionCriteria, SelectionError};
pub use webhook::{WebhookCompletion, WebhookHub};

// ────────────────────────────────────────────────────────────────────────────
// Provider vocabulary
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "heygen")]
    HeyGenLike,
    #[serde(rename = "runway")]
    RunwayLike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextEnhancement,
    VideoGeneration,
    AvatarVideo,
    Subtitles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// `submit` returns the finished result.
    Immediate,
    Polling { interval: Duration },
    /// The provider calls back through [`WebhookHub`].
    Webhook,
}

/// Where generated content lands in the job document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub strategy: InsertionStrategy,
    #[serde(default)]
    pub target_selector: Option<String>,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            strategy: InsertionStrategy::Append,
            target_selector: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub job_id: Uuid,
    pub instructions: String,
    /// Current document, for providers that work from the CV text.
    pub document_html: String,
    pub placement: Placement,
    /// Provider-specific knobs (`script`, `image_url`, `duration`, ...).
    pub options: Value,
}

impl GenerationRequest {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderJobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedVideo {
    pub url: String,
    pub poster_url: Option<String>,
}

/// What a finished provider job produced. Video providers only report media;
/// it becomes a fragment once paired with the request's placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub fragments: Vec<ContentFragment>,
    pub video: Option<GeneratedVideo>,
    /// Provider-reported quality in `0.0..=1.0`, when it has one.
    pub quality: Option<f64>,
}

impl GenerationOutput {
    pub fn with_video(video: GeneratedVideo) -> Self {
        Self {
            video: Some(video),
            ..Self::default()
        }
    }

    pub fn into_fragments(self, request: &GenerationRequest) -> Vec<ContentFragment> {
        let mut fragments = self.fragments;
        if let Some(video) = self.video {
            fragments.push(video_fragment(request, &video.url, video.poster_url.as_deref()));
        }
        fragments
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub state: ProviderJobState,
    pub progress: Option<u8>,
    pub output: Option<GenerationOutput>,
    pub error: Option<String>,
}

impl ProviderStatus {
    pub fn pending() -> Self {
        Self {
            state: ProviderJobState::Pending,
            progress: None,
            output: None,
            error: None,
        }
    }

    pub fn completed(output: GenerationOutput) -> Self {
        Self {
            state: ProviderJobState::Completed,
            progress: Some(100),
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: ProviderJobState::Failed,
            progress: None,
            output: None,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub provider_job_id: String,
    pub status: ProviderStatus,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("unexpected provider response: {0}")]
    Parse(String),

    #[error("provider returned empty content")]
    EmptyContent,

    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("provider job failed: {0}")]
    JobFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Classify for ProviderError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Http(e) => match e.status() {
                Some(status) => classify_status(status.as_u16(), None),
                None if e.is_decode() => ErrorCategory::ProviderUnavailable,
                None => ErrorCategory::Transient,
            },
            ProviderError::Api {
                status,
                retry_after,
                ..
            } => classify_status(*status, *retry_after),
            ProviderError::Timeout(_) => ErrorCategory::Transient,
            ProviderError::Parse(_) | ProviderError::EmptyContent | ProviderError::JobFailed(_) => {
                ErrorCategory::ProviderUnavailable
            }
            ProviderError::InvalidRequest(_) => ErrorCategory::Validation,
        }
    }
}

pub fn classify_status(status: u16, retry_after: Option<Duration>) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Authentication,
        429 => ErrorCategory::RateLimited {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        },
        502 | 503 => ErrorCategory::ProviderUnavailable,
        500..=599 => ErrorCategory::Transient,
        400..=499 => ErrorCategory::Validation,
        _ => ErrorCategory::Transient,
    }
}

/// Builds an [`ProviderError::Api`] from a non-success response, pulling the
/// message out of the common JSON error shapes.
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/message"))
                .or_else(|| v.pointer("/error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body);

    ProviderError::Api {
        status,
        message,
        retry_after,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Provider contract
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> &BTreeSet<Capability>;

    fn completion_mode(&self) -> CompletionMode;

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ProviderError>;

    async fn status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError>;

    /// Decodes a completion callback. Only webhook-capable providers override this.
    fn parse_webhook(&self, payload: &Value) -> Result<WebhookCompletion, ProviderError> {
        let _ = payload;
        Err(ProviderError::InvalidRequest(format!(
            "provider {} does not accept webhooks",
            self.id()
        )))
    }
}

/// Fragment id for a job's video introduction. Shared across providers so a
/// retried or failed-over generation never inserts a second video.
pub fn video_fragment_id(job_id: Uuid) -> String {
    format!("video-intro-{job_id}")
}

pub fn video_fragment(
    request: &GenerationRequest,
    video_url: &str,
    poster_url: Option<&str>,
) -> ContentFragment {
    let poster = poster_url
        .map(|p| format!(r#" poster="{}""#, escape_attr(p)))
        .unwrap_or_default();
    let content = format!(
        r#"<section class="video-intro"><video controls preload="metadata" src="{}"{poster}></video></section>"#,
        escape_attr(video_url)
    );

    ContentFragment {
        id: video_fragment_id(request.job_id),
        name: "Video introduction".to_string(),
        content,
        strategy: request.placement.strategy,
        target_selector: request.placement.target_selector.clone(),
    }
}

pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
