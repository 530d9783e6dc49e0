//! Scripted provider used by selector and workflow tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Capability, CompletionMode, GeneratedVideo, GenerationOutput, GenerationProvider,
    GenerationRequest, ProviderError, ProviderKind, ProviderStatus, Submission, WebhookCompletion,
};
use crate::merge::ContentFragment;

pub struct ScriptedProvider {
    id: String,
    kind: ProviderKind,
    capabilities: BTreeSet<Capability>,
    mode: CompletionMode,
    delay: Option<Duration>,
    submits: Mutex<VecDeque<Result<Submission, ProviderError>>>,
    statuses: Mutex<VecDeque<Result<ProviderStatus, ProviderError>>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(id: &str, kind: ProviderKind, capabilities: &[Capability], mode: CompletionMode) -> Self {
        Self {
            id: id.to_string(),
            kind,
            capabilities: capabilities.iter().copied().collect(),
            mode,
            delay: None,
            submits: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn text(id: &str) -> Self {
        Self::new(
            id,
            ProviderKind::Claude,
            &[Capability::TextEnhancement],
            CompletionMode::Immediate,
        )
    }

    pub fn video(id: &str) -> Self {
        Self::new(
            id,
            ProviderKind::HeyGenLike,
            &[Capability::VideoGeneration, Capability::AvatarVideo],
            CompletionMode::Polling {
                interval: Duration::from_secs(1),
            },
        )
    }

    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_submits(self, errors: impl IntoIterator<Item = ProviderError>) -> Self {
        self.submits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors.into_iter().map(Err));
        self
    }

    pub fn script_statuses(
        self,
        statuses: impl IntoIterator<Item = Result<ProviderStatus, ProviderError>>,
    ) -> Self {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(statuses);
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn video_output(&self) -> GenerationOutput {
        GenerationOutput::with_video(GeneratedVideo {
            url: format!("https://cdn.test/{}.mp4", self.id),
            poster_url: None,
        })
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn completion_mode(&self) -> CompletionMode {
        self.mode
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ProviderError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .submits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(result) = scripted {
            return result;
        }

        let provider_job_id = format!("{}-job-{call}", self.id);
        let status = match self.mode {
            CompletionMode::Immediate => ProviderStatus::completed(GenerationOutput {
                fragments: vec![ContentFragment {
                    id: format!("enhance-{}-summary", request.job_id),
                    name: "Summary".to_string(),
                    content: format!("<p>by {}</p>", self.id),
                    strategy: request.placement.strategy,
                    target_selector: request.placement.target_selector.clone(),
                }],
                video: None,
                quality: Some(0.9),
            }),
            _ => ProviderStatus::pending(),
        };
        Ok(Submission {
            provider_job_id,
            status,
        })
    }

    async fn status(&self, _provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| Ok(ProviderStatus::completed(self.video_output())))
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookCompletion, ProviderError> {
        let provider_job_id = payload
            .get("job")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidRequest("missing job".to_string()))?;
        Ok(WebhookCompletion {
            provider_job_id: provider_job_id.to_string(),
            status: ProviderStatus::completed(self.video_output()),
        })
    }
}
