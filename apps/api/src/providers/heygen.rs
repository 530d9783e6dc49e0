//! HeyGen-style avatar video provider.
//!
//! Submits a talking-avatar render and learns about completion either by
//! polling `video_status.get` or, when a public callback base is configured,
//! through its webhook.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    error_from_response, Capability, CompletionMode, GeneratedVideo, GenerationOutput,
    GenerationProvider, GenerationRequest, ProviderError, ProviderJobState, ProviderKind,
    ProviderStatus, Submission, WebhookCompletion,
};

const HEYGEN_API_URL: &str = "https://api.heygen.com";
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// HeyGen rejects longer avatar scripts.
const MAX_SCRIPT_CHARS: usize = 1500;

#[derive(Debug, Clone)]
pub struct HeyGenConfig {
    pub api_key: String,
    pub avatar_id: String,
    pub voice_id: String,
    /// Public base URL of this service; enables webhook completion.
    pub callback_base_url: Option<String>,
}

pub struct HeyGenProvider {
    id: String,
    client: Client,
    base_url: String,
    config: HeyGenConfig,
    capabilities: BTreeSet<Capability>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Option<Value>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GenerateData {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl HeyGenProvider {
    pub fn new(config: HeyGenConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            id: "heygen".to_string(),
            client: Client::builder().timeout(timeout).build()?,
            base_url: HEYGEN_API_URL.to_string(),
            config,
            capabilities: BTreeSet::from([
                Capability::VideoGeneration,
                Capability::AvatarVideo,
                Capability::Subtitles,
            ]),
        })
    }

    fn callback_url(&self) -> Option<String> {
        self.config.callback_base_url.as_ref().map(|base| {
            format!("{}/api/v1/webhooks/{}", base.trim_end_matches('/'), self.id)
        })
    }

    fn generate_body(&self, request: &GenerationRequest) -> Result<Value, ProviderError> {
        let script = request
            .option_str("script")
            .unwrap_or(request.instructions.trim());
        if script.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "avatar video needs a script".to_string(),
            ));
        }
        let script: String = script.chars().take(MAX_SCRIPT_CHARS).collect();
        let subtitles = request
            .options
            .get("subtitles")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut body = json!({
            "video_inputs": [{
                "character": {
                    "type": "avatar",
                    "avatar_id": self.config.avatar_id,
                    "avatar_style": "normal"
                },
                "voice": {
                    "type": "text",
                    "input_text": script,
                    "voice_id": self.config.voice_id
                }
            }],
            "dimension": { "width": 1280, "height": 720 },
            "caption": subtitles,
            "callback_id": request.job_id.to_string()
        });
        if let Some(url) = self.callback_url() {
            body["callback_url"] = Value::String(url);
        }
        Ok(body)
    }
}

fn error_text(value: &Value) -> String {
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

fn status_from(data: StatusData) -> ProviderStatus {
    match data.status.as_str() {
        "completed" => match data.video_url {
            Some(url) => ProviderStatus::completed(GenerationOutput::with_video(GeneratedVideo {
                url,
                poster_url: data.thumbnail_url,
            })),
            None => ProviderStatus::failed("completed without a video url"),
        },
        "failed" => ProviderStatus::failed(
            data.error
                .as_ref()
                .map(error_text)
                .unwrap_or_else(|| "render failed".to_string()),
        ),
        "processing" => ProviderStatus {
            state: ProviderJobState::Processing,
            ..ProviderStatus::pending()
        },
        _ => ProviderStatus::pending(),
    }
}

#[async_trait]
impl GenerationProvider for HeyGenProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::HeyGenLike
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn completion_mode(&self) -> CompletionMode {
        if self.config.callback_base_url.is_some() {
            CompletionMode::Webhook
        } else {
            CompletionMode::Polling {
                interval: POLL_INTERVAL,
            }
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ProviderError> {
        let body = self.generate_body(request)?;
        let response = self
            .client
            .post(format!("{}/v2/video/generate", self.base_url))
            .header("X-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let envelope: Envelope<GenerateData> = response.json().await?;
        if let Some(err) = envelope.error.filter(|e| !e.is_null()) {
            return Err(ProviderError::Parse(error_text(&err)));
        }
        let data = envelope.data.ok_or(ProviderError::EmptyContent)?;

        debug!("HeyGen accepted video {} for job {}", data.video_id, request.job_id);
        Ok(Submission {
            provider_job_id: data.video_id,
            status: ProviderStatus::pending(),
        })
    }

    async fn status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1/video_status.get", self.base_url))
            .query(&[("video_id", provider_job_id)])
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let envelope: Envelope<StatusData> = response.json().await?;
        envelope
            .data
            .map(status_from)
            .ok_or(ProviderError::EmptyContent)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookCompletion, ProviderError> {
        let event_type = payload
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidRequest("missing event_type".to_string()))?;
        let data = payload
            .get("event_data")
            .ok_or_else(|| ProviderError::InvalidRequest("missing event_data".to_string()))?;
        let video_id = data
            .get("video_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidRequest("missing video_id".to_string()))?;

        let status = match event_type {
            "avatar_video.success" => status_from(StatusData {
                status: "completed".to_string(),
                video_url: data.get("url").and_then(Value::as_str).map(str::to_string),
                thumbnail_url: data
                    .get("thumbnail_url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error: None,
            }),
            "avatar_video.fail" => ProviderStatus::failed(
                data.get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("render failed"),
            ),
            other => {
                return Err(ProviderError::InvalidRequest(format!(
                    "unsupported event_type '{other}'"
                )))
            }
        };

        Ok(WebhookCompletion {
            provider_job_id: video_id.to_string(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Placement;
    use uuid::Uuid;

    fn provider(callback: Option<&str>) -> HeyGenProvider {
        HeyGenProvider::new(
            HeyGenConfig {
                api_key: "key".to_string(),
                avatar_id: "avatar".to_string(),
                voice_id: "voice".to_string(),
                callback_base_url: callback.map(str::to_string),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request(options: Value) -> GenerationRequest {
        GenerationRequest {
            job_id: Uuid::nil(),
            instructions: "Introduce the candidate".to_string(),
            document_html: String::new(),
            placement: Placement::default(),
            options,
        }
    }

    #[test]
    fn test_callback_base_switches_to_webhook_mode() {
        assert_eq!(
            provider(Some("https://cv.example/")).completion_mode(),
            CompletionMode::Webhook
        );
        assert!(matches!(
            provider(None).completion_mode(),
            CompletionMode::Polling { .. }
        ));
    }

    #[test]
    fn test_generate_body_prefers_script_option() {
        let body = provider(Some("https://cv.example/"))
            .generate_body(&request(json!({ "script": "Hi, I'm Ada.", "subtitles": false })))
            .unwrap();
        assert_eq!(
            body["video_inputs"][0]["voice"]["input_text"],
            "Hi, I'm Ada."
        );
        assert_eq!(body["caption"], false);
        assert_eq!(
            body["callback_url"],
            "https://cv.example/api/v1/webhooks/heygen"
        );
    }

    #[test]
    fn test_status_mapping() {
        let done = status_from(StatusData {
            status: "completed".to_string(),
            video_url: Some("https://cdn/v.mp4".to_string()),
            thumbnail_url: None,
            error: None,
        });
        assert_eq!(done.state, ProviderJobState::Completed);

        let failed = status_from(StatusData {
            status: "failed".to_string(),
            video_url: None,
            thumbnail_url: None,
            error: Some(json!({ "message": "avatar not found" })),
        });
        assert_eq!(failed.error.as_deref(), Some("avatar not found"));

        let waiting = status_from(StatusData {
            status: "waiting".to_string(),
            video_url: None,
            thumbnail_url: None,
            error: None,
        });
        assert_eq!(waiting.state, ProviderJobState::Pending);
    }

    #[test]
    fn test_parse_webhook_success() {
        let completion = provider(None)
            .parse_webhook(&json!({
                "event_type": "avatar_video.success",
                "event_data": { "video_id": "v1", "url": "https://cdn/v1.mp4" }
            }))
            .unwrap();
        assert_eq!(completion.provider_job_id, "v1");
        assert_eq!(completion.status.state, ProviderJobState::Completed);

        assert!(provider(None)
            .parse_webhook(&json!({ "event_type": "avatar_video.success" }))
            .is_err());
    }
}
