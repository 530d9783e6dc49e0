//! Runway-style image-to-video provider, completed by polling its task API.

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
    ProviderStatus, Submission,
};

const RUNWAY_API_URL: &str = "https://api.dev.runwayml.com";
const RUNWAY_VERSION: &str = "2024-11-06";
const MODEL: &str = "gen3a_turbo";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct RunwayProvider {
    id: String,
    client: Client,
    api_key: String,
    base_url: String,
    capabilities: BTreeSet<Capability>,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Task {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    failure: Option<String>,
}

impl RunwayProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            id: "runway".to_string(),
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            base_url: RUNWAY_API_URL.to_string(),
            capabilities: BTreeSet::from([Capability::VideoGeneration]),
        })
    }
}

fn task_body(request: &GenerationRequest) -> Result<Value, ProviderError> {
    let image = request.option_str("image_url").ok_or_else(|| {
        ProviderError::InvalidRequest("image-to-video needs an image_url option".to_string())
    })?;
    let duration = match request.options.get("duration").and_then(Value::as_u64) {
        Some(10) => 10,
        _ => 5,
    };

    Ok(json!({
        "model": MODEL,
        "promptImage": image,
        "promptText": request.instructions.trim(),
        "duration": duration,
        "ratio": "1280:768"
    }))
}

fn status_from(task: Task) -> ProviderStatus {
    let progress = task.progress.map(|p| (p.clamp(0.0, 1.0) * 100.0).round() as u8);
    match task.status.as_str() {
        "SUCCEEDED" => match task.output.and_then(|urls| urls.into_iter().next()) {
            Some(url) => ProviderStatus::completed(GenerationOutput::with_video(GeneratedVideo {
                url,
                poster_url: None,
            })),
            None => ProviderStatus::failed("task succeeded without output"),
        },
        "FAILED" | "CANCELLED" => {
            ProviderStatus::failed(task.failure.unwrap_or_else(|| task.status.to_lowercase()))
        }
        "RUNNING" => ProviderStatus {
            state: ProviderJobState::Processing,
            progress,
            output: None,
            error: None,
        },
        _ => ProviderStatus {
            progress,
            ..ProviderStatus::pending()
        },
    }
}

#[async_trait]
impl GenerationProvider for RunwayProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::RunwayLike
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Polling {
            interval: POLL_INTERVAL,
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ProviderError> {
        let body = task_body(request)?;
        let response = self
            .client
            .post(format!("{}/v1/image_to_video", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Runway-Version", RUNWAY_VERSION)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let task: CreatedTask = response.json().await?;
        debug!("Runway accepted task {} for job {}", task.id, request.job_id);
        Ok(Submission {
            provider_job_id: task.id,
            status: ProviderStatus::pending(),
        })
    }

    async fn status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1/tasks/{provider_job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Runway-Version", RUNWAY_VERSION)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let task: Task = response.json().await?;
        Ok(status_from(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Placement;
    use uuid::Uuid;

    fn request(options: Value) -> GenerationRequest {
        GenerationRequest {
            job_id: Uuid::nil(),
            instructions: " slow pan across the portrait ".to_string(),
            document_html: String::new(),
            placement: Placement::default(),
            options,
        }
    }

    #[test]
    fn test_task_body_requires_image() {
        assert!(matches!(
            task_body(&request(json!({}))),
            Err(ProviderError::InvalidRequest(_))
        ));

        let body = task_body(&request(json!({ "image_url": "https://cdn/me.png", "duration": 7 })))
            .unwrap();
        assert_eq!(body["promptImage"], "https://cdn/me.png");
        assert_eq!(body["promptText"], "slow pan across the portrait");
        assert_eq!(body["duration"], 5);
    }

    #[test]
    fn test_task_status_mapping() {
        let running = status_from(Task {
            status: "RUNNING".to_string(),
            progress: Some(0.42),
            output: None,
            failure: None,
        });
        assert_eq!(running.state, ProviderJobState::Processing);
        assert_eq!(running.progress, Some(42));

        let done = status_from(Task {
            status: "SUCCEEDED".to_string(),
            progress: Some(1.0),
            output: Some(vec!["https://cdn/out.mp4".to_string()]),
            failure: None,
        });
        assert_eq!(
            done.output.unwrap().video.unwrap().url,
            "https://cdn/out.mp4"
        );

        let cancelled = status_from(Task {
            status: "CANCELLED".to_string(),
            progress: None,
            output: None,
            failure: None,
        });
        assert_eq!(cancelled.state, ProviderJobState::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
    }
}
