//! Claude text enhancement provider.
//!
//! A single Messages API call per submission; completes synchronously and
//! returns one fragment per enhanced CV section.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    error_from_response, prompts, Capability, CompletionMode, GenerationOutput,
    GenerationProvider, GenerationRequest, ProviderError, ProviderKind, ProviderStatus,
    Submission,
};
use crate::merge::{ContentFragment, InsertionStrategy};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    /// Extracts the text content from the first text block.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct EnhancementResponse {
    sections: Vec<EnhancedSection>,
    #[serde(default)]
    quality: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EnhancedSection {
    name: String,
    html: String,
    #[serde(default)]
    strategy: Option<InsertionStrategy>,
    #[serde(default)]
    target_selector: Option<String>,
}

pub struct ClaudeProvider {
    id: String,
    client: Client,
    api_key: String,
    api_url: String,
    capabilities: BTreeSet<Capability>,
}

impl ClaudeProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            id: "claude".to_string(),
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            api_url: ANTHROPIC_API_URL.to_string(),
            capabilities: BTreeSet::from([Capability::TextEnhancement]),
        })
    }

    /// One call to the Messages API. Failures are returned classified, never retried here.
    pub async fn call(&self, prompt: &str, system: &str) -> Result<LlmResponse, ProviderError> {
        let request_body = AnthropicRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let llm_response: LlmResponse = response.json().await?;
        debug!(
            "LLM call succeeded: input_tokens={}, output_tokens={}",
            llm_response.usage.input_tokens, llm_response.usage.output_tokens
        );
        Ok(llm_response)
    }

    /// Calls the model and deserializes its text response as JSON.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        prompt: &str,
        system: &str,
    ) -> Result<T, ProviderError> {
        let response = self.call(prompt, system).await?;
        let text = response.text().ok_or(ProviderError::EmptyContent)?;
        parse_json(text)
    }
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ProviderError> {
    serde_json::from_str(strip_json_fences(text)).map_err(|e| ProviderError::Parse(e.to_string()))
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(stripped) = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
    else {
        return text;
    };
    let stripped = stripped.trim_start();
    stripped
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(stripped)
}

fn section_slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    slug.split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn into_output(
    request: &GenerationRequest,
    response: EnhancementResponse,
) -> Result<GenerationOutput, ProviderError> {
    let fragments: Vec<ContentFragment> = response
        .sections
        .into_iter()
        .filter(|s| !s.html.trim().is_empty())
        .enumerate()
        .map(|(index, section)| {
            let slug = section_slug(&section.name);
            let slug = if slug.is_empty() { format!("section-{index}") } else { slug };
            ContentFragment {
                id: format!("enhance-{}-{slug}", request.job_id),
                name: section.name,
                content: section.html,
                strategy: section.strategy.unwrap_or(request.placement.strategy),
                target_selector: section
                    .target_selector
                    .or_else(|| request.placement.target_selector.clone()),
            }
        })
        .collect();

    if fragments.is_empty() {
        return Err(ProviderError::EmptyContent);
    }
    Ok(GenerationOutput {
        fragments,
        video: None,
        quality: response.quality.map(|q| q.clamp(0.0, 1.0)),
    })
}

#[async_trait]
impl GenerationProvider for ClaudeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Immediate
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ProviderError> {
        if request.instructions.trim().is_empty() {
            return Err(ProviderError::InvalidRequest(
                "text enhancement needs instructions".to_string(),
            ));
        }

        let response: EnhancementResponse = self
            .call_json(
                &prompts::enhancement_prompt(request),
                &prompts::enhancement_system(),
            )
            .await?;
        let output = into_output(request, response)?;

        Ok(Submission {
            provider_job_id: format!("claude-{}", Uuid::new_v4()),
            status: ProviderStatus::completed(output),
        })
    }

    async fn status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        Err(ProviderError::InvalidRequest(format!(
            "{provider_job_id}: claude completes synchronously"
        )))
    }
}
