//! OpenRouter provider for multimodal chat-completion models.
//!
//! Speaks the OpenAI-compatible `/chat/completions` API in JSON mode. Video
//! and audio are sent inline as base64; prompt templates are read from
//! `<templates_dir>/<id>.v<version>.md`. Callers reserve a token from a shared
//! rate limiter before each call.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{InferenceProvider, InferenceRequest, ProviderError};
use crate::domain::PromptTemplate;

/// Default OpenRouter endpoint
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Provider settings, as found under `provider:` in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Normally supplied through `OPENROUTER_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Directory holding `<id>.v<version>.md` prompt templates
    #[serde(default)]
    pub templates_dir: PathBuf,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_burst() -> u32 {
    10
}
fn default_max_tokens() -> u32 {
    3000
}
fn default_temperature() -> f64 {
    0.3
}

impl Default for OpenRouterSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            templates_dir: PathBuf::new(),
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Token bucket shared by every call through one provider
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_second: f64,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
            capacity,
            refill_per_second: f64::from(requests_per_minute.max(1)) / 60.0,
        }
    }

    /// Wait until a request may proceed
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
                bucket.refilled_at = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Content {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    InputAudio { input_audio: AudioData },
}

#[derive(Debug, Serialize)]
struct MediaUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct AudioData {
    data: String,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenRouter HTTP provider
pub struct OpenRouterProvider {
    client: Client,
    settings: OpenRouterSettings,
    limiter: RateLimiter,
}

impl OpenRouterProvider {
    pub fn new(settings: OpenRouterSettings) -> Self {
        let limiter = RateLimiter::new(settings.requests_per_minute, settings.burst);
        Self {
            client: Client::new(),
            settings,
            limiter,
        }
    }

    fn template_path(&self, template: &PromptTemplate) -> PathBuf {
        self.settings
            .templates_dir
            .join(format!("{}.md", template.key()))
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("OPENROUTER_API_KEY is not set".to_string()))
    }

    async fn load_template(&self, template: &PromptTemplate) -> Result<String, ProviderError> {
        let path = self.template_path(template);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            ProviderError::Config(format!(
                "Prompt template '{}' unreadable at {}: {}",
                template.key(),
                path.display(),
                e
            ))
        })
    }

    fn build_content(&self, prompt: String, request: &InferenceRequest) -> Vec<Content> {
        let engine = base64::engine::general_purpose::STANDARD;
        let inputs = &request.inputs;

        let mut text = prompt;
        if let Some(transcript) = &inputs.transcript {
            text.push_str("\n\n## Transcript\n");
            text.push_str(transcript);
        }
        if let Some(prior) = &inputs.prior {
            text.push_str("\n\n## Prior analysis\n");
            text.push_str(&prior.to_string());
        }
        text.push_str("\n\nRespond with a single JSON object.");

        let mut content = vec![Content::Text { text }];
        if let Some(video) = &inputs.video {
            content.push(Content::ImageUrl {
                image_url: MediaUrl {
                    url: format!("data:video/mp4;base64,{}", engine.encode(video)),
                },
            });
        }
        if let Some(audio) = &inputs.audio {
            content.push(Content::InputAudio {
                input_audio: AudioData {
                    data: engine.encode(audio),
                    format: "mp3",
                },
            });
        }
        content
    }
}

#[async_trait]
impl InferenceProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn reserve(&self) {
        self.limiter.acquire().await;
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value, ProviderError> {
        let api_key = self.api_key()?;
        let prompt = self.load_template(&request.template).await?;

        let body = ChatRequest {
            model: &request.model,
            messages: vec![Message {
                role: "user",
                content: self.build_content(prompt, request),
            }],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        debug!(task = %request.task, model = %request.model, "Sending chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Config(format!(
                "Provider rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transport(format!(
                "HTTP {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedOutput(format!("Invalid response body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::MalformedOutput("Empty completion".to_string()))?;

        parse_json_object(&content)
    }

    async fn preflight(&self, templates: &[&PromptTemplate]) -> Result<(), ProviderError> {
        self.api_key()?;

        for template in templates {
            let path = self.template_path(template);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ProviderError::Config(format!(
                    "Missing prompt template '{}' at {}",
                    template.key(),
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

/// Parse model output as a JSON object, tolerating a Markdown code fence
fn parse_json_object(content: &str) -> Result<serde_json::Value, ProviderError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedOutput(format!("Not valid JSON: {}", e)))?;

    if !value.is_object() {
        return Err(ProviderError::MalformedOutput(
            "Top-level value is not an object".to_string(),
        ));
    }

    Ok(value)
}
