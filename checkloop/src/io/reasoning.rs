//! Reasoning service client: OpenAI-compatible chat completions with JSON output.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::io::config::ReasoningConfig;

/// Failure of a reasoning-backed adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("reasoning service unavailable: {0}")]
    Transport(String),
    /// The service answered, but not with usable output.
    #[error("malformed output: {reason}")]
    Malformed { reason: String, raw: String },
}

impl AdapterError {
    pub fn raw(&self) -> &str {
        match self {
            AdapterError::Transport(_) => "",
            AdapterError::Malformed { raw, .. } => raw,
        }
    }
}

/// An inline image attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("read image {}", path.display()))?;
        let media_type = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("jpg" | "jpeg") => "image/jpeg",
            _ => "image/png",
        };
        Ok(Self {
            media_type: media_type.to_string(),
            data,
        })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, BASE64.encode(&self.data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReasoningRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<ImageInput>,
}

/// A reasoning service that answers with a JSON document.
pub trait ReasoningService {
    /// Return the raw JSON text of the reply, code fences removed.
    fn complete_json(&self, request: &ReasoningRequest) -> Result<String, AdapterError>;
}

impl<R: ReasoningService + ?Sized> ReasoningService for &R {
    fn complete_json(&self, request: &ReasoningRequest) -> Result<String, AdapterError> {
        (**self).complete_json(request)
    }
}

/// Chat completions client.
pub struct OpenAiChat {
    agent: ureq::Agent,
    api_url: String,
    model: String,
    api_key: Option<String>,
    max_completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiChat {
    /// Build a client; the key is read from `cfg.api_key_env` (after `.env` loading).
    pub fn from_config(cfg: &ReasoningConfig) -> Self {
        let api_key = env::var(&cfg.api_key_env).ok().filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            debug!(var = %cfg.api_key_env, "no API key set; sending unauthenticated requests");
        }
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(cfg.timeout_secs)))
            .build();
        Self {
            agent: config.into(),
            api_url: cfg.api_url.clone(),
            model: cfg.model.clone(),
            api_key,
            max_completion_tokens: cfg.max_completion_tokens,
        }
    }

    fn body(&self, request: &ReasoningRequest) -> Value {
        let mut content = vec![json!({"type": "text", "text": request.user})];
        content.extend(request.images.iter().map(|image| {
            json!({"type": "image_url", "image_url": {"url": image.data_url()}})
        }));
        json!({
            "model": self.model,
            "max_completion_tokens": self.max_completion_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": content},
            ],
        })
    }
}

impl ReasoningService for OpenAiChat {
    #[instrument(skip_all, fields(model = %self.model, images = request.images.len()))]
    fn complete_json(&self, request: &ReasoningRequest) -> Result<String, AdapterError> {
        let mut call = self
            .agent
            .post(&self.api_url)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            call = call.header("authorization", &format!("Bearer {key}"));
        }
        let response = call
            .send_json(&self.body(request))
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        let parsed: ChatResponse = response
            .into_body()
            .read_json()
            .map_err(|e| AdapterError::Transport(format!("unparseable response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(bytes = content.len(), "reasoning reply received");
        if content.trim().is_empty() {
            return Err(AdapterError::Malformed {
                reason: "empty reply".to_string(),
                raw: content,
            });
        }
        Ok(strip_code_fences(&content).to_string())
    }
}

/// Remove a surrounding Markdown code fence (with optional language tag).
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(nl) = rest.find('\n') else {
        return text;
    };
    let body = &rest[nl + 1..];
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Parse reply text as a JSON value, classifying failures as malformed output.
pub fn parse_json_reply(raw: &str) -> Result<Value, AdapterError> {
    serde_json::from_str(strip_code_fences(raw)).map_err(|e| AdapterError::Malformed {
        reason: format!("invalid JSON: {e}"),
        raw: raw.to_string(),
    })
}
