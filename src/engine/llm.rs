//! Generation capability: configuration resolution and the HTTP client.
//!
//! The engine never decides what to write. It sends a role instruction and a
//! context bundle to an OpenAI-compatible chat-completions endpoint and
//! expects back a JSON file set:
//!
//! ```json
//! {"files": [{"path": "src/app.py", "content": "...", "mode": "replace"}],
//!  "rationale": "why"}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::acl::normalize_path;
use super::models::{ConfigSource, LlmConfig, LlmSettings, Role};
use crate::errors::GenerationError;
use crate::util::extract_json_object;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Pick the first complete layer: user, then project, then global.
pub fn resolve_llm_config(
    user: Option<&LlmSettings>,
    project: Option<&LlmSettings>,
    global: Option<&LlmSettings>,
) -> Option<LlmConfig> {
    [
        (ConfigSource::User, user),
        (ConfigSource::Project, project),
        (ConfigSource::Global, global),
    ]
    .into_iter()
    .find_map(|(source, layer)| {
        let layer = layer.filter(|l| l.is_complete())?;
        Some(LlmConfig {
            provider: if layer.provider.trim().is_empty() {
                "openai-compatible".to_string()
            } else {
                layer.provider.clone()
            },
            base_url: layer.base_url.trim().trim_end_matches('/').to_string(),
            api_key: layer.api_key.trim().to_string(),
            model: layer.model.trim().to_string(),
            temperature: layer.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: layer.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            source,
        })
    })
}

/// Keep the first and last four characters of a key.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace the whole file.
    #[default]
    Replace,
    /// Upsert a slice-marked block inside the file.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub rationale: String,
}

/// Request sent to the generation capability for one role step.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub role: Role,
    pub instruction: String,
    pub context: serde_json::Value,
    pub config: LlmConfig,
}

/// Parse the assistant's text into a file set. Anything that is not the
/// expected shape is `Malformed`; nothing is coerced.
///
/// Path legality is left to the role ACL so escaping paths surface as
/// `PathAccessDenied`.
pub fn parse_generation(text: &str) -> Result<Generation, GenerationError> {
    let json = extract_json_object(text)
        .ok_or_else(|| GenerationError::Malformed("no JSON object in response".to_string()))?;
    let generation: Generation = serde_json::from_str(&json)
        .map_err(|e| GenerationError::Malformed(format!("unexpected file-set shape: {}", e)))?;
    let mut seen = std::collections::HashSet::new();
    for file in &generation.files {
        let key = normalize_path(&file.path).unwrap_or_else(|| file.path.clone());
        if !seen.insert(key) {
            return Err(GenerationError::Malformed(format!(
                "duplicate file path '{}'",
                file.path
            )));
        }
    }
    Ok(generation)
}

/// Seam over the external generation capability.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpGenerationClient {
    client: reqwest::Client,
}

impl HttpGenerationClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("sliceforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn map_reqwest_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(err.to_string())
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let config = &request.config;
        let url = format!("{}/chat/completions", config.base_url);
        let body = json!({
            "model": config.model,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "messages": [
                {"role": "system", "content": request.instruction},
                {"role": "user", "content": request.context.to_string()},
            ],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GenerationError::Auth {
                status: status.as_u16(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GenerationError::Transport(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                body: crate::util::clamp_text(&body, 500),
            });
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(format!("invalid completion body: {}", e)))?;
        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Malformed("completion has no content".to_string()))?;
        parse_generation(&text)
    }
}

/// Check that an endpoint answers at all. Used when a configuration layer is
/// stored, not per call.
pub async fn probe_endpoint(base_url: &str, api_key: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    client
        .get(&url)
        .bearer_auth(api_key)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Endpoint {} is unreachable: {}", base_url, e))?;
    Ok(())
}
