use crate::error::{AiErrorCode, AiResponseError};
use crate::stmb::profile::{FULL_MANUAL_API, FixedConnection};
use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub connection: FixedConnection,
    pub prompt: String,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    /// Provider body as received.
    pub raw: Value,
}

impl CompletionResponse {
    /// Provider-reported truncation, checked before any parsing.
    pub fn truncation(&self) -> Option<AiResponseError> {
        let finish = self
            .raw
            .pointer("/choices/0/finish_reason")
            .or_else(|| self.raw.get("finish_reason"))
            .or_else(|| self.raw.get("stop_reason"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if finish.contains("length") || finish.contains("max") {
            return Some(AiResponseError::new(
                AiErrorCode::ProviderTruncation,
                format!("model response was cut off by the provider (finish reason {finish:?}); raise the response length budget"),
                self.text.clone(),
            ));
        }
        if self.raw.get("truncated").and_then(Value::as_bool) == Some(true) {
            return Some(AiResponseError::new(
                AiErrorCode::ProviderTruncationFlag,
                "model response was flagged as truncated by the provider; raise the response length budget",
                self.text.clone(),
            ));
        }
        None
    }
}

/// One completion round-trip. Shared across side-prompt worker threads.
pub trait CompletionTransport: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    OpenAiCompatible,
    Anthropic,
    FullManual,
}

fn wire_for(api: &str) -> Wire {
    match api.trim().to_ascii_lowercase().as_str() {
        FULL_MANUAL_API => Wire::FullManual,
        "claude" | "anthropic" => Wire::Anthropic,
        _ => Wire::OpenAiCompatible,
    }
}

/// Blocking HTTP client for OpenAI-compatible chat completions, Anthropic
/// messages, and direct `full-manual` endpoints.
pub struct HttpTransport {
    client: Client,
    openai_base_url: String,
    anthropic_base_url: String,
    openai_api_key: Option<String>,
    anthropic_api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        openai_base_url: &str,
        anthropic_base_url: &str,
        openai_api_key: Option<String>,
        anthropic_api_key: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            openai_base_url: openai_base_url.trim_end_matches('/').to_string(),
            anthropic_base_url: anthropic_base_url.trim_end_matches('/').to_string(),
            openai_api_key,
            anthropic_api_key,
        })
    }

    fn openai_body(request: &CompletionRequest) -> Value {
        let conn = &request.connection;
        let mut body = json!({
            "model": conn.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": conn.temperature,
        });
        if let Some(max) = request.max_tokens.filter(|m| *m > 0) {
            let field = if conn.model.to_ascii_lowercase().contains("gpt-5") {
                "max_completion_tokens"
            } else {
                "max_tokens"
            };
            body[field] = json!(max);
        }
        body
    }

    fn send(&self, url: &str, body: &Value, auth: Auth<'_>) -> Result<Value> {
        let builder = self.client.post(url).json(body);
        let builder = match auth {
            Auth::Bearer(Some(key)) => builder.bearer_auth(key),
            Auth::Bearer(None) => builder,
            Auth::Anthropic(key) => builder
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };
        let response = builder
            .send()
            .with_context(|| format!("completion request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            bail!("completion request failed with status {status}: {detail}");
        }
        response
            .json::<Value>()
            .context("completion response was not JSON")
    }
}

enum Auth<'a> {
    Bearer(Option<&'a str>),
    Anthropic(&'a str),
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl CompletionTransport for HttpTransport {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let conn = &request.connection;
        let raw = match wire_for(&conn.api) {
            Wire::FullManual => {
                let endpoint = non_empty(conn.endpoint.as_deref())
                    .ok_or_else(|| anyhow!("full-manual connection requires an endpoint URL"))?;
                let key = non_empty(conn.api_key.as_deref());
                self.send(endpoint, &Self::openai_body(request), Auth::Bearer(key))?
            }
            Wire::Anthropic => {
                let key = non_empty(conn.api_key.as_deref())
                    .or(non_empty(self.anthropic_api_key.as_deref()))
                    .ok_or_else(|| anyhow!("no Anthropic API key configured"))?;
                let base = non_empty(conn.endpoint.as_deref()).unwrap_or(self.anthropic_base_url.as_str());
                let body = json!({
                    "model": conn.model,
                    "max_tokens": request.max_tokens.filter(|m| *m > 0).unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
                    "temperature": conn.temperature,
                    "messages": [{"role": "user", "content": request.prompt}],
                });
                let url = format!("{}/v1/messages", base.trim_end_matches('/'));
                self.send(&url, &body, Auth::Anthropic(key))?
            }
            Wire::OpenAiCompatible => {
                let key = non_empty(conn.api_key.as_deref()).or(non_empty(self.openai_api_key.as_deref()));
                let base = non_empty(conn.endpoint.as_deref()).unwrap_or(self.openai_base_url.as_str());
                let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
                self.send(&url, &Self::openai_body(request), Auth::Bearer(key))?
            }
        };
        Ok(CompletionResponse {
            text: extract_text(&raw).unwrap_or_default(),
            raw,
        })
    }
}

/// Plain text of the common completion shapes.
pub fn extract_text(raw: &Value) -> Option<String> {
    if let Some(content) = raw.pointer("/choices/0/message/content") {
        match content {
            Value::String(s) => return Some(s.clone()),
            Value::Array(parts) => {
                let chunks = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>();
                if !chunks.is_empty() {
                    return Some(chunks.join("\n"));
                }
            }
            _ => {}
        }
    }
    if let Some(text) = raw.get("completion").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = raw.pointer("/choices/0/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(blocks) = raw.get("content").and_then(Value::as_array) {
        return blocks
            .iter()
            .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|b| b.get("text").and_then(Value::as_str))
            .map(str::to_string);
    }
    raw.get("content").and_then(Value::as_str).map(str::to_string)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReplayEntry {
    Text(String),
    Scripted {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        raw: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Serves scripted responses in order. Each entry is a string, or an object
/// with `text`, `raw` (provider body), or `error` (transport failure).
pub struct ReplayTransport {
    queue: Mutex<VecDeque<ReplayEntry>>,
    prompts: Mutex<Vec<String>>,
}

impl ReplayTransport {
    pub fn from_value(value: Value) -> Result<Self> {
        let entries: Vec<ReplayEntry> =
            serde_json::from_value(value).context("replay responses must be a JSON array")?;
        Ok(Self {
            queue: Mutex::new(entries.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_value(value)
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl CompletionTransport for ReplayTransport {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let next = self
            .queue
            .lock()
            .map_err(|_| anyhow!("replay queue poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("replay responses exhausted"))?;
        match next {
            ReplayEntry::Text(text) => Ok(CompletionResponse {
                raw: Value::String(text.clone()),
                text,
            }),
            ReplayEntry::Scripted {
                error: Some(message),
                ..
            } => Err(anyhow!(message)),
            ReplayEntry::Scripted { text, raw, .. } => {
                let raw = raw.unwrap_or_else(|| json!({"content": text.clone().unwrap_or_default()}));
                let text = text.or_else(|| extract_text(&raw)).unwrap_or_default();
                Ok(CompletionResponse { text, raw })
            }
        }
    }
}
