//! Execution Backends
//!
//! One backend per route:
//! - LocalModel -> [`OllamaBackend`] (`/api/chat` on a local Ollama server)
//! - CloudReasoning -> [`ClaudeBackend`] (Anthropic Messages API)
//! - StructuredData -> [`HttpQueryBackend`] (JSON POST to a query service)
//!
//! Backend failures are surfaced as `BackendUnavailable` and never retried.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::budget::TokenCounter;
use crate::error::{Result, RouterError};
use crate::router::Route;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One dispatch to a backend
#[derive(Debug, Clone)]
pub struct BackendRequest<'a> {
    pub task: &'a str,
    pub system_prompt: &'a str,
    /// Agent's opaque model configuration (`model`, `max_tokens`, `options`, ...)
    pub model_config: &'a serde_json::Value,
    pub use_tools: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl BackendResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: &BackendRequest<'_>) -> Result<BackendResponse>;
}

fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

async fn error_for_status(backend: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(RouterError::backend(backend, format!("HTTP {}: {}", status, snippet)))
}

fn transport_error(backend: &str, e: reqwest::Error) -> RouterError {
    RouterError::backend(backend, e.to_string())
}

// ----------------------------------------------------------------------
// Ollama
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Local model through Ollama's chat endpoint
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl ExecutionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn execute(&self, request: &BackendRequest<'_>) -> Result<BackendResponse> {
        let model = config_str(request.model_config, "model").unwrap_or(&self.model);

        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": request.system_prompt}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.task}));

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if let Some(options) = request.model_config.get("options") {
            body["options"] = options.clone();
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = error_for_status(self.name(), response).await?;
        let result: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        debug!("Ollama {} answered with {} tokens", model, result.eval_count);
        Ok(BackendResponse {
            content: result.message.content,
            model: model.to_string(),
            input_tokens: result.prompt_eval_count,
            output_tokens: result.eval_count,
        })
    }
}

// ----------------------------------------------------------------------
// Claude
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Cloud reasoning through the Anthropic Messages API
pub struct ClaudeBackend {
    client: Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
}

impl ClaudeBackend {
    pub fn new(api_key: Option<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            model: model.into(),
            api_url: ANTHROPIC_API_URL.to_string(),
        })
    }

    /// Point at a different Messages endpoint (proxies, tests)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn tool_definitions() -> serde_json::Value {
        serde_json::json!([
            {"type": "bash_20250124", "name": "bash"},
            {"type": "text_editor_20250124", "name": "str_replace_editor"}
        ])
    }

    fn render(blocks: Vec<ContentBlock>) -> String {
        blocks
            .into_iter()
            .filter_map(|block| match block.r#type.as_str() {
                "text" => block.text,
                "tool_use" => Some(format!(
                    "[tool_use {}: {}]",
                    block.name.unwrap_or_default(),
                    block.input.unwrap_or_default()
                )),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ExecutionBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn execute(&self, request: &BackendRequest<'_>) -> Result<BackendResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RouterError::backend(self.name(), "ANTHROPIC_API_KEY not configured"))?;

        let model = config_str(request.model_config, "model").unwrap_or(&self.model);
        let max_tokens = request
            .model_config
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(4096);

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": request.task}],
        });
        if !request.system_prompt.is_empty() {
            body["system"] = serde_json::Value::String(request.system_prompt.to_string());
        }
        if let Some(temperature) = request.model_config.get("temperature") {
            body["temperature"] = temperature.clone();
        }
        if request.use_tools {
            body["tools"] = Self::tool_definitions();
        }

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = error_for_status(self.name(), response).await?;
        let result: MessageResponse = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        info!(
            "Claude {}: {} in / {} out tokens",
            result.model, result.usage.input_tokens, result.usage.output_tokens
        );
        Ok(BackendResponse {
            content: Self::render(result.content),
            model: result.model,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
        })
    }
}

// ----------------------------------------------------------------------
// Structured data
// ----------------------------------------------------------------------

/// Structured-data queries through a JSON HTTP service
///
/// Posts `{query, system_prompt, config}`; a `result` string in the reply is
/// used as the answer, otherwise the whole reply is returned as JSON text.
pub struct HttpQueryBackend {
    client: Client,
    endpoint: Option<String>,
    counter: TokenCounter,
}

impl HttpQueryBackend {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint,
            counter: TokenCounter::default(),
        })
    }
}

#[async_trait]
impl ExecutionBackend for HttpQueryBackend {
    fn name(&self) -> &str {
        "structured-data"
    }

    async fn execute(&self, request: &BackendRequest<'_>) -> Result<BackendResponse> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| RouterError::backend(self.name(), "no query endpoint configured"))?;

        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({
                "query": request.task,
                "system_prompt": request.system_prompt,
                "config": request.model_config,
            }))
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = error_for_status(self.name(), response).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        let content = match value.get("result").and_then(|r| r.as_str()) {
            Some(text) => text.to_string(),
            None => serde_json::to_string_pretty(&value)?,
        };

        Ok(BackendResponse {
            input_tokens: self.counter.count(request.task),
            output_tokens: self.counter.count(&content),
            content,
            model: "structured-data".to_string(),
        })
    }
}

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// Route -> backend
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<Route, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: Route, backend: Arc<dyn ExecutionBackend>) {
        self.backends.insert(route, backend);
    }

    pub fn with(mut self, route: Route, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(route, backend);
        self
    }

    pub fn get(&self, route: Route) -> Result<Arc<dyn ExecutionBackend>> {
        self.backends
            .get(&route)
            .cloned()
            .ok_or_else(|| RouterError::backend(route.as_str(), "no backend registered for route"))
    }

    pub fn routes(&self) -> Vec<(Route, String)> {
        let mut routes: Vec<(Route, String)> = self
            .backends
            .iter()
            .map(|(route, backend)| (*route, backend.name().to_string()))
            .collect();
        routes.sort();
        routes
    }
}
