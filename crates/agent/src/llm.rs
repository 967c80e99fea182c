use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tandem_core::config::LlmConfig;
use tandem_core::domain::execution::TokenUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A tool invocation requested by the model, already normalised to one shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionOptions {
    /// Falls back to the client's configured temperature when unset.
    pub temperature: Option<f32>,
    /// Tool definitions as produced by `ToolRegistry::definitions`.
    pub tools: Vec<Value>,
    pub json_mode: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be understood: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError>;
}

/// Bounds every call of the wrapped client by a fixed deadline.
pub struct TimeoutLlm {
    inner: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl TimeoutLlm {
    pub fn new(inner: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl LlmClient for TimeoutLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(messages, options)).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(event_name = "llm.timeout", timeout_ms, "llm call timed out");
                Err(LlmError::Timeout { timeout_ms })
            }
        }
    }
}

/// OpenAI-compatible chat-completions adapter.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            base_url: config.effective_base_url().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|message| json!({"role": message.role.as_str(), "content": message.content}))
            .collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.temperature),
        });
        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|definition| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": definition["name"],
                            "description": definition["description"],
                            "parameters": definition["parameters"],
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if options.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&self.request_body(messages, options));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        debug!(event_name = "llm.request", model = %self.model, tools = options.tools.len());

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout { timeout_ms: 0 }
            } else {
                LlmError::Transport(error.to_string())
            }
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&text, 512) });
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;
        parse_chat_completion(&payload)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Extracts content, tool calls and usage from a chat-completions payload.
pub fn parse_chat_completion(payload: &Value) -> Result<Completion, LlmError> {
    let message = payload["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(index, raw)| normalize_tool_call(raw, index))
                .collect()
        })
        .unwrap_or_default();

    let usage_field = |key: &str| {
        payload["usage"][key].as_u64().and_then(|value| u32::try_from(value).ok()).unwrap_or(0)
    };

    Ok(Completion {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        usage: TokenUsage {
            prompt_tokens: usage_field("prompt_tokens"),
            completion_tokens: usage_field("completion_tokens"),
        },
    })
}

/// Accepts both `{function: {name, arguments}}` and `{name, arguments | input}`
/// shapes. String arguments are decoded as JSON; undecodable strings are kept
/// verbatim so schema validation rejects that single call.
pub fn normalize_tool_call(raw: &Value, index: usize) -> Option<ToolCall> {
    let function = raw.get("function").filter(|value| value.is_object()).unwrap_or(raw);
    let name = function["name"].as_str().filter(|name| !name.is_empty())?.to_string();
    let arguments = match function.get("arguments").or_else(|| function.get("input")) {
        Some(Value::String(encoded)) if encoded.trim().is_empty() => json!({}),
        Some(Value::String(encoded)) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.clone()))
        }
        Some(Value::Null) | None => json!({}),
        Some(other) => other.clone(),
    };
    let id = raw["id"].as_str().map(str::to_string).unwrap_or_else(|| format!("call_{index}"));
    Some(ToolCall { id, name, arguments })
}

/// Scripted client for tests and offline runs. Replies are served in order;
/// once the script is exhausted every call answers with a fixed text.
pub struct MockLlm {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, CompletionOptions)>>,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new(script: Vec<Result<Completion, LlmError>>) -> Self {
        Self { script: Mutex::new(script.into()), requests: Mutex::new(Vec::new()), delay: None }
    }

    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| Ok(Completion::text(*text))).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, reply: Result<Completion, LlmError>) {
        self.script.lock().await.push_back(reply);
    }

    pub async fn requests(&self) -> Vec<(Vec<ChatMessage>, CompletionOptions)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.requests.lock().await.push((messages.to_vec(), options.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::text("mock response")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{
        normalize_tool_call, parse_chat_completion, ChatMessage, CompletionOptions, LlmClient,
        LlmError, MockLlm, TimeoutLlm,
    };

    #[test]
    fn tool_call_shapes_normalise_to_one_record() {
        let openai = json!({
            "id": "call_a",
            "type": "function",
            "function": {
                "name": "check_therapist_availability",
                "arguments": "{\"therapist_id\":\"t-1\"}"
            }
        });
        let flat = json!({"name": "flag_risk", "input": {"severity": "low"}});
        let broken = json!({"function": {"name": "create_appointment", "arguments": "{not json"}});

        let first = normalize_tool_call(&openai, 0).expect("openai shape");
        assert_eq!(first.id, "call_a");
        assert_eq!(first.arguments, json!({"therapist_id": "t-1"}));

        let second = normalize_tool_call(&flat, 1).expect("flat shape");
        assert_eq!(second.id, "call_1");
        assert_eq!(second.name, "flag_risk");
        assert_eq!(second.arguments, json!({"severity": "low"}));

        let third = normalize_tool_call(&broken, 2).expect("kept for validation");
        assert_eq!(third.arguments, json!("{not json"));

        assert!(normalize_tool_call(&json!({"arguments": "{}"}), 3).is_none());
    }

    #[test]
    fn chat_completion_payload_is_parsed() {
        let payload = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "c1",
                    "function": {"name": "goal_progress", "arguments": "{}"}
                }]
            }}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30}
        });
        let completion = parse_chat_completion(&payload).expect("parse");
        assert_eq!(completion.content, "");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.usage.total(), 150);

        assert!(matches!(
            parse_chat_completion(&json!({"choices": []})),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn slow_client_surfaces_timeout() {
        let slow = Arc::new(MockLlm::replying(&["late"]).with_delay(Duration::from_millis(250)));
        let bounded = TimeoutLlm::new(slow, Duration::from_millis(20));

        let result =
            bounded.complete(&[ChatMessage::user("hello")], &CompletionOptions::default()).await;
        assert!(matches!(result, Err(LlmError::Timeout { timeout_ms: 20 })));
    }

    #[tokio::test]
    async fn mock_serves_script_then_default() {
        let mock = MockLlm::replying(&["first"]);
        let options = CompletionOptions::default();
        let messages = [ChatMessage::user("hi")];

        assert_eq!(mock.complete(&messages, &options).await.expect("first").content, "first");
        assert_eq!(
            mock.complete(&messages, &options).await.expect("default").content,
            "mock response"
        );
        assert_eq!(mock.requests().await.len(), 2);
    }
}
