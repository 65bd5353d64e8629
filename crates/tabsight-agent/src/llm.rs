//! Language model capability shared by every pipeline stage
//!
//! Stages build an [`LlmRequest`] and hand it to an [`LlmCaller`], which owns
//! the timeout and transient-retry policy. The model itself sits behind the
//! [`LanguageModel`] trait: [`OpenAiModel`] talks to any OpenAI-compatible
//! endpoint, [`crate::scripted::ScriptedModel`] replays canned responses.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;

/// Pipeline stage a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    SemanticMap,
    Routing,
    Planning,
    CodeGeneration,
    Summary,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Purpose::SemanticMap => "semantic_map",
            Purpose::Routing => "routing",
            Purpose::Planning => "planning",
            Purpose::CodeGeneration => "code_generation",
            Purpose::Summary => "summary",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub purpose: Purpose,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// Shape of the expected JSON answer; requests JSON-object output when set
    pub response_schema: Option<String>,
    /// Extended reasoning before the final answer
    pub thinking: bool,
}

impl LlmRequest {
    pub fn new(purpose: Purpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: user.into(),
            }],
            response_schema: None,
            thinking: false,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.response_schema = Some(schema.into());
        self
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    /// Continue the conversation after a reply that needs correcting
    pub fn follow_up(&mut self, reply: impl Into<String>, correction: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: reply.into(),
        });
        self.messages.push(ChatMessage {
            role: Role::User,
            content: correction.into(),
        });
    }

    /// All user-authored text of the request
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// Network failures, timeouts, rate limits; worth retrying
    #[error("Transient LLM error: {0}")]
    Transient(String),

    #[error("LLM error: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

/// Call-site policy applied to every model call
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub transient_retries: u32,
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

impl From<&LlmConfig> for CallPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            transient_retries: config.transient_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Shared handle stages use to reach the model
#[derive(Clone)]
pub struct LlmCaller {
    model: Arc<dyn LanguageModel>,
    policy: CallPolicy,
}

impl LlmCaller {
    pub fn new(model: Arc<dyn LanguageModel>, policy: CallPolicy) -> Self {
        Self { model, policy }
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Call the model, retrying transient failures with linear backoff
    pub async fn call(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, self.model.complete(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Transient(format!(
                    "no response within {} s",
                    self.policy.timeout.as_secs()
                ))),
            };

            match result {
                Ok(text) => {
                    tracing::debug!(purpose = %request.purpose, chars = text.len(), "LLM response");
                    return Ok(text);
                }
                Err(err) if err.is_transient() && retry < self.policy.transient_retries => {
                    retry += 1;
                    tracing::warn!(
                        purpose = %request.purpose,
                        retry,
                        error = %err,
                        "Transient LLM error, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff * retry).await;
                }
                Err(err) => {
                    tracing::warn!(purpose = %request.purpose, error = %err, "LLM call failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Pull the JSON payload out of a model reply.
///
/// Handles fenced code blocks and prose around a single object.
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        return body.find("```").map_or(body, |end| &body[..end]).trim();
    }
    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

/// OpenAI-compatible chat completion model
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    thinking_model: String,
}

impl OpenAiModel {
    pub fn new(api_key: &str, config: &LlmConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &config.base_url {
            openai_config = openai_config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            thinking_model: config.thinking_model.clone(),
        }
    }

    fn messages(request: &LlmRequest) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let system = match &request.response_schema {
            Some(schema) => format!(
                "{}\n\nRespond with a single JSON object of this shape:\n{}",
                request.system, schema
            ),
            None => request.system.clone(),
        };

        let mut messages = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()?,
        )];
        for message in &request.messages {
            messages.push(match message.role {
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content.clone())
                        .build()?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content.clone())
                        .build()?,
                ),
            });
        }
        Ok(messages)
    }
}

fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => LlmError::Transient(e.to_string()),
        other => {
            let text = other.to_string();
            let lowered = text.to_ascii_lowercase();
            if ["rate limit", "overloaded", "timeout", "temporarily", "503", "502"]
                .iter()
                .any(|marker| lowered.contains(marker))
            {
                LlmError::Transient(text)
            } else {
                LlmError::Permanent(text)
            }
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let model = if request.thinking {
            &self.thinking_model
        } else {
            &self.model
        };

        let messages = Self::messages(request).map_err(classify)?;
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model.as_str()).messages(messages);
        if !request.thinking {
            // Reasoning models reject an explicit temperature
            args.temperature(0.0);
        }
        if request.response_schema.is_some() {
            args.response_format(ResponseFormat::JsonObject);
        }
        let chat_request = args.build().map_err(classify)?;

        tracing::debug!(purpose = %request.purpose, model = %model, "Calling chat completion");
        let response = self.client.chat().create(chat_request).await.map_err(classify)?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::Permanent("empty response from model".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: LlmError,
    }

    #[async_trait]
    impl LanguageModel for Flaky {
        async fn complete(&self, _request: &LlmRequest) -> Result<String, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok("{}".to_string())
            }
        }
    }

    fn policy(retries: u32) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            transient_retries: retries,
            backoff: Duration::from_millis(1),
        }
    }

    fn request() -> LlmRequest {
        LlmRequest::new(Purpose::Routing, "system", "query")
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let model = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: LlmError::Transient("connection reset".to_string()),
        });
        let caller = LlmCaller::new(model.clone(), policy(2));

        assert_eq!(caller.call(&request()).await.unwrap(), "{}");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let model = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: LlmError::Transient("connection reset".to_string()),
        });
        let caller = LlmCaller::new(model.clone(), policy(2));

        assert!(caller.call(&request()).await.unwrap_err().is_transient());
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_escalate_immediately() {
        let model = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: LlmError::Permanent("invalid api key".to_string()),
        });
        let caller = LlmCaller::new(model.clone(), policy(2));

        assert!(!caller.call(&request()).await.unwrap_err().is_transient());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Here it is: {\"a\": {\"b\": 2}} done"), "{\"a\": {\"b\": 2}}");
        assert_eq!(extract_json("  plain text  "), "plain text");
    }

    #[test]
    fn test_follow_up_keeps_user_text() {
        let mut request = request();
        request.follow_up("not json", "Reply with JSON only");

        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, Role::Assistant);
        assert_eq!(request.user_text(), "query\nReply with JSON only");
    }
}
