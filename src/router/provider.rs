//! AI provider client (OpenAI-compatible chat completions).
//!
//! The same wire format covers a local llama server and a cloud provider;
//! which one answers is a config choice, not a code path.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider network error: {0}")]
    Network(String),
    #[error("Provider protocol error: {0}")]
    Protocol(String),
    #[error("Provider rate limited")]
    RateLimited,
    #[error("Provider requested unsupported tool: {0}")]
    UnsupportedTool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message that carries tool calls instead of text.
    pub fn assistant_tool_calls(tool_calls: Value) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result fed back into the loop.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Raw wire form, echoed back in the assistant message on the next hop.
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ProviderToolCall>,
    pub finish_reason: String,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ProviderReply, ProviderError>;
}

pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretBox<String>>,
}

impl OpenAiChatProvider {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<SecretBox<String>>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn parse_reply(body: &Value) -> Result<ProviderReply, ProviderError> {
        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::Protocol("response has no choices".into()))?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.trim().to_string());

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let id = call
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = call
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| ProviderError::Protocol("tool call without a name".into()))?
                    .to_string();
                // Arguments arrive as a JSON-encoded string.
                let arguments = call
                    .pointer("/function/arguments")
                    .and_then(|a| a.as_str())
                    .map(|raw| serde_json::from_str(raw).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                tool_calls.push(ProviderToolCall {
                    id,
                    name,
                    arguments,
                    raw: call.clone(),
                });
            }
        }

        let finish_reason = body
            .pointer("/choices/0/finish_reason")
            .and_then(|f| f.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(ProviderReply {
            text,
            tool_calls,
            finish_reason,
        })
    }
}

#[async_trait]
impl AiProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ProviderReply, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.7,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
            body["tool_choice"] = Value::String("auto".to_string());
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Protocol(format!(
                "provider returned {status}: {detail}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Self::parse_reply(&body)
    }
}
