//! AI routing: pattern bypass first, provider with tool-calling second.
//!
//! The bypass is a deliberate accuracy/latency choice, not a shortcut:
//! known intents (datetime, web search, device control) go straight to a
//! local tool in milliseconds and produce deterministic answers, where a
//! small local model takes seconds and picks the wrong tool often enough
//! to matter. Everything else goes to the provider with the tool catalog
//! and the conversation window, looping over returned tool calls until a
//! terminal text response or the hop limit.

pub mod context;
pub mod patterns;
pub mod prompts;
pub mod provider;

use crate::tools::{ToolCall, ToolError, ToolExecutor};
use context::ConversationWindow;
use patterns::BypassIntent;
use provider::{AiProvider, ChatMessage, ProviderError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("AI provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("No terminal response after {0} tool hops")]
    Exhausted(usize),
    #[error("Routing was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AiResponse {
    pub text: String,
    /// Names of the tools executed while producing this response.
    pub tool_calls: Vec<String>,
    pub finish_reason: String,
    pub provider: String,
    pub latency_ms: u64,
}

pub struct AiRouter {
    provider: Box<dyn AiProvider>,
    tools: Arc<ToolExecutor>,
    window: ConversationWindow,
    max_tool_hops: usize,
}

impl AiRouter {
    pub fn new(
        provider: Box<dyn AiProvider>,
        tools: Arc<ToolExecutor>,
        window: ConversationWindow,
        max_tool_hops: usize,
    ) -> Self {
        Self {
            provider,
            tools,
            window,
            max_tool_hops,
        }
    }

    /// Route one non-silent transcript to a spoken response.
    ///
    /// Cancellation is checked between hops, never mid-tool-call; a
    /// dispatched device command always runs to completion.
    pub async fn respond(
        &mut self,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> Result<AiResponse, RouterError> {
        let started = Instant::now();
        self.window.begin_turn();

        if let Some(intent) = patterns::match_intent(transcript) {
            log::info!("Pattern bypass: {:?}", intent);
            let response = self.run_bypass(intent, started).await;
            if let Ok(response) = &response {
                self.window.push(ChatMessage::user(transcript));
                self.window.push(ChatMessage::assistant(response.text.clone()));
            }
            return response;
        }

        let response = self.run_provider(transcript, cancel, started).await?;
        self.window.push(ChatMessage::user(transcript));
        self.window.push(ChatMessage::assistant(response.text.clone()));
        Ok(response)
    }

    pub fn clear_window(&mut self) {
        self.window.clear();
    }

    async fn run_bypass(
        &self,
        intent: BypassIntent,
        started: Instant,
    ) -> Result<AiResponse, RouterError> {
        let (call, tool_name) = match &intent {
            BypassIntent::Datetime => (ToolCall::new("get_time", json!({})), "get_time"),
            BypassIntent::WebSearch { query } => (
                ToolCall::new("web_search", json!({ "query": query })),
                "web_search",
            ),
            BypassIntent::DeviceControl { device, state } => (
                ToolCall::new(
                    "control_device",
                    json!({ "device": device, "state": state }),
                ),
                "control_device",
            ),
        };

        let text = match self.tools.execute(&call).await {
            Ok(result) => result.content,
            Err(e) => bypass_apology(&intent, &e),
        };

        Ok(AiResponse {
            text,
            tool_calls: vec![tool_name.to_string()],
            finish_reason: "bypass".to_string(),
            provider: "bypass".to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_provider(
        &self,
        transcript: &str,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<AiResponse, RouterError> {
        let mut messages = vec![ChatMessage::system(prompts::VOICE_ASSISTANT)];
        messages.extend(self.window.messages());
        messages.push(ChatMessage::user(transcript));

        let catalog = self.tools.provider_catalog();
        let mut executed: Vec<String> = Vec::new();
        let mut hops = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }

            let reply = self.provider.complete(&messages, &catalog).await?;

            if !reply.tool_calls.is_empty() {
                if hops >= self.max_tool_hops {
                    log::warn!(
                        "Provider still requesting tools after {} hops, giving up",
                        hops
                    );
                    return Err(RouterError::Exhausted(hops));
                }
                hops += 1;

                let raw: Vec<Value> = reply.tool_calls.iter().map(|c| c.raw.clone()).collect();
                messages.push(ChatMessage::assistant_tool_calls(Value::Array(raw)));

                for tool_call in &reply.tool_calls {
                    if cancel.is_cancelled() {
                        return Err(RouterError::Cancelled);
                    }
                    executed.push(tool_call.name.clone());
                    let call = if tool_call.id.is_empty() {
                        ToolCall::new(tool_call.name.clone(), tool_call.arguments.clone())
                    } else {
                        ToolCall {
                            name: tool_call.name.clone(),
                            args: tool_call.arguments.clone(),
                            correlation_id: tool_call.id.clone(),
                        }
                    };
                    // Errors go back to the model as tool results, not up
                    // the stack, so it can retry with corrected arguments or
                    // explain the failure.
                    let content = match self.tools.execute(&call).await {
                        Ok(result) => result.content,
                        Err(e) => json!({ "error": e.to_string() }).to_string(),
                    };
                    messages.push(ChatMessage::tool_result(call.correlation_id, content));
                }
                continue;
            }

            let Some(text) = reply.text else {
                return Err(RouterError::Provider(ProviderError::Protocol(
                    "provider returned neither text nor tool calls".into(),
                )));
            };

            return Ok(AiResponse {
                text,
                tool_calls: executed,
                finish_reason: reply.finish_reason,
                provider: self.provider.name().to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }
    }
}

/// Spoken fallback when a bypass tool fails. The session still produces a
/// response; the failure is in the words, not the pipeline.
fn bypass_apology(intent: &BypassIntent, error: &ToolError) -> String {
    match (intent, error) {
        (BypassIntent::DeviceControl { device, .. }, ToolError::DeviceUnreachable(_)) => {
            format!(
                "Sorry, {} looks offline right now, so I didn't send the command.",
                device
            )
        }
        (BypassIntent::DeviceControl { device, .. }, _) => {
            format!("Sorry, I couldn't reach {}.", device)
        }
        (BypassIntent::WebSearch { .. }, _) => {
            "Sorry, I couldn't reach the search service.".to_string()
        }
        (BypassIntent::Datetime, _) => "Sorry, I couldn't check the clock.".to_string(),
    }
}
