//! Tool registry and executor.
//!
//! Tools are enumerated once at startup (built-ins first, then whatever
//! the external tool-protocol server advertises) and every call passes
//! through central schema validation before anything executes. Name
//! collisions prefer built-ins.
//!
//! Retry policy: idempotent tools (get/list/search) are retried freely on
//! transient failures; state-changing tools are retried only when the
//! request provably never left the process.

pub mod builtin;
pub mod mcp;

use crate::bus::{BusHandle, DeviceStateCache};
use crate::config::ToolsConfig;
use mcp::{McpCallError, McpClient};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid tool arguments: {0}")]
    InvalidArgs(String),
    #[error("Tool call timed out: {0}")]
    Timeout(String),
    #[error("Tool failed remotely: {0}")]
    RemoteFailure(String),
    #[error("Device is not reachable: {0}")]
    DeviceUnreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    External { server: String },
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON-schema-like object: `{type, properties, required}`.
    pub parameters: Value,
    pub source: ToolSource,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    pub correlation_id: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            name: name.into(),
            args,
            correlation_id: format!("call-{n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    pub duration_ms: u64,
}

/// Validate `args` against a tool's declared parameter schema.
///
/// Checks required keys, declared primitive types, and `enum` constraints.
/// Unknown keys pass through; external servers may accept more than they
/// declare.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(object) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (key, value) in object {
        let Some(declared) = properties.get(key) else {
            continue;
        };
        if let Some(kind) = declared.get("type").and_then(|t| t.as_str()) {
            let matches = match kind {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("argument '{key}' must be of type {kind}"));
            }
        }
        if let Some(allowed) = declared.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(format!(
                    "argument '{key}' must be one of {}",
                    serde_json::to_string(allowed).unwrap_or_default()
                ));
            }
        }
    }
    Ok(())
}

pub struct ToolExecutor {
    registry: RwLock<Vec<ToolDescriptor>>,
    mcp: Option<Arc<McpClient>>,
    pub(crate) devices: DeviceStateCache,
    pub(crate) bus: BusHandle,
    pub(crate) http: reqwest::Client,
    pub(crate) config: ToolsConfig,
}

impl ToolExecutor {
    pub fn new(
        config: ToolsConfig,
        devices: DeviceStateCache,
        bus: BusHandle,
        mcp: Option<Arc<McpClient>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.call_timeout_s))
            .build()
            .expect("reqwest client");
        Self {
            registry: RwLock::new(builtin::builtin_descriptors()),
            mcp,
            devices,
            bus,
            http,
            config,
        }
    }

    /// Merge externally discovered tools into the registry. Built-ins win
    /// name collisions; repeat discovery (reconnect) replaces the previous
    /// external set.
    pub fn merge_external(&self, discovered: Vec<ToolDescriptor>) {
        let mut registry = self.registry.write().unwrap();
        registry.retain(|t| t.source == ToolSource::Builtin);
        let mut added = 0;
        for tool in discovered {
            if registry.iter().any(|t| t.name == tool.name) {
                log::warn!(
                    "External tool '{}' collides with a built-in; keeping the built-in",
                    tool.name
                );
                continue;
            }
            registry.push(tool);
            added += 1;
        }
        log::info!("Tool registry: {} tools ({} external)", registry.len(), added);
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.read().unwrap().clone()
    }

    /// Tool definitions in provider function-calling format.
    pub fn provider_catalog(&self) -> Vec<Value> {
        self.registry
            .read()
            .unwrap()
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect()
    }

    fn find(&self, name: &str) -> Option<ToolDescriptor> {
        self.registry
            .read()
            .unwrap()
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Tools safe to retry on any transient failure.
    fn is_idempotent(name: &str) -> bool {
        name.starts_with("get_") || name.starts_with("list_") || name == "web_search"
    }

    /// Validate and run one tool call.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let descriptor = self
            .find(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        validate_args(&descriptor.parameters, &call.args).map_err(ToolError::InvalidArgs)?;

        let started = Instant::now();
        let max_attempts = self.config.retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatch(&descriptor, call).await {
                Ok(content) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    log::info!(
                        "Tool {} ({}) ok in {} ms",
                        call.name,
                        call.correlation_id,
                        duration_ms
                    );
                    return Ok(ToolResult {
                        success: true,
                        content,
                        duration_ms,
                    });
                }
                // The request never left the process, so even a
                // state-changing tool is safe to retry.
                Err(DispatchError::NotSent(reason)) => {
                    log::warn!("Tool {} not sent (attempt {}): {}", call.name, attempt, reason);
                    if attempt >= max_attempts {
                        return Err(ToolError::RemoteFailure(reason));
                    }
                }
                Err(DispatchError::Transient(e)) => {
                    log::warn!("Tool {} failed (attempt {}): {}", call.name, attempt, e);
                    if !Self::is_idempotent(&call.name) || attempt >= max_attempts {
                        return Err(e);
                    }
                }
                Err(DispatchError::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn dispatch(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCall,
    ) -> Result<String, DispatchError> {
        match &descriptor.source {
            ToolSource::Builtin => builtin::dispatch(self, &call.name, &call.args).await,
            ToolSource::External { server } => {
                let Some(mcp) = &self.mcp else {
                    return Err(DispatchError::Fatal(ToolError::RemoteFailure(format!(
                        "no connection to tool server '{server}'"
                    ))));
                };
                match mcp.call_tool(&call.name, call.args.clone()).await {
                    Ok(content) => Ok(content),
                    Err(McpCallError::NotSent(reason)) => Err(DispatchError::NotSent(reason)),
                    Err(McpCallError::Timeout) => Err(DispatchError::Transient(
                        ToolError::Timeout(call.name.clone()),
                    )),
                    Err(McpCallError::Remote(message)) => Err(DispatchError::Transient(
                        ToolError::RemoteFailure(message),
                    )),
                }
            }
        }
    }
}

/// Internal dispatch classification driving the retry policy.
pub(crate) enum DispatchError {
    /// Request never left the process.
    NotSent(String),
    /// Sent but failed in a way retry might fix.
    Transient(ToolError),
    /// Retrying cannot help (bad args, unreachable device, …).
    Fatal(ToolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "device": { "type": "string" },
                "state": { "type": "string", "enum": ["on", "off"] },
                "level": { "type": "integer" },
            },
            "required": ["device", "state"],
        })
    }

    #[test]
    fn missing_required_argument_rejected() {
        let err = validate_args(&schema(), &json!({ "state": "on" })).unwrap_err();
        assert!(err.contains("device"));
    }

    #[test]
    fn wrong_type_rejected() {
        let err =
            validate_args(&schema(), &json!({ "device": "lamp", "state": "on", "level": "high" }))
                .unwrap_err();
        assert!(err.contains("level"));
    }

    #[test]
    fn enum_constraint_enforced() {
        let err =
            validate_args(&schema(), &json!({ "device": "lamp", "state": "dim" })).unwrap_err();
        assert!(err.contains("state"));
    }

    #[test]
    fn valid_args_accepted() {
        assert!(validate_args(
            &schema(),
            &json!({ "device": "lamp", "state": "off", "level": 3 })
        )
        .is_ok());
    }

    #[test]
    fn non_object_args_rejected() {
        assert!(validate_args(&schema(), &json!("just a string")).is_err());
    }

    #[test]
    fn unknown_keys_pass_through() {
        assert!(validate_args(
            &schema(),
            &json!({ "device": "lamp", "state": "on", "extra": true })
        )
        .is_ok());
    }

    #[test]
    fn idempotence_classification() {
        assert!(ToolExecutor::is_idempotent("get_time"));
        assert!(ToolExecutor::is_idempotent("get_device_status"));
        assert!(ToolExecutor::is_idempotent("web_search"));
        assert!(ToolExecutor::is_idempotent("list_notes"));
        assert!(!ToolExecutor::is_idempotent("control_device"));
    }
}
