//! Built-in tools: datetime, web search, and device control.
//!
//! Every built-in formats a natural-language answer suitable for TTS;
//! the pattern bypass hands these strings straight to the speaker.

use super::{DispatchError, ToolDescriptor, ToolError, ToolExecutor, ToolSource};
use serde_json::{json, Value};

pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "get_time".to_string(),
            description: "Get the current local time and date in a speakable format".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
            source: ToolSource::Builtin,
        },
        ToolDescriptor {
            name: "web_search".to_string(),
            description: "Search the web and summarize the top results".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"],
            }),
            source: ToolSource::Builtin,
        },
        ToolDescriptor {
            name: "get_device_status".to_string(),
            description: "Check whether a smart-home device is reachable and what state it is in"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device": {
                        "type": "string",
                        "description": "Device name, e.g. 'switch one'"
                    }
                },
                "required": ["device"],
            }),
            source: ToolSource::Builtin,
        },
        ToolDescriptor {
            name: "control_device".to_string(),
            description: "Turn a smart-home device on or off. Verifies the device is reachable \
                          before sending the command."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device": {
                        "type": "string",
                        "description": "Device name, e.g. 'switch one'"
                    },
                    "state": {
                        "type": "string",
                        "enum": ["on", "off"],
                        "description": "Target state"
                    }
                },
                "required": ["device", "state"],
            }),
            source: ToolSource::Builtin,
        },
    ]
}

pub(crate) async fn dispatch(
    executor: &ToolExecutor,
    name: &str,
    args: &Value,
) -> Result<String, DispatchError> {
    match name {
        "get_time" => Ok(get_time()),
        "web_search" => web_search(executor, args).await,
        "get_device_status" => Ok(get_device_status(executor, args)),
        "control_device" => control_device(executor, args),
        other => Err(DispatchError::Fatal(ToolError::NotFound(other.to_string()))),
    }
}

/// "It's 4:32 PM on Friday, August 1st."
pub fn get_time() -> String {
    let now = chrono::Local::now();
    format!(
        "It's {} on {}.",
        now.format("%-I:%M %p"),
        format_date(&now)
    )
}

fn format_date(now: &chrono::DateTime<chrono::Local>) -> String {
    use chrono::Datelike;
    let day = now.day();
    let suffix = match day {
        11..=13 => "th",
        _ => match day % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        },
    };
    format!("{}, {} {}{}", now.format("%A"), now.format("%B"), day, suffix)
}

async fn web_search(executor: &ToolExecutor, args: &Value) -> Result<String, DispatchError> {
    let query = args
        .get("query")
        .and_then(|q| q.as_str())
        .unwrap_or_default();
    let Some(endpoint) = &executor.config.search_endpoint else {
        return Err(DispatchError::Fatal(ToolError::RemoteFailure(
            "web search is not configured".into(),
        )));
    };

    let response = executor
        .http
        .get(endpoint.as_str())
        .query(&[("q", query), ("format", "json")])
        .send()
        .await
        .map_err(|e| DispatchError::Transient(ToolError::RemoteFailure(e.to_string())))?;

    if !response.status().is_success() {
        return Err(DispatchError::Transient(ToolError::RemoteFailure(format!(
            "search endpoint returned {}",
            response.status()
        ))));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| DispatchError::Transient(ToolError::RemoteFailure(e.to_string())))?;

    let results = body
        .get("results")
        .and_then(|r| r.as_array())
        .map(|r| r.as_slice())
        .unwrap_or_default();

    if results.is_empty() {
        return Ok(format!("I couldn't find anything about {query}."));
    }

    let mut summary = String::new();
    for result in results.iter().take(3) {
        let title = result.get("title").and_then(|t| t.as_str()).unwrap_or("");
        let content = result.get("content").and_then(|c| c.as_str()).unwrap_or("");
        if !title.is_empty() {
            summary.push_str(title);
            if !content.is_empty() {
                summary.push_str(": ");
                summary.push_str(content);
            }
            summary.push_str(". ");
        }
    }
    Ok(summary.trim().to_string())
}

fn get_device_status(executor: &ToolExecutor, args: &Value) -> String {
    let device = args
        .get("device")
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    match executor.devices.get(device) {
        Some(state) => json!({
            "ready": true,
            "available": state.available,
            "state": state.state,
        })
        .to_string(),
        None => json!({
            "ready": false,
            "available": false,
            "state": null,
        })
        .to_string(),
    }
}

fn control_device(executor: &ToolExecutor, args: &Value) -> Result<String, DispatchError> {
    let device = args
        .get("device")
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    let state = args
        .get("state")
        .and_then(|s| s.as_str())
        .unwrap_or_default();

    // Status check first: never dispatch a command at a device that is
    // absent or offline.
    let available = executor
        .devices
        .get(device)
        .map(|d| d.available)
        .unwrap_or(false);
    if !available {
        return Err(DispatchError::Fatal(ToolError::DeviceUnreachable(
            device.to_string(),
        )));
    }

    executor.bus.publish_device_command(device, state);
    log::info!("Device command: {} → {}", device, state);
    Ok(format!("{} is {}.", title_case(device), state))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
