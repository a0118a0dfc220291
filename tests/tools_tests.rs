//! Tool registry and executor: schema validation, collision policy,
//! device status semantics.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use voice_gateway_rs::bus::{BusHandle, DeviceState, DeviceStateCache, OutboundMessage};
use voice_gateway_rs::config::ToolsConfig;
use voice_gateway_rs::tools::{
    ToolCall, ToolDescriptor, ToolError, ToolExecutor, ToolSource,
};

struct Fixture {
    executor: ToolExecutor,
    devices: DeviceStateCache,
    bus_rx: mpsc::Receiver<OutboundMessage>,
}

fn fixture() -> Fixture {
    let (bus_tx, bus_rx) = mpsc::channel(64);
    let bus = BusHandle::new(bus_tx, "voice".into(), "devices".into());
    let devices = DeviceStateCache::new();
    let executor = ToolExecutor::new(ToolsConfig::default(), devices.clone(), bus, None);
    Fixture {
        executor,
        devices,
        bus_rx,
    }
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let fx = fixture();
    let err = fx
        .executor
        .execute(&ToolCall::new("summon_demon", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::NotFound(_)));
}

/// Arguments failing schema validation never reach the implementation.
#[tokio::test]
async fn invalid_args_rejected_before_dispatch() {
    let mut fx = fixture();
    fx.devices.update(
        "lamp",
        DeviceState {
            available: true,
            state: Some("off".into()),
        },
    );

    // "dim" is not in the state enum.
    let err = fx
        .executor
        .execute(&ToolCall::new(
            "control_device",
            json!({ "device": "lamp", "state": "dim" }),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::InvalidArgs(_)));

    // Missing required key.
    let err = fx
        .executor
        .execute(&ToolCall::new("control_device", json!({ "state": "on" })))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::InvalidArgs(_)));

    // Nothing was dispatched at the device either time.
    assert!(fx.bus_rx.try_recv().is_err());
}

#[tokio::test]
async fn get_time_executes_without_args() {
    let fx = fixture();
    let result = fx
        .executor
        .execute(&ToolCall::new("get_time", json!({})))
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.content.starts_with("It's "));
}

#[tokio::test]
async fn device_status_for_unknown_device() {
    let fx = fixture();
    let result = fx
        .executor
        .execute(&ToolCall::new(
            "get_device_status",
            json!({ "device": "nonexistent" }),
        ))
        .await
        .unwrap();
    let status: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(status["ready"], false);
    assert_eq!(status["available"], false);
}

#[tokio::test]
async fn device_status_for_known_device() {
    let fx = fixture();
    fx.devices.update(
        "switch one",
        DeviceState {
            available: true,
            state: Some("on".into()),
        },
    );
    let result = fx
        .executor
        .execute(&ToolCall::new(
            "get_device_status",
            json!({ "device": "Switch One" }),
        ))
        .await
        .unwrap();
    let status: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(status["ready"], true);
    assert_eq!(status["available"], true);
    assert_eq!(status["state"], "on");
}

#[tokio::test]
async fn control_offline_device_is_unreachable() {
    let mut fx = fixture();
    fx.devices.update(
        "heater",
        DeviceState {
            available: false,
            state: None,
        },
    );
    let err = fx
        .executor
        .execute(&ToolCall::new(
            "control_device",
            json!({ "device": "heater", "state": "on" }),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::DeviceUnreachable(_)));
    assert!(fx.bus_rx.try_recv().is_err(), "no command for offline device");
}

#[tokio::test]
async fn control_online_device_publishes_command() {
    let mut fx = fixture();
    fx.devices.update(
        "fan",
        DeviceState {
            available: true,
            state: Some("off".into()),
        },
    );
    let result = fx
        .executor
        .execute(&ToolCall::new(
            "control_device",
            json!({ "device": "fan", "state": "on" }),
        ))
        .await
        .unwrap();
    assert_eq!(result.content, "Fan is on.");

    let message = fx.bus_rx.try_recv().unwrap();
    assert_eq!(message.topic, "devices/fan/set");
}

#[test]
fn external_merge_prefers_builtins_on_collision() {
    let fx = fixture();
    let before = fx.executor.descriptors().len();

    fx.executor.merge_external(vec![
        ToolDescriptor {
            name: "get_time".to_string(), // collides with a built-in
            description: "an impostor".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
            source: ToolSource::External {
                server: "test".into(),
            },
        },
        ToolDescriptor {
            name: "play_music".to_string(),
            description: "play a song".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
            source: ToolSource::External {
                server: "test".into(),
            },
        },
    ]);

    let descriptors = fx.executor.descriptors();
    assert_eq!(descriptors.len(), before + 1);
    let get_time = descriptors.iter().find(|t| t.name == "get_time").unwrap();
    assert_eq!(get_time.source, ToolSource::Builtin);
    assert!(descriptors.iter().any(|t| t.name == "play_music"));
}

/// Re-discovery after a reconnect replaces the previous external set
/// instead of accumulating duplicates.
#[test]
fn rediscovery_replaces_external_set() {
    let fx = fixture();
    let external = |name: &str| ToolDescriptor {
        name: name.to_string(),
        description: String::new(),
        parameters: json!({ "type": "object", "properties": {} }),
        source: ToolSource::External {
            server: "test".into(),
        },
    };

    fx.executor.merge_external(vec![external("alpha"), external("beta")]);
    fx.executor.merge_external(vec![external("beta")]);

    let descriptors = fx.executor.descriptors();
    assert!(!descriptors.iter().any(|t| t.name == "alpha"));
    assert_eq!(descriptors.iter().filter(|t| t.name == "beta").count(), 1);
}

#[test]
fn provider_catalog_is_function_format() {
    let fx = fixture();
    let catalog = fx.executor.provider_catalog();
    assert!(!catalog.is_empty());
    for entry in &catalog {
        assert_eq!(entry["type"], "function");
        assert!(entry["function"]["name"].is_string());
        assert!(entry["function"]["parameters"].is_object());
    }
}
