//! Router behavior: pattern bypass, provider tool loop, device scenarios.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voice_gateway_rs::bus::{BusHandle, DeviceState, DeviceStateCache, OutboundMessage};
use voice_gateway_rs::config::ToolsConfig;
use voice_gateway_rs::router::context::ConversationWindow;
use voice_gateway_rs::router::provider::{
    AiProvider, ChatMessage, ProviderError, ProviderReply, ProviderToolCall,
};
use voice_gateway_rs::router::{AiRouter, RouterError};
use voice_gateway_rs::tools::ToolExecutor;

/// Provider that records calls and plays back a script of replies.
struct ScriptedProvider {
    calls: Arc<AtomicUsize>,
    seen_messages: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    script: Mutex<Vec<ProviderReply>>,
}

impl ScriptedProvider {
    fn new(script: Vec<ProviderReply>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            seen_messages: Arc::new(Mutex::new(Vec::new())),
            script: Mutex::new(script),
        }
    }

    fn text_reply(text: &str) -> ProviderReply {
        ProviderReply {
            text: Some(text.to_string()),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
        }
    }

    fn tool_reply(name: &str, arguments: Value) -> ProviderReply {
        ProviderReply {
            text: None,
            tool_calls: vec![ProviderToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments: arguments.clone(),
                raw: json!({
                    "id": format!("call-{name}"),
                    "type": "function",
                    "function": { "name": name, "arguments": arguments.to_string() },
                }),
            }],
            finish_reason: "tool_calls".to_string(),
        }
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[Value],
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_messages.lock().unwrap().push(messages.to_vec());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(ProviderError::Protocol("script exhausted".into()));
        }
        Ok(script.remove(0))
    }
}

struct Fixture {
    router: AiRouter,
    provider_calls: Arc<AtomicUsize>,
    seen_messages: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    devices: DeviceStateCache,
    bus_rx: mpsc::Receiver<OutboundMessage>,
}

fn fixture(script: Vec<ProviderReply>) -> Fixture {
    let (bus_tx, bus_rx) = mpsc::channel(64);
    let bus = BusHandle::new(bus_tx, "voice".into(), "devices".into());
    let devices = DeviceStateCache::new();
    let executor = Arc::new(ToolExecutor::new(
        ToolsConfig::default(),
        devices.clone(),
        bus,
        None,
    ));

    let provider = ScriptedProvider::new(script);
    let provider_calls = provider.calls.clone();
    let seen_messages = provider.seen_messages.clone();
    let router = AiRouter::new(
        Box::new(provider),
        executor,
        ConversationWindow::new(20, Duration::from_secs(300)),
        4,
    );
    Fixture {
        router,
        provider_calls,
        seen_messages,
        devices,
        bus_rx,
    }
}

fn online(state: &str) -> DeviceState {
    DeviceState {
        available: true,
        state: Some(state.to_string()),
    }
}

fn offline() -> DeviceState {
    DeviceState {
        available: false,
        state: None,
    }
}

/// A literal pattern match must never reach the provider.
#[tokio::test]
async fn datetime_bypass_skips_provider() {
    let mut fx = fixture(vec![]);
    let cancel = CancellationToken::new();

    let response = fx.router.respond("what time is it", &cancel).await.unwrap();

    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(response.provider, "bypass");
    assert_eq!(response.tool_calls, vec!["get_time".to_string()]);
    assert!(response.text.starts_with("It's "));
    assert!(response.text.contains(':'), "expected a clock time: {}", response.text);
}

/// Device control with a reachable device: status check, command on the
/// bus, spoken confirmation.
#[tokio::test]
async fn device_control_dispatches_when_available() {
    let mut fx = fixture(vec![]);
    fx.devices.update("switch one", online("on"));
    let cancel = CancellationToken::new();

    let response = fx.router.respond("turn off switch one", &cancel).await.unwrap();

    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(response.text, "Switch One is off.");

    let command = fx.bus_rx.try_recv().expect("a device command was published");
    assert_eq!(command.topic, "devices/switch one/set");
    let payload: Value = serde_json::from_slice(&command.payload).unwrap();
    assert_eq!(payload["command"], "off");
}

/// Offline device: no command dispatched, spoken apology mentions offline.
#[tokio::test]
async fn offline_device_refused_with_apology() {
    let mut fx = fixture(vec![]);
    fx.devices.update("switch two", offline());
    let cancel = CancellationToken::new();

    let response = fx.router.respond("turn on switch two", &cancel).await.unwrap();

    assert!(response.text.contains("offline"), "got: {}", response.text);
    assert!(
        fx.bus_rx.try_recv().is_err(),
        "no command may be dispatched at an offline device"
    );
}

/// Unknown device (never reported on the bus) is treated as unreachable.
#[tokio::test]
async fn unknown_device_refused() {
    let mut fx = fixture(vec![]);
    let cancel = CancellationToken::new();

    let response = fx.router.respond("turn on the attic fan", &cancel).await.unwrap();
    assert!(response.text.contains("offline") || response.text.contains("couldn't reach"));
    assert!(fx.bus_rx.try_recv().is_err());
}

/// Unmatched input goes to the provider; tool calls loop until the model
/// produces terminal text.
#[tokio::test]
async fn provider_tool_loop_reaches_terminal_text() {
    let mut fx = fixture(vec![
        ScriptedProvider::tool_reply("get_time", json!({})),
        ScriptedProvider::text_reply("All done."),
    ]);
    let cancel = CancellationToken::new();

    let response = fx
        .router
        .respond("how long until my roast is ready", &cancel)
        .await
        .unwrap();

    assert_eq!(response.text, "All done.");
    assert_eq!(response.tool_calls, vec!["get_time".to_string()]);
    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 2);

    // The second provider call saw the tool result message.
    let second = &fx.seen_messages.lock().unwrap()[1];
    assert!(second.iter().any(|m| m.role == "tool"));
}

/// A tool failure becomes a tool-result message, not an error: the model
/// gets the chance to recover.
#[tokio::test]
async fn tool_failure_is_fed_back_to_the_model() {
    let mut fx = fixture(vec![
        ScriptedProvider::tool_reply("control_device", json!({ "device": "ghost", "state": "on" })),
        ScriptedProvider::text_reply("That device seems to be offline."),
    ]);
    let cancel = CancellationToken::new();

    let response = fx.router.respond("please warm up the ghost", &cancel).await.unwrap();
    assert_eq!(response.text, "That device seems to be offline.");

    let second = &fx.seen_messages.lock().unwrap()[1];
    let tool_message = second.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_message.content.as_ref().unwrap().contains("error"));
}

/// The provider cannot loop forever: the hop limit ends the session.
#[tokio::test]
async fn tool_hop_limit_enforced() {
    let script: Vec<ProviderReply> = (0..10)
        .map(|_| ScriptedProvider::tool_reply("get_time", json!({})))
        .collect();
    let mut fx = fixture(script);
    let cancel = CancellationToken::new();

    let err = fx
        .router
        .respond("what an odd request", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Exhausted(4)));
    // 1 initial + 4 hops
    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 5);
}

/// The conversation window carries earlier turns into the next one.
#[tokio::test]
async fn window_carries_prior_turns() {
    let mut fx = fixture(vec![
        ScriptedProvider::text_reply("A dragon it is."),
        ScriptedProvider::text_reply("The dragon was called Ember."),
    ]);
    let cancel = CancellationToken::new();

    fx.router.respond("tell me a story", &cancel).await.unwrap();
    fx.router.respond("name the dragon", &cancel).await.unwrap();

    let second = &fx.seen_messages.lock().unwrap()[1];
    let contents: Vec<_> = second.iter().filter_map(|m| m.content.clone()).collect();
    assert!(contents.iter().any(|c| c == "tell me a story"));
    assert!(contents.iter().any(|c| c == "A dragon it is."));
    assert!(contents.iter().any(|c| c == "name the dragon"));
}

/// Cancellation between hops surfaces as RouterError::Cancelled.
#[tokio::test]
async fn cancellation_checked_between_hops() {
    let mut fx = fixture(vec![ScriptedProvider::text_reply("too late")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx.router.respond("anything at all", &cancel).await.unwrap_err();
    assert!(matches!(err, RouterError::Cancelled));
    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 0);
}
