//! Event bus adapter (MQTT).
//!
//! A single task owns the broker connection and serializes every publish,
//! which is what guarantees the per-session ordering of `session_started`,
//! `voice/req`, `voice/res`, `session_ended`. Inbound traffic is the
//! control topic and retained device-state topics; the latter feed the
//! cache the device tools consult.
//!
//! While the broker is unreachable, non-retained publishes buffer in a
//! bounded drop-oldest queue; the retained status is re-published on every
//! reconnect so late observers always learn the current state.

use crate::config::BusConfig;
use crate::health::HealthState;
use crate::orchestrator::events::{ControlCommand, OrchestratorEvent, SessionId};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Last known state of one controllable device.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub available: bool,
    pub state: Option<String>,
}

/// Shared cache of device states, keyed by lowercased device name.
#[derive(Clone, Default)]
pub struct DeviceStateCache(Arc<RwLock<HashMap<String, DeviceState>>>);

impl DeviceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str) -> Option<DeviceState> {
        self.0.read().unwrap().get(&normalize(device)).cloned()
    }

    pub fn update(&self, device: &str, state: DeviceState) {
        self.0.write().unwrap().insert(normalize(device), state);
    }
}

fn normalize(device: &str) -> String {
    device.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cloneable publisher used by the orchestrator and the device tools.
///
/// Sends never block; if the bus task has fallen impossibly far behind the
/// message is dropped with a log line rather than stalling a state
/// transition.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<OutboundMessage>,
    topic_prefix: String,
    device_command_prefix: String,
}

impl BusHandle {
    pub fn new(
        tx: mpsc::Sender<OutboundMessage>,
        topic_prefix: String,
        device_command_prefix: String,
    ) -> Self {
        Self {
            tx,
            topic_prefix,
            device_command_prefix,
        }
    }

    fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.tx.try_send(message) {
            log::warn!("Bus queue full, dropping publish: {}", e);
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic_prefix, suffix)
    }

    /// Retained gateway status (`initializing | ready | listening | …`).
    pub fn publish_status(&self, status: &str, session: Option<&SessionId>) {
        let payload = json!({
            "status": status,
            "session_id": session.map(|s| s.to_string()),
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: self.topic("status"),
            payload: payload.to_string().into_bytes(),
            retained: true,
        });
    }

    /// Granular state transition on `voice/events`.
    pub fn publish_transition(
        &self,
        from: &str,
        to: &str,
        reason: &str,
        session: Option<&SessionId>,
    ) {
        let payload = json!({
            "from": from,
            "to": to,
            "reason": reason,
            "session_id": session.map(|s| s.to_string()),
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: self.topic("events"),
            payload: payload.to_string().into_bytes(),
            retained: false,
        });
    }

    /// Session lifecycle record on `voice/events`.
    pub fn publish_session_event(&self, kind: &str, session: &SessionId) {
        let payload = json!({
            "event": kind,
            "session_id": session.to_string(),
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: self.topic("events"),
            payload: payload.to_string().into_bytes(),
            retained: false,
        });
    }

    /// Transcribed user request on `voice/req`.
    pub fn publish_request(&self, session: &SessionId, text: &str) {
        let payload = json!({
            "text": text,
            "session_id": session.to_string(),
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: self.topic("req"),
            payload: payload.to_string().into_bytes(),
            retained: false,
        });
    }

    /// Final assistant response on `voice/res` (published even when TTS
    /// later fails).
    pub fn publish_response(&self, session: &SessionId, text: &str) {
        let payload = json!({
            "text": text,
            "session_id": session.to_string(),
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: self.topic("res"),
            payload: payload.to_string().into_bytes(),
            retained: false,
        });
    }

    /// Device command on the controller's topic layout. The layout is
    /// opaque to the rest of the gateway; only this handle knows it.
    pub fn publish_device_command(&self, device: &str, command: &str) {
        let payload = json!({
            "command": command,
            "timestamp_ms": timestamp_ms(),
        });
        self.send(OutboundMessage {
            topic: format!("{}/{}/set", self.device_command_prefix, normalize(device)),
            payload: payload.to_string().into_bytes(),
            retained: false,
        });
    }
}

pub struct EventBus {
    config: BusConfig,
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    devices: DeviceStateCache,
    health: Arc<HealthState>,
}

impl EventBus {
    /// Build the bus task plus the handles the rest of the gateway uses.
    pub fn new(
        config: BusConfig,
        events_tx: mpsc::Sender<OrchestratorEvent>,
        health: Arc<HealthState>,
    ) -> (BusHandle, DeviceStateCache, EventBus) {
        let (tx, outbound_rx) = mpsc::channel(256);
        let handle = BusHandle::new(
            tx,
            config.topic_prefix.clone(),
            config.device_command_prefix.clone(),
        );
        let devices = DeviceStateCache::new();
        let bus = EventBus {
            config,
            outbound_rx,
            events_tx,
            devices: devices.clone(),
            health,
        };
        (handle, devices, bus)
    }

    /// Run the connection until the outbound channel closes.
    pub async fn run(self) {
        let EventBus {
            config,
            mut outbound_rx,
            events_tx,
            devices,
            health,
        } = self;

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let control_topic = format!("{}/cmd", config.topic_prefix);
        let mut connected = false;
        let mut backoff = Duration::from_secs(1);
        let mut last_status: Option<OutboundMessage> = None;
        let mut buffered: VecDeque<OutboundMessage> = VecDeque::new();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else { break };
                    if message.retained {
                        last_status = Some(message.clone());
                    }
                    if connected {
                        publish(&client, &message).await;
                    } else if !message.retained {
                        if buffered.len() == config.offline_buffer {
                            buffered.pop_front();
                            log::warn!("Offline buffer full, dropping oldest event");
                        }
                        buffered.push_back(message);
                    }
                }
                polled = eventloop.poll() => {
                    match polled {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            log::info!("Event bus connected to {}:{}", config.host, config.port);
                            connected = true;
                            backoff = Duration::from_secs(1);
                            health.set_bus_connected(true);

                            let _ = client.subscribe(control_topic.as_str(), QoS::AtLeastOnce).await;
                            let _ = client
                                .subscribe(config.device_status_filter.as_str(), QoS::AtLeastOnce)
                                .await;

                            // Late observers read the retained status.
                            if let Some(status) = &last_status {
                                publish(&client, status).await;
                            }
                            let backlog = buffered.len();
                            for message in buffered.drain(..) {
                                publish(&client, &message).await;
                            }
                            if backlog > 0 {
                                log::info!("Flushed {} buffered events", backlog);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(inbound))) => {
                            handle_inbound(
                                &events_tx,
                                &devices,
                                &inbound.topic,
                                &inbound.payload,
                                &control_topic,
                            )
                            .await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected {
                                log::warn!("Event bus connection lost: {}", e);
                            }
                            connected = false;
                            health.set_bus_connected(false);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(Duration::from_secs(30));
                        }
                    }
                }
            }
        }
        log::info!("Event bus task stopped");
    }
}

async fn handle_inbound(
    events_tx: &mpsc::Sender<OrchestratorEvent>,
    devices: &DeviceStateCache,
    topic: &str,
    payload: &[u8],
    control_topic: &str,
) {
    if topic == control_topic {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
            log::warn!("Unparseable control message on {}", topic);
            return;
        };
        let command = match value.get("command").and_then(|c| c.as_str()) {
            Some("reset") => ControlCommand::Reset,
            Some("mute") => ControlCommand::SetMute(true),
            Some("unmute") => ControlCommand::SetMute(false),
            Some("state") => ControlCommand::DumpState,
            other => {
                log::warn!("Unknown control command: {:?}", other);
                return;
            }
        };
        let _ = events_tx.send(OrchestratorEvent::Control(command)).await;
        return;
    }

    // devices/<name>/status
    let mut parts = topic.split('/');
    let (Some(_), Some(device), Some("status")) = (parts.next(), parts.next(), parts.next())
    else {
        log::debug!("Ignoring message on unexpected topic {}", topic);
        return;
    };
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => {
            let state = DeviceState {
                available: value
                    .get("available")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                state: value
                    .get("state")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            };
            log::debug!("Device state: {} → {:?}", device, state);
            devices.update(device, state);
        }
        Err(e) => log::warn!("Bad device status payload on {}: {}", topic, e),
    }
}

async fn publish(client: &AsyncClient, message: &OutboundMessage) {
    if let Err(e) = client
        .publish(
            message.topic.clone(),
            QoS::AtLeastOnce,
            message.retained,
            message.payload.clone(),
        )
        .await
    {
        log::warn!("Publish to {} failed: {}", message.topic, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_cache_normalizes_names() {
        let cache = DeviceStateCache::new();
        cache.update(
            "Switch One",
            DeviceState {
                available: true,
                state: Some("on".into()),
            },
        );
        let state = cache.get("switch one").unwrap();
        assert!(state.available);
        assert_eq!(state.state.as_deref(), Some("on"));
        assert!(cache.get("switch two").is_none());
    }

    #[tokio::test]
    async fn handle_payloads_carry_session_and_timestamp() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = BusHandle::new(tx, "voice".into(), "devices".into());
        let session = SessionId::generate();

        handle.publish_request(&session, "what time is it");
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "voice/req");
        assert!(!message.retained);
        let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(value["text"], "what time is it");
        assert_eq!(value["session_id"], session.to_string());
        assert!(value["timestamp_ms"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn status_is_retained() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = BusHandle::new(tx, "voice".into(), "devices".into());
        handle.publish_status("ready", None);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "voice/status");
        assert!(message.retained);
    }

    #[tokio::test]
    async fn device_commands_use_controller_layout() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = BusHandle::new(tx, "voice".into(), "devices".into());
        handle.publish_device_command("Switch One", "off");
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "devices/switch one/set");
        let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(value["command"], "off");
    }
}
