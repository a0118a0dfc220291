//! Process health: shared snapshot state and the HTTP endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Live status shared by the orchestrator, bus, and audio tasks.
///
/// Plain atomics and a mutex; writers are sparse and the handler only
/// takes a snapshot.
#[derive(Default)]
pub struct HealthState {
    state: Mutex<String>,
    warmup_complete: AtomicBool,
    event_bus_connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        let health = Self::default();
        *health.state.lock().unwrap() = "initializing".to_string();
        Arc::new(health)
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock().unwrap() = state.to_string();
    }

    pub fn set_warmup_complete(&self, complete: bool) {
        self.warmup_complete.store(complete, Ordering::Release);
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.event_bus_connected.store(connected, Ordering::Release);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(error.into());
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "state": self.state.lock().unwrap().clone(),
            "warmup_complete": self.warmup_complete.load(Ordering::Acquire),
            "event_bus_connected": self.event_bus_connected.load(Ordering::Acquire),
            "last_error": self.last_error.lock().unwrap().clone(),
        })
    }
}

async fn healthz(State(health): State<Arc<HealthState>>) -> Json<Value> {
    Json(health.snapshot())
}

/// Serve `GET /healthz` until the process exits.
pub async fn serve(bind: String, health: Arc<HealthState>) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(health);

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Health endpoint failed to bind {}: {}", bind, e);
            return;
        }
    };
    log::info!("Health endpoint on http://{}/healthz", bind);
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("Health endpoint stopped: {}", e);
    }
}
