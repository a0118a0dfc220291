//! Client for the external tool-protocol server.
//!
//! The server is a subprocess speaking newline-delimited JSON-RPC over
//! stdio: `{jsonrpc, id, method, params}` requests with correlated
//! responses. The gateway uses two methods: `tools/list` at startup (and
//! after reconnect) and `tools/call` per invocation. A dead connection is
//! respawned lazily with exponential backoff.

use super::{ToolDescriptor, ToolSource};
use crate::config::McpConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

#[derive(Debug)]
pub enum McpCallError {
    /// The request never reached the server (spawn or write failure).
    NotSent(String),
    /// The server answered with an error.
    Remote(String),
    /// No answer within the deadline.
    Timeout,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

struct Connection {
    _child: Child,
    stdin: ChildStdin,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
}

struct ClientState {
    conn: Option<Connection>,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

pub struct McpClient {
    config: McpConfig,
    request_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
}

impl McpClient {
    pub fn new(config: McpConfig, request_timeout: Duration) -> Self {
        Self {
            config,
            request_timeout,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ClientState {
                conn: None,
                backoff: Duration::from_secs(1),
                next_attempt: None,
            }),
        }
    }

    /// Spawn the server and complete the protocol handshake.
    async fn spawn_connection(&self) -> Result<Connection, String> {
        log::info!(
            "Spawning tool server: {} {}",
            self.config.command,
            self.config.args.join(" ")
        );
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn tool server: {e}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "tool server has no stdin".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "tool server has no stdout".to_string())?;

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Reader task: correlate responses by id, fail everything pending
        // when the stream ends.
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    log::warn!("Tool server sent unparseable line");
                    continue;
                };
                let Some(id) = message.get("id").and_then(|i| i.as_u64()) else {
                    continue; // notification
                };
                let waiter = reader_pending.lock().unwrap().remove(&id);
                if let Some(waiter) = waiter {
                    let outcome = if let Some(error) = message.get("error") {
                        Err(error
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown server error")
                            .to_string())
                    } else {
                        Ok(message.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = waiter.send(outcome);
                }
            }
            reader_alive.store(false, Ordering::Release);
            let mut pending = reader_pending.lock().unwrap();
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err("tool server disconnected".to_string()));
            }
            log::warn!("Tool server stdout closed");
        });

        let mut conn = Connection {
            _child: child,
            stdin,
            pending,
            alive,
        };

        // Handshake: initialize, then the initialized notification.
        let init_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let init = json!({
            "jsonrpc": "2.0",
            "id": init_id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "clientInfo": { "name": "voice-gateway", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {},
            }
        });
        let reply = send_request(&mut conn, init_id, init, Duration::from_secs(5)).await;
        if let Err(e) = reply {
            return Err(format!("tool server handshake failed: {e:?}"));
        }
        let initialized = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        write_line(&mut conn.stdin, &initialized)
            .await
            .map_err(|e| format!("handshake notification failed: {e}"))?;

        log::info!("Tool server connected");
        Ok(conn)
    }

    /// Send one request, reconnecting first if needed.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpCallError> {
        let mut state = self.state.lock().await;

        let dead = state
            .conn
            .as_ref()
            .map(|c| !c.alive.load(Ordering::Acquire))
            .unwrap_or(true);
        if dead {
            state.conn = None;
            if let Some(next) = state.next_attempt {
                if Instant::now() < next {
                    return Err(McpCallError::NotSent(
                        "tool server down, reconnect backoff active".to_string(),
                    ));
                }
            }
            match self.spawn_connection().await {
                Ok(conn) => {
                    state.conn = Some(conn);
                    state.backoff = Duration::from_secs(1);
                    state.next_attempt = None;
                }
                Err(e) => {
                    let backoff = state.backoff;
                    state.next_attempt = Some(Instant::now() + backoff);
                    state.backoff = (backoff * 2).min(Duration::from_secs(60));
                    return Err(McpCallError::NotSent(e));
                }
            }
        }

        let conn = state.conn.as_mut().expect("connection just ensured");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let pending = conn.pending.clone();
        let rx = match register_and_write(conn, id, message).await {
            Ok(rx) => rx,
            Err(e) => {
                state.conn = None;
                return Err(McpCallError::NotSent(e));
            }
        };
        drop(state); // don't hold the connection over the wait

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(McpCallError::Remote(message)),
            Ok(Err(_)) => Err(McpCallError::Remote("tool server disconnected".into())),
            Err(_) => {
                pending.lock().unwrap().remove(&id);
                Err(McpCallError::Timeout)
            }
        }
    }

    /// Discover the server's tool catalog.
    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<ToolDescriptor>, McpCallError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(ToolDescriptor {
                    name,
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                    parameters: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                    source: ToolSource::External {
                        server: server_name.to_string(),
                    },
                })
            })
            .collect())
    }

    /// Invoke one tool and flatten its text content.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpCallError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        let text: String = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if result
            .get("isError")
            .and_then(|e| e.as_bool())
            .unwrap_or(false)
        {
            return Err(McpCallError::Remote(text));
        }
        Ok(text)
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> Result<(), String> {
    let mut line = serde_json::to_vec(message).map_err(|e| e.to_string())?;
    line.push(b'\n');
    stdin.write_all(&line).await.map_err(|e| e.to_string())?;
    stdin.flush().await.map_err(|e| e.to_string())
}

/// Register the waiter before writing so a fast response can't race it.
async fn register_and_write(
    conn: &mut Connection,
    id: u64,
    message: Value,
) -> Result<oneshot::Receiver<Result<Value, String>>, String> {
    let (tx, rx) = oneshot::channel();
    conn.pending.lock().unwrap().insert(id, tx);
    if let Err(e) = write_line(&mut conn.stdin, &message).await {
        conn.pending.lock().unwrap().remove(&id);
        return Err(e);
    }
    Ok(rx)
}

async fn send_request(
    conn: &mut Connection,
    id: u64,
    message: Value,
    timeout: Duration,
) -> Result<Value, McpCallError> {
    let rx = register_and_write(conn, id, message)
        .await
        .map_err(McpCallError::NotSent)?;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(message))) => Err(McpCallError::Remote(message)),
        Ok(Err(_)) => Err(McpCallError::Remote("tool server disconnected".into())),
        Err(_) => {
            conn.pending.lock().unwrap().remove(&id);
            Err(McpCallError::Timeout)
        }
    }
}
