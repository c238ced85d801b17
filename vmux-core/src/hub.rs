//! C11 — WebSocket Hub.
//!
//! Per-VM client registry and fan-out, redesigned per the spec's "hub is a
//! sink" flag: the hub never calls back into the metrics aggregator or the
//! VM assembler. All registry mutation and publishing happens as messages to
//! a single owning loop (`run`), so external callers never take a lock.
//! Commands that need to reach the assembler (`console_input`, `command`)
//! travel out through a channel the hub only writes to — it holds no
//! reference back to the components that read from it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;

use crate::export::ExportProgressSink;
use crate::model::ExportJob;

/// WebSocket liveness constants, fixed per the glossary.
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Bounded outbound queue per client; a full queue means the client is slow
/// and is dropped rather than blocking a publish.
const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClientId(u64);

/// Envelope every server→client (and most client→server) message is wrapped
/// in: `{ type, timestamp, data }`.
#[derive(Debug, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: &'static str, data: Value) -> Self {
        Self { kind, timestamp: Utc::now(), data }
    }

    fn to_message(&self) -> Message {
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }
}

/// A command issued by a client's reader task, forwarded to whatever owns
/// VM control. The hub only relays these; it has no opinion on what they do.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Command { vm_name: String, action: String, request_id: Option<String> },
    ConsoleInput { vm_name: String, content: String },
}

struct Client {
    vm_name: String,
    is_console: bool,
    #[allow(dead_code)]
    user_id: Option<String>,
    outbound: mpsc::Sender<Message>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

/// Messages the single hub loop accepts. External API (`WsHub`) is a thin
/// handle that only ever sends one of these; the maps below live solely
/// inside `run`.
enum HubCommand {
    Register { id: ClientId, vm_name: String, is_console: bool, user_id: Option<String>, outbound: mpsc::Sender<Message> },
    Unregister { id: ClientId },
    Touch { id: ClientId },
    PublishToVm { vm_name: String, envelope: Envelope },
    Broadcast { envelope: Envelope },
}

/// Handle callers use to talk to the hub loop. Cheaply cloneable.
#[derive(Clone)]
pub struct WsHub {
    tx: mpsc::Sender<HubCommand>,
    commands: mpsc::Sender<ClientCommand>,
    next_id: std::sync::Arc<AtomicU64>,
}

impl WsHub {
    /// Spawns the single owning loop and returns the handle plus the
    /// receiving end of the command channel (inbound `command`/
    /// `console_input` frames), which the caller wires to whatever owns VM
    /// control — the hub keeps no reference to it.
    pub fn spawn() -> (Self, mpsc::Receiver<ClientCommand>) {
        let (tx, rx) = mpsc::channel(1024);
        let (commands_tx, commands_rx) = mpsc::channel(1024);
        tokio::spawn(run(rx));
        (Self { tx, commands: commands_tx, next_id: std::sync::Arc::new(AtomicU64::new(1)) }, commands_rx)
    }

    fn alloc_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Drives one accepted WebSocket connection end to end: registers with
    /// the hub, spawns the writer (drains the outbound queue, emits pings),
    /// runs the reader inline until the socket closes, then unregisters.
    pub async fn handle_socket(&self, socket: WebSocket, vm_name: String, is_console: bool, user_id: Option<String>) {
        let id = self.alloc_id();
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        let _ = self
            .tx
            .send(HubCommand::Register { id, vm_name: vm_name.clone(), is_console, user_id, outbound: outbound_tx.clone() })
            .await;

        let connected = Envelope::new("connection", serde_json::json!({ "vmName": vm_name, "isConsole": is_console }));
        let _ = outbound_tx.send(connected.to_message()).await;

        let writer = tokio::spawn(async move {
            let mut ping_tick = interval(PING_PERIOD);
            loop {
                tokio::select! {
                    maybe_msg = outbound_rx.recv() => {
                        match maybe_msg {
                            Some(msg) => {
                                if sink.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping_tick.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            let recv = tokio::time::timeout(PONG_WAIT, stream.next()).await;
            let Ok(Some(Ok(msg))) = recv else {
                break;
            };
            let _ = self.tx.send(HubCommand::Touch { id }).await;
            match msg {
                Message::Text(text) => self.handle_inbound(&vm_name, is_console, &text).await,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
            }
        }

        writer.abort();
        let _ = self.tx.send(HubCommand::Unregister { id }).await;
    }

    async fn handle_inbound(&self, vm_name: &str, is_console: bool, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        match value.get("type").and_then(Value::as_str) {
            Some("heartbeat") => {}
            Some("command") => {
                let action = value.get("action").and_then(Value::as_str).unwrap_or_default().to_string();
                let request_id = value.get("requestId").and_then(Value::as_str).map(str::to_string);
                let _ = self.commands.send(ClientCommand::Command { vm_name: vm_name.to_string(), action, request_id }).await;
            }
            Some("console_input") if is_console => {
                let content = value.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
                let _ = self.commands.send(ClientCommand::ConsoleInput { vm_name: vm_name.to_string(), content }).await;
            }
            _ => {}
        }
    }

    pub async fn publish_to_vm(&self, vm_name: &str, kind: &'static str, data: Value) {
        let _ = self.tx.send(HubCommand::PublishToVm { vm_name: vm_name.to_string(), envelope: Envelope::new(kind, data) }).await;
    }

    pub async fn broadcast(&self, kind: &'static str, data: Value) {
        let _ = self.tx.send(HubCommand::Broadcast { envelope: Envelope::new(kind, data) }).await;
    }
}

/// Lets the export pipeline push progress without depending on the hub
/// directly — it only sees the narrow [`ExportProgressSink`] trait.
impl ExportProgressSink for WsHub {
    fn on_progress(&self, job: &ExportJob) {
        let hub = self.clone();
        let vm_name = job.source_vm_name.clone();
        let data = serde_json::json!({
            "jobId": job.id,
            "status": job.status,
            "progress": job.progress,
        });
        tokio::spawn(async move {
            hub.publish_to_vm(&vm_name, "status", data).await;
        });
    }
}

/// The single loop owning the registry. All mutation happens here; nothing
/// outside this function ever touches `clients`/`by_vm` directly.
async fn run(mut rx: mpsc::Receiver<HubCommand>) {
    let mut clients: HashMap<ClientId, Client> = HashMap::new();
    let mut by_vm: HashMap<String, HashSet<ClientId>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register { id, vm_name, is_console, user_id, outbound } => {
                by_vm.entry(vm_name.clone()).or_default().insert(id);
                let now = Utc::now();
                clients.insert(id, Client { vm_name, is_console, user_id, outbound, created_at: now, last_active: now });
            }
            HubCommand::Unregister { id } => {
                if let Some(client) = clients.remove(&id) {
                    if let Some(set) = by_vm.get_mut(&client.vm_name) {
                        set.remove(&id);
                        if set.is_empty() {
                            by_vm.remove(&client.vm_name);
                        }
                    }
                }
            }
            HubCommand::Touch { id } => {
                if let Some(client) = clients.get_mut(&id) {
                    client.last_active = Utc::now();
                }
            }
            HubCommand::PublishToVm { vm_name, envelope } => {
                let message = envelope.to_message();
                if let Some(ids) = by_vm.get(&vm_name) {
                    let mut dead = Vec::new();
                    for id in ids {
                        if let Some(client) = clients.get(id) {
                            if client.outbound.try_send(message.clone()).is_err() {
                                dead.push(*id);
                            }
                        }
                    }
                    for id in dead {
                        tracing::debug!(?id, vm = %vm_name, "dropping slow client, outbound queue full");
                        clients.remove(&id);
                        if let Some(set) = by_vm.get_mut(&vm_name) {
                            set.remove(&id);
                        }
                    }
                }
            }
            HubCommand::Broadcast { envelope } => {
                let message = envelope.to_message();
                let mut dead = Vec::new();
                for (id, client) in clients.iter() {
                    if client.outbound.try_send(message.clone()).is_err() {
                        dead.push(*id);
                    }
                }
                for id in dead {
                    if let Some(client) = clients.remove(&id) {
                        if let Some(set) = by_vm.get_mut(&client.vm_name) {
                            set.remove(&id);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_to_unknown_vm_is_a_noop() {
        let (hub, _commands) = WsHub::spawn();
        hub.publish_to_vm("nonexistent", "status", serde_json::json!({})).await;
        tokio::task::yield_now().await;
    }

    #[test]
    fn envelope_carries_the_requested_type_and_data() {
        let envelope = Envelope::new("metrics", serde_json::json!({ "cpu": 12.5 }));
        assert_eq!(envelope.kind, "metrics");
        assert_eq!(envelope.data["cpu"], 12.5);
    }

    #[tokio::test]
    async fn register_then_unregister_is_idempotent_on_empty_registry() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run(rx));
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        tx.send(HubCommand::Register {
            id: ClientId(1),
            vm_name: "test1".into(),
            is_console: false,
            user_id: None,
            outbound: outbound_tx,
        })
        .await
        .unwrap();
        tx.send(HubCommand::Unregister { id: ClientId(1) }).await.unwrap();
        tokio::task::yield_now().await;
    }
}
