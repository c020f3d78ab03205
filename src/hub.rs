//! WebSocket hub.
//!
//! One run-loop task owns the client set and fans out registry events, log
//! lines, and the periodic status snapshot. Each client gets a bounded send
//! queue and two tasks: a reader that parses inbound envelopes and a writer
//! that drains the queue, coalescing the backlog into a single
//! newline-separated frame. A full queue drops the message for that client
//! only; the 5-second snapshot is the catch-up path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::log_streams::{LogLine, LogStreamManager};
use crate::pool::PoolManager;
use crate::protocol::{
    make_envelope, parse_log_channel, AgentEventPayload, AgentSnapshot, CommandPayload, Envelope,
    LogDataPayload, StatusSnapshotPayload, StatusUpdatePayload, SubscribePayload,
    UnsubscribePayload, CHANNEL_STATUS, TYPE_AGENT_DEREGISTERED, TYPE_AGENT_REGISTERED,
    TYPE_COMMAND, TYPE_COMMAND_RESULT, TYPE_LOGS_DATA, TYPE_STATUS_SNAPSHOT, TYPE_STATUS_UPDATE,
    TYPE_SUBSCRIBE, TYPE_UNSUBSCRIBE,
};
use crate::proxy::RouteWriter;
use crate::registry::{Registry, StoreEvent, StoreEventKind};

pub const MAX_MESSAGE_SIZE: usize = 4096;
const CLIENT_QUEUE_DEPTH: usize = 256;
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
const SNAPSHOT_PERIOD: Duration = Duration::from_secs(5);

/// Handle the hub and command tasks use to reach one connected client.
pub struct ClientHandle {
    id: u64,
    queue: mpsc::Sender<String>,
    subscriptions: RwLock<HashSet<String>>,
}

impl ClientHandle {
    fn new(id: u64, queue: mpsc::Sender<String>) -> Self {
        Self {
            id,
            queue,
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    /// Non-blocking: a slow client loses the message and resynchronizes on
    /// the next snapshot tick.
    pub fn enqueue(&self, msg: String) {
        let _ = self.queue.try_send(msg);
    }

    fn subscribe(&self, channel: &str) {
        self.subscriptions.write().insert(channel.to_string());
    }

    fn unsubscribe(&self, channel: &str) {
        self.subscriptions.write().remove(channel);
    }

    fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().contains(channel)
    }
}

enum HubMsg {
    Register(Arc<ClientHandle>),
    Unregister(u64),
}

struct RunInputs {
    rx: mpsc::Receiver<HubMsg>,
    line_rx: mpsc::Receiver<LogLine>,
}

pub struct Hub {
    store: Arc<Registry>,
    pool: Arc<PoolManager>,
    log_streams: Arc<LogStreamManager>,
    commands: Arc<CommandHandler>,
    routes: Arc<RouteWriter>,
    tx: mpsc::Sender<HubMsg>,
    run_inputs: Mutex<Option<RunInputs>>,
    next_client_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(
        store: Arc<Registry>,
        pool: Arc<PoolManager>,
        log_streams: Arc<LogStreamManager>,
        commands: Arc<CommandHandler>,
        routes: Arc<RouteWriter>,
        line_rx: mpsc::Receiver<LogLine>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            store,
            pool,
            log_streams,
            commands,
            routes,
            tx,
            run_inputs: Mutex::new(Some(RunInputs { rx, line_rx })),
            next_client_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let Some(inputs) = self.run_inputs.lock().take() else {
            tracing::warn!("hub already started");
            return tokio::spawn(async {});
        };
        tokio::spawn(self.run(inputs))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>, inputs: RunInputs) {
        let RunInputs {
            mut rx,
            mut line_rx,
        } = inputs;
        let mut clients: HashMap<u64, Arc<ClientHandle>> = HashMap::new();
        let mut events = self.store.subscribe();
        let mut tick = tokio::time::interval(SNAPSHOT_PERIOD);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(msg) = rx.recv() => match msg {
                    HubMsg::Register(client) => {
                        clients.insert(client.id, client);
                        tracing::info!(total = clients.len(), "WebSocket client connected");
                    }
                    HubMsg::Unregister(id) => {
                        if clients.remove(&id).is_some() {
                            self.log_streams.unsubscribe_all(id);
                            tracing::info!(total = clients.len(), "WebSocket client disconnected");
                        }
                    }
                },

                Some(event) = events.recv() => {
                    if let Some(msg) = store_event_envelope(&event) {
                        broadcast_to_status(&clients, &msg);
                    }
                }

                Some((agent_id, line)) = line_rx.recv() => {
                    let payload = LogDataPayload { agent_id: agent_id.clone(), line };
                    if let Ok(msg) = make_envelope(TYPE_LOGS_DATA, &payload) {
                        let channel = format!("logs:{agent_id}");
                        for client in clients.values() {
                            if client.is_subscribed(&channel) {
                                client.enqueue(msg.clone());
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    if let Ok(msg) = self.status_snapshot_envelope() {
                        broadcast_to_status(&clients, &msg);
                    }
                }
            }
        }

        self.log_streams.stop_all();
    }

    /// Accepts one upgraded socket: registers the client, runs the reader
    /// inline, and tears everything down when it returns.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (queue_tx, queue_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let client = Arc::new(ClientHandle::new(id, queue_tx));

        if self.tx.send(HubMsg::Register(client.clone())).await.is_err() {
            return;
        }

        let (sender, receiver) = socket.split();
        let writer = tokio::spawn(write_loop(sender, queue_rx));

        self.read_loop(receiver, &client).await;

        let _ = self.tx.send(HubMsg::Unregister(id)).await;
        drop(client);
        let _ = writer.await;
    }

    async fn read_loop(&self, mut receiver: SplitStream<WebSocket>, client: &Arc<ClientHandle>) {
        loop {
            // Any inbound frame (pongs included) refreshes the deadline.
            let msg = match tokio::time::timeout(READ_DEADLINE, receiver.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    let envelope = match serde_json::from_str::<Envelope>(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(error) => {
                            tracing::debug!(%error, "invalid WebSocket message");
                            continue;
                        }
                    };
                    self.handle_client_message(client, envelope);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    fn handle_client_message(&self, client: &Arc<ClientHandle>, envelope: Envelope) {
        match envelope.kind.as_str() {
            TYPE_SUBSCRIBE => {
                let Ok(payload) = serde_json::from_value::<SubscribePayload>(envelope.payload)
                else {
                    return;
                };
                client.subscribe(&payload.channel);

                if payload.channel == CHANNEL_STATUS {
                    // New status subscribers get the current state before any
                    // incremental update.
                    if let Ok(msg) = self.status_snapshot_envelope() {
                        client.enqueue(msg);
                    }
                } else if let Some(agent_id) = parse_log_channel(&payload.channel) {
                    self.log_streams.subscribe(agent_id, client.id);
                }
            }

            TYPE_UNSUBSCRIBE => {
                let Ok(payload) = serde_json::from_value::<UnsubscribePayload>(envelope.payload)
                else {
                    return;
                };
                client.unsubscribe(&payload.channel);
                if let Some(agent_id) = parse_log_channel(&payload.channel) {
                    self.log_streams.unsubscribe(agent_id, client.id);
                }
            }

            TYPE_COMMAND => {
                let Ok(payload) = serde_json::from_value::<CommandPayload>(envelope.payload)
                else {
                    return;
                };
                let commands = self.commands.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let result = commands.handle(payload).await;
                    if let Ok(msg) = make_envelope(TYPE_COMMAND_RESULT, &result) {
                        client.enqueue(msg);
                    }
                });
            }

            other => {
                tracing::debug!(kind = %other, "unknown envelope type");
            }
        }
    }

    fn status_snapshot_envelope(&self) -> anyhow::Result<String> {
        make_envelope(
            TYPE_STATUS_SNAPSHOT,
            &build_status(&self.pool, &self.store, &self.routes),
        )
    }
}

/// Aggregate pool counts plus the active agents, enriched with whatever the
/// runners have reported and each agent's routable subdomain. Shared between
/// the hub snapshot and the REST status endpoint.
pub fn build_status(
    pool: &PoolManager,
    store: &Registry,
    routes: &RouteWriter,
) -> StatusSnapshotPayload {
    let counts = pool.status();
    let registrations: HashMap<String, crate::registry::AgentRegistration> = store
        .list()
        .into_iter()
        .map(|reg| (reg.agent_id.clone(), reg))
        .collect();

    let agents = pool
        .active_slots()
        .iter()
        .map(|slot| {
            let reg = slot
                .agent_id
                .as_deref()
                .and_then(|id| registrations.get(id));
            AgentSnapshot::from_slot(slot, reg, routes)
        })
        .collect();

    StatusSnapshotPayload {
        pool: counts.into(),
        agents,
    }
}

fn store_event_envelope(event: &StoreEvent) -> Option<String> {
    match event.kind {
        StoreEventKind::Registered => make_envelope(
            TYPE_AGENT_REGISTERED,
            &AgentEventPayload {
                agent_id: event.agent_id.clone(),
                agent: event.agent.as_ref().map(AgentSnapshot::from_registration),
            },
        )
        .ok(),
        StoreEventKind::Deregistered => make_envelope(
            TYPE_AGENT_DEREGISTERED,
            &AgentEventPayload {
                agent_id: event.agent_id.clone(),
                agent: None,
            },
        )
        .ok(),
        StoreEventKind::Updated => {
            let agent = event.agent.as_ref()?;
            make_envelope(
                TYPE_STATUS_UPDATE,
                &StatusUpdatePayload {
                    agent_id: event.agent_id.clone(),
                    state: agent.state.clone(),
                    message: agent.message.clone(),
                    branch: agent.branch.clone(),
                },
            )
            .ok()
        }
    }
}

fn broadcast_to_status(clients: &HashMap<u64, Arc<ClientHandle>>, msg: &str) {
    for client in clients.values() {
        if client.is_subscribed(CHANNEL_STATUS) {
            client.enqueue(msg.to_string());
        }
    }
}

async fn write_loop(mut sender: SplitSink<WebSocket, Message>, mut queue: mpsc::Receiver<String>) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = queue.recv() => {
                let Some(first) = maybe else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                // Coalesce the queued backlog into one frame, newline-joined.
                let mut frame = first;
                while let Ok(next) = queue.try_recv() {
                    frame.push('\n');
                    frame.push_str(&next);
                }
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_drops_when_client_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let client = ClientHandle::new(1, tx);

        client.enqueue("first".to_string());
        client.enqueue("second".to_string());

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert!(rx.try_recv().is_err(), "overflow message must be dropped");
    }

    #[test]
    fn subscription_set_tracks_channels() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientHandle::new(1, tx);

        client.subscribe("status");
        client.subscribe("logs:agent-1");
        assert!(client.is_subscribed("status"));
        assert!(client.is_subscribed("logs:agent-1"));

        client.unsubscribe("status");
        assert!(!client.is_subscribed("status"));
    }

    #[test]
    fn store_event_envelopes_map_to_wire_types() {
        use crate::registry::AgentRegistration;
        use chrono::Utc;

        let reg = AgentRegistration {
            agent_id: "agent-1".to_string(),
            vm_name: "warm-1".to_string(),
            vm_ip: "10.0.0.2".to_string(),
            project: "proj".to_string(),
            tool: "claude-code".to_string(),
            branch: None,
            message: None,
            ports: vec![],
            state: "executing".to_string(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };

        let registered = store_event_envelope(&StoreEvent {
            kind: StoreEventKind::Registered,
            agent_id: "agent-1".to_string(),
            agent: Some(reg.clone()),
        })
        .unwrap();
        let decoded: Envelope = serde_json::from_str(&registered).unwrap();
        assert_eq!(decoded.kind, TYPE_AGENT_REGISTERED);

        let updated = store_event_envelope(&StoreEvent {
            kind: StoreEventKind::Updated,
            agent_id: "agent-1".to_string(),
            agent: Some(reg),
        })
        .unwrap();
        let decoded: Envelope = serde_json::from_str(&updated).unwrap();
        assert_eq!(decoded.kind, TYPE_STATUS_UPDATE);
        assert_eq!(decoded.payload["state"], "executing");

        // An update with no agent payload is not broadcastable.
        assert!(store_event_envelope(&StoreEvent {
            kind: StoreEventKind::Updated,
            agent_id: "agent-1".to_string(),
            agent: None,
        })
        .is_none());
    }
}
