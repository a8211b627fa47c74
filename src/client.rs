//! Client protocol engine: connection lifecycle, step queue, rebase.
//!
//! The engine owns one WebSocket connection to the collaboration server
//! and keeps the consumer's optimistic local state reconcilable with the
//! authoritative room:
//!
//! - outgoing step batches are bound to the last known server version
//!   and queued until acked,
//! - a `version_mismatch` bounce delivers a fresh snapshot, after which
//!   the engine requests the missed history and rebases the queued
//!   batches through the intervening server steps,
//! - connection drops reconnect with capped exponential backoff.
//!
//! Consumers receive [`CollabEvent`]s from the channel returned by
//! [`CollabClient::take_events`] and apply remote steps/snapshots to
//! their local editor state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::protocol::{
    AckType, ClientId, Message, ProtocolError, RoomId, UserPresence,
};
use crate::transform::{Mapping, Schema, Step, TransformError};

/// Produces the optional auth token appended to the connection URL.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Client configuration. Reconnect defaults: base 300 ms, cap 8000 ms,
/// jitter 0–200 ms, exponent capped at 6.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub room_id: RoomId,
    /// Client-assigned id; a random UUID is generated when absent.
    pub client_id: Option<ClientId>,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub reconnect_exp_cap: u32,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, room_id: impl Into<RoomId>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            client_id: None,
            reconnect_base_ms: 300,
            reconnect_cap_ms: 8000,
            reconnect_jitter_ms: 200,
            reconnect_exp_cap: 6,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the consumer.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established and `join` sent.
    Connected,
    /// Connection lost; a reconnect may be scheduled.
    Disconnected,
    /// An accepted batch from a remote client; apply locally in arrival
    /// order to converge on the authoritative document.
    RemoteSteps {
        client_id: ClientId,
        version: u64,
        steps: Vec<Value>,
    },
    /// Authoritative document; replace local state with it.
    DocSnapshot { version: u64, doc: Value },
    /// A remote client's presence changed (echoes of our own presence
    /// included).
    RemotePresence {
        client_id: ClientId,
        presence: UserPresence,
    },
    PeerJoined { client_id: ClientId },
    PeerLeft { client_id: ClientId },
    /// Server-side failure report; codes outside the reserved set are
    /// passed through untouched.
    ServerError { code: String, reason: String },
    /// A well-formed JSON frame the engine does not understand.
    Unknown { raw: String },
}

/// Client engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An unacked outgoing batch, bound to the version it was produced
/// against.
#[derive(Debug, Clone)]
struct PendingBatch {
    base_version: u64,
    steps: Vec<Step>,
}

/// Flags coordinating the snapshot → history → rebase cycle.
#[derive(Debug, Default)]
struct SyncFlags {
    history_requested: bool,
    rebase_after_snapshot_pending: bool,
}

struct ClientShared {
    config: ClientConfig,
    client_id: ClientId,
    schema: Schema,
    token_provider: Option<TokenProvider>,
    initial_presence: Option<UserPresence>,
    state: RwLock<ConnectionState>,
    /// Last server version acknowledged or observed.
    doc_version: RwLock<u64>,
    pending: Mutex<VecDeque<PendingBatch>>,
    flags: Mutex<SyncFlags>,
    should_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    outgoing: RwLock<Option<mpsc::UnboundedSender<String>>>,
    event_tx: mpsc::Sender<CollabEvent>,
}

/// The collaboration client.
pub struct CollabClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let shared = Arc::new(ClientShared {
            config,
            client_id,
            schema: Schema,
            token_provider: None,
            initial_presence: None,
            state: RwLock::new(ConnectionState::Disconnected),
            doc_version: RwLock::new(0),
            pending: Mutex::new(VecDeque::new()),
            flags: Mutex::new(SyncFlags::default()),
            should_reconnect: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            outgoing: RwLock::new(None),
            event_tx,
        });
        Self {
            shared,
            event_rx: Some(event_rx),
        }
    }

    /// Install an auth token producer. Must be called before `connect`.
    pub fn with_token_provider(mut self, provider: TokenProvider) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.token_provider = Some(provider);
        }
        self
    }

    /// Presence announced with the `join` message. Must be called before
    /// `connect`.
    pub fn with_presence(mut self, presence: UserPresence) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.initial_presence = Some(presence);
        }
        self
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room. A failed first attempt
    /// returns the error *and* schedules a backoff reconnect, like any
    /// later drop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared.should_reconnect.store(true, Ordering::SeqCst);
        *self.shared.state.write().await = ConnectionState::Connecting;
        match Self::open_connection(self.shared.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                Self::schedule_reconnect(self.shared.clone());
                Err(e)
            }
        }
    }

    /// Stop reconnecting, send a best-effort `leave`, and close.
    pub async fn disconnect(&self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        let leave = Message::Leave {
            room_id: self.shared.config.room_id.clone(),
            client_id: self.shared.client_id.clone(),
        };
        Self::transmit(&self.shared, &leave).await;
        // Dropping the outbound sender ends the writer task, which
        // closes the socket.
        *self.shared.outgoing.write().await = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
        log::info!("client {} disconnected", self.shared.client_id);
    }

    /// Send a step batch bound to the current document version and queue
    /// it until acked. While disconnected the transmit is a no-op and the
    /// batch stays queued for the next snapshot/rebase cycle.
    pub async fn send_steps(&self, steps: Vec<Step>) {
        let batch = PendingBatch {
            base_version: *self.shared.doc_version.read().await,
            steps,
        };
        self.shared.pending.lock().await.push_back(batch.clone());
        Self::transmit_steps(&self.shared, batch.base_version, &batch.steps).await;
    }

    /// Send a presence update (cursor move, selection change).
    pub async fn send_presence(&self, presence: UserPresence) {
        let msg = Message::Presence {
            room_id: self.shared.config.room_id.clone(),
            client_id: self.shared.client_id.clone(),
            presence,
        };
        Self::transmit(&self.shared, &msg).await;
    }

    /// Ask the server for a fresh document snapshot.
    pub async fn request_doc(&self) {
        let msg = Message::DocRequest {
            room_id: self.shared.config.room_id.clone(),
            client_id: self.shared.client_id.clone(),
        };
        Self::transmit(&self.shared, &msg).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Last server version acknowledged or observed.
    pub async fn doc_version(&self) -> u64 {
        *self.shared.doc_version.read().await
    }

    /// Number of unacked outgoing batches.
    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.shared.config.room_id
    }

    /// One connection attempt: open the socket, wire the writer and
    /// reader tasks, send `join`.
    async fn open_connection(shared: Arc<ClientShared>) -> Result<(), ClientError> {
        let url = Self::request_url(&shared);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing queue to the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        *shared.outgoing.write().await = Some(out_tx);

        let join = Message::Join {
            room_id: shared.config.room_id.clone(),
            client_id: shared.client_id.clone(),
            presence: shared.initial_presence.clone(),
        };
        Self::transmit(&shared, &join).await;

        *shared.state.write().await = ConnectionState::Connected;
        shared.reconnect_attempts.store(0, Ordering::SeqCst);
        let _ = shared.event_tx.send(CollabEvent::Connected).await;
        log::info!(
            "client {} joined room {} at {}",
            shared.client_id,
            shared.config.room_id,
            shared.config.url
        );

        // Reader task: dispatch inbound messages until the socket drops.
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        Self::dispatch_inbound(&reader_shared, text.as_str()).await;
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_shared.state.write().await = ConnectionState::Disconnected;
            *reader_shared.outgoing.write().await = None;
            let _ = reader_shared.event_tx.send(CollabEvent::Disconnected).await;
            log::info!("client {} lost its connection", reader_shared.client_id);
            Self::schedule_reconnect(reader_shared);
        });

        Ok(())
    }

    /// Schedule exactly one reconnect attempt with capped exponential
    /// backoff and jitter.
    fn schedule_reconnect(shared: Arc<ClientShared>) {
        if !shared.should_reconnect.load(Ordering::SeqCst) {
            return;
        }
        let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = reconnect_delay(&shared.config, attempt);
        log::debug!(
            "client {}: reconnect attempt {} in {delay:?}",
            shared.client_id,
            attempt + 1
        );
        tokio::spawn(async move {
            *shared.state.write().await = ConnectionState::Reconnecting;
            tokio::time::sleep(delay).await;
            if !shared.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            *shared.state.write().await = ConnectionState::Connecting;
            if let Err(e) = Self::open_connection(shared.clone()).await {
                log::warn!("client {}: reconnect failed: {e}", shared.client_id);
                *shared.state.write().await = ConnectionState::Disconnected;
                Self::schedule_reconnect(shared);
            }
        });
    }

    /// Dispatch one inbound text frame.
    async fn dispatch_inbound(shared: &Arc<ClientShared>, text: &str) {
        let msg = match Message::decode(text) {
            Ok(msg) => msg,
            Err(_) => {
                // Unknown tags are surfaced raw; non-JSON frames are
                // dropped.
                if serde_json::from_str::<Value>(text).is_ok() {
                    let _ = shared
                        .event_tx
                        .send(CollabEvent::Unknown {
                            raw: text.to_string(),
                        })
                        .await;
                }
                return;
            }
        };

        match msg {
            Message::Steps {
                client_id,
                version: Some(version),
                steps,
                ..
            } => {
                *shared.doc_version.write().await = version;
                let _ = shared
                    .event_tx
                    .send(CollabEvent::RemoteSteps {
                        client_id,
                        version,
                        steps,
                    })
                    .await;
            }
            // The server always stamps broadcast batches with a version.
            Message::Steps { version: None, .. } => {}
            Message::Presence {
                client_id, presence, ..
            } => {
                let _ = shared
                    .event_tx
                    .send(CollabEvent::RemotePresence {
                        client_id,
                        presence,
                    })
                    .await;
            }
            Message::PresenceSnapshot { presences, .. } => {
                for entry in presences {
                    let _ = shared
                        .event_tx
                        .send(CollabEvent::RemotePresence {
                            client_id: entry.client_id,
                            presence: entry.presence,
                        })
                        .await;
                }
            }
            Message::DocSnapshot { version, doc, .. } => {
                let previous = {
                    let mut doc_version = shared.doc_version.write().await;
                    let previous = *doc_version;
                    *doc_version = version;
                    previous
                };
                let _ = shared
                    .event_tx
                    .send(CollabEvent::DocSnapshot { version, doc })
                    .await;

                // Queued local work needs the missed history to rebase.
                if !shared.pending.lock().await.is_empty() {
                    let mut flags = shared.flags.lock().await;
                    if !flags.history_requested {
                        flags.history_requested = true;
                        flags.rebase_after_snapshot_pending = true;
                        drop(flags);
                        log::debug!(
                            "client {}: snapshot at {version} with queued steps, requesting history since {previous}",
                            shared.client_id
                        );
                        let request = Message::HistoryRequest {
                            room_id: shared.config.room_id.clone(),
                            client_id: shared.client_id.clone(),
                            since_version: previous as i64,
                        };
                        Self::transmit(shared, &request).await;
                    }
                }
            }
            Message::History { steps, .. } => {
                let rebase = {
                    let mut flags = shared.flags.lock().await;
                    let rebase = flags.rebase_after_snapshot_pending;
                    flags.rebase_after_snapshot_pending = false;
                    flags.history_requested = false;
                    rebase
                };
                if rebase {
                    Self::rebase_and_resend(shared, &steps).await;
                }
            }
            Message::Ping { ts, .. } => {
                let pong = Message::Pong {
                    room_id: shared.config.room_id.clone(),
                    client_id: shared.client_id.clone(),
                    ts,
                };
                Self::transmit(shared, &pong).await;
            }
            Message::Ack {
                ack_type: AckType::Steps,
                ok,
                version,
                ..
            } => {
                shared.pending.lock().await.pop_front();
                if ok {
                    if let Some(version) = version {
                        *shared.doc_version.write().await = version;
                    }
                }
            }
            Message::Ack { .. } => {}
            Message::Error { code, reason, .. } => {
                let _ = shared
                    .event_tx
                    .send(CollabEvent::ServerError { code, reason })
                    .await;
            }
            Message::Join { client_id, .. } => {
                let _ = shared
                    .event_tx
                    .send(CollabEvent::PeerJoined { client_id })
                    .await;
            }
            Message::Leave { client_id, .. } => {
                let _ = shared
                    .event_tx
                    .send(CollabEvent::PeerLeft { client_id })
                    .await;
            }
            // Client-bound request types never arrive from the server.
            Message::DocRequest { .. }
            | Message::HistoryRequest { .. }
            | Message::Pong { .. } => {}
        }
    }

    /// Rebase the queued batches through the intervening server steps and
    /// retransmit them at the new document version, without re-enqueueing
    /// (from the user's perspective they are already in flight). On any
    /// rebase error the drained batches are resent unchanged: the
    /// server's version gate then either admits them or loops back with
    /// another snapshot.
    async fn rebase_and_resend(shared: &Arc<ClientShared>, server_steps: &[Value]) {
        let batches: Vec<PendingBatch> = {
            let mut pending = shared.pending.lock().await;
            pending.drain(..).collect()
        };
        if batches.is_empty() {
            return;
        }
        let version = *shared.doc_version.read().await;

        match rebase_batches(&shared.schema, server_steps, &batches) {
            Ok(rebased) => {
                log::debug!(
                    "client {}: rebased {} queued batches over {} server steps",
                    shared.client_id,
                    batches.len(),
                    server_steps.len()
                );
                for steps in rebased {
                    if steps.is_empty() {
                        continue;
                    }
                    Self::transmit_steps(shared, version, &steps).await;
                }
            }
            Err(e) => {
                log::warn!(
                    "client {}: rebase failed ({e}), resending queued batches unchanged",
                    shared.client_id
                );
                for batch in &batches {
                    Self::transmit_steps(shared, version, &batch.steps).await;
                }
            }
        }
    }

    async fn transmit_steps(shared: &Arc<ClientShared>, version: u64, steps: &[Step]) {
        let msg = Message::Steps {
            room_id: shared.config.room_id.clone(),
            client_id: shared.client_id.clone(),
            version: Some(version),
            steps: steps.iter().map(Step::to_json).collect(),
            client_selection: None,
        };
        Self::transmit(shared, &msg).await;
    }

    /// Best-effort send: failures are swallowed, the transport surfaces
    /// `close` separately.
    async fn transmit(shared: &Arc<ClientShared>, msg: &Message) {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("client {}: dropping unencodable message: {e}", shared.client_id);
                return;
            }
        };
        match shared.outgoing.read().await.as_ref() {
            Some(tx) => {
                let _ = tx.send(text);
            }
            None => log::trace!(
                "client {}: not connected, dropping outbound frame",
                shared.client_id
            ),
        }
    }

    fn request_url(shared: &ClientShared) -> String {
        let mut url = shared.config.url.clone();
        if let Some(provider) = &shared.token_provider {
            if let Some(token) = provider() {
                url.push(if url.contains('?') { '&' } else { '?' });
                url.push_str("token=");
                url.push_str(&percent_encode(&token));
            }
        }
        url
    }
}

/// Backoff for reconnect attempt `attempt` (0-based):
/// `min(cap, base · 2^min(attempt, exp_cap))` plus uniform jitter.
fn reconnect_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let exp = attempt.min(config.reconnect_exp_cap).min(32);
    let base = config.reconnect_base_ms.saturating_mul(1u64 << exp);
    let mut delay_ms = base.min(config.reconnect_cap_ms);
    if config.reconnect_jitter_ms > 0 {
        delay_ms += rand::thread_rng().gen_range(0..=config.reconnect_jitter_ms);
    }
    Duration::from_millis(delay_ms)
}

/// Map every queued batch through the composed position maps of the
/// intervening server steps. Steps whose context was deleted drop out;
/// an undecodable server step fails the whole rebase.
fn rebase_batches(
    schema: &Schema,
    server_steps: &[Value],
    batches: &[PendingBatch],
) -> Result<Vec<Vec<Step>>, TransformError> {
    let mut mapping = Mapping::new();
    for raw in server_steps {
        let step = schema.step_from_json(raw)?;
        mapping.append_map(step.pos_map());
    }
    Ok(batches
        .iter()
        .map(|batch| {
            batch
                .steps
                .iter()
                .filter_map(|step| step.map(&mapping))
                .collect()
        })
        .collect())
}

/// Minimal percent-encoding for the `?token=` query value.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserInfo;
    use serde_json::json;

    fn test_client() -> CollabClient {
        CollabClient::new(ClientConfig::new("ws://127.0.0.1:1", "room-1"))
    }

    fn test_client_named(id: &str) -> CollabClient {
        let mut config = ClientConfig::new("ws://127.0.0.1:1", "room-1");
        config.client_id = Some(id.to_string());
        CollabClient::new(config)
    }

    async fn dispatch(client: &CollabClient, msg: &Message) {
        CollabClient::dispatch_inbound(&client.shared, &msg.encode().unwrap()).await;
    }

    #[test]
    fn test_client_id_generated_when_absent() {
        let client = test_client();
        assert!(!client.client_id().is_empty());
        let named = test_client_named("alice");
        assert_eq!(named.client_id(), "alice");
        assert_eq!(named.room_id(), "room-1");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = test_client();
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(client.doc_version().await, 0);
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_steps_queues_while_disconnected() {
        let client = test_client_named("alice");
        client.send_steps(vec![Step::insert(0, "a")]).await;
        client.send_steps(vec![Step::insert(1, "b")]).await;
        assert_eq!(client.pending_len().await, 2);
        let pending = client.shared.pending.lock().await;
        assert_eq!(pending[0].base_version, 0);
    }

    #[tokio::test]
    async fn test_take_events_once() {
        let mut client = test_client();
        assert!(client.take_events().is_some());
        assert!(client.take_events().is_none());
    }

    #[tokio::test]
    async fn test_remote_steps_update_version_and_emit() {
        let mut client = test_client_named("bob");
        let mut events = client.take_events().unwrap();
        let msg = Message::Steps {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            version: Some(4),
            steps: vec![Step::insert(0, "x").to_json()],
            client_selection: None,
        };
        dispatch(&client, &msg).await;

        assert_eq!(client.doc_version().await, 4);
        match events.try_recv().unwrap() {
            CollabEvent::RemoteSteps {
                client_id, version, ..
            } => {
                assert_eq!(client_id, "alice");
                assert_eq!(version, 4);
            }
            other => panic!("expected remote steps, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_steps_ack_dequeues_and_advances_version() {
        let client = test_client_named("alice");
        client.send_steps(vec![Step::insert(0, "x")]).await;
        assert_eq!(client.pending_len().await, 1);

        dispatch(&client, &Message::steps_ack("room-1", "alice", 1)).await;
        assert_eq!(client.pending_len().await, 0);
        assert_eq!(client.doc_version().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_with_queued_steps_requests_history_once() {
        let mut client = test_client_named("alice");
        let mut events = client.take_events().unwrap();
        client.send_steps(vec![Step::insert(0, "x")]).await;

        let snapshot = Message::DocSnapshot {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            version: 3,
            doc: json!({"type": "doc", "content": "abc"}),
        };
        dispatch(&client, &snapshot).await;

        assert_eq!(client.doc_version().await, 3);
        assert!(matches!(
            events.try_recv().unwrap(),
            CollabEvent::DocSnapshot { version: 3, .. }
        ));
        {
            let flags = client.shared.flags.lock().await;
            assert!(flags.history_requested);
            assert!(flags.rebase_after_snapshot_pending);
        }

        // A second snapshot while the request is in flight does not
        // re-arm.
        dispatch(&client, &snapshot).await;
        let flags = client.shared.flags.lock().await;
        assert!(flags.history_requested);
    }

    #[tokio::test]
    async fn test_snapshot_without_queued_steps_skips_history() {
        let client = test_client_named("alice");
        let snapshot = Message::DocSnapshot {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            version: 7,
            doc: json!({"type": "doc", "content": ""}),
        };
        dispatch(&client, &snapshot).await;
        assert_eq!(client.doc_version().await, 7);
        let flags = client.shared.flags.lock().await;
        assert!(!flags.history_requested);
        assert!(!flags.rebase_after_snapshot_pending);
    }

    #[tokio::test]
    async fn test_history_clears_queue_via_rebase() {
        let client = test_client_named("alice");
        client.send_steps(vec![Step::insert(0, "x")]).await;

        // Simulate the snapshot that armed the rebase.
        let snapshot = Message::DocSnapshot {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            version: 1,
            doc: json!({"type": "doc", "content": "abc"}),
        };
        dispatch(&client, &snapshot).await;

        let history = Message::History {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            from_version: 0,
            to_version: 1,
            steps: vec![Step::insert(0, "abc").to_json()],
        };
        dispatch(&client, &history).await;

        // The rebased batch is in flight, not re-enqueued.
        assert_eq!(client.pending_len().await, 0);
        let flags = client.shared.flags.lock().await;
        assert!(!flags.rebase_after_snapshot_pending);
        assert!(!flags.history_requested);
    }

    #[tokio::test]
    async fn test_presence_snapshot_expands_to_individual_events() {
        let mut client = test_client_named("bob");
        let mut events = client.take_events().unwrap();
        let msg = Message::PresenceSnapshot {
            room_id: "room-1".into(),
            client_id: "bob".into(),
            presences: vec![
                crate::protocol::PresenceEntry {
                    client_id: "alice".into(),
                    presence: UserPresence::new(UserInfo::new("alice")),
                },
                crate::protocol::PresenceEntry {
                    client_id: "carol".into(),
                    presence: UserPresence::new(UserInfo::new("carol")),
                },
            ],
        };
        dispatch(&client, &msg).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CollabEvent::RemotePresence { client_id, .. } = event {
                seen.push(client_id);
            }
        }
        assert_eq!(seen, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_json_surfaces_raw() {
        let mut client = test_client();
        let mut events = client.take_events().unwrap();

        CollabClient::dispatch_inbound(&client.shared, r#"{"type":"telemetry","x":1}"#).await;
        assert!(matches!(
            events.try_recv().unwrap(),
            CollabEvent::Unknown { .. }
        ));

        // Non-JSON frames are dropped silently.
        CollabClient::dispatch_inbound(&client.shared, "garbage").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_delivered() {
        let mut client = test_client_named("bob");
        let mut events = client.take_events().unwrap();
        let msg = Message::error("room-1", "bob", "version_mismatch", "expected 2, got 1");
        dispatch(&client, &msg).await;
        match events.try_recv().unwrap() {
            CollabEvent::ServerError { code, reason } => {
                assert_eq!(code, "version_mismatch");
                assert_eq!(reason, "expected 2, got 1");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn test_reconnect_delay_ladder() {
        let mut config = ClientConfig::new("ws://x", "r");
        config.reconnect_jitter_ms = 0;
        assert_eq!(reconnect_delay(&config, 0), Duration::from_millis(300));
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(600));
        assert_eq!(reconnect_delay(&config, 2), Duration::from_millis(1200));
        assert_eq!(reconnect_delay(&config, 4), Duration::from_millis(4800));
        // Capped at 8000 from the fifth retry on, exponent frozen at 6.
        assert_eq!(reconnect_delay(&config, 5), Duration::from_millis(8000));
        assert_eq!(reconnect_delay(&config, 60), Duration::from_millis(8000));
    }

    #[test]
    fn test_reconnect_delay_jitter_bounds() {
        let config = ClientConfig::new("ws://x", "r");
        for attempt in 0..8 {
            let delay = reconnect_delay(&config, attempt).as_millis() as u64;
            let floor = (300u64 << attempt.min(6)).min(8000);
            assert!(delay >= floor && delay <= floor + 200, "delay {delay} out of range");
        }
    }

    #[test]
    fn test_rebase_batches_shifts_positions() {
        let batches = vec![PendingBatch {
            base_version: 0,
            steps: vec![Step::delete(1, 3)],
        }];
        let server_steps = vec![Step::insert(0, "abc").to_json()];
        let rebased = rebase_batches(&Schema, &server_steps, &batches).unwrap();
        assert_eq!(rebased, vec![vec![Step::delete(4, 6)]]);
    }

    #[test]
    fn test_rebase_batches_drops_deleted_context() {
        let batches = vec![PendingBatch {
            base_version: 0,
            steps: vec![Step::insert(5, "x")],
        }];
        let server_steps = vec![Step::delete(0, 10).to_json()];
        let rebased = rebase_batches(&Schema, &server_steps, &batches).unwrap();
        assert_eq!(rebased, vec![Vec::<Step>::new()]);
    }

    #[test]
    fn test_rebase_batches_fails_on_unknown_server_step() {
        let batches = vec![PendingBatch {
            base_version: 0,
            steps: vec![Step::insert(0, "x")],
        }];
        let server_steps = vec![json!({"stepType": "addMark", "from": 0, "to": 1})];
        assert!(rebase_batches(&Schema, &server_steps, &batches).is_err());
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("abc-123_~."), "abc-123_~.");
        assert_eq!(percent_encode("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(percent_encode("ток"), "%D1%82%D0%BE%D0%BA");
    }

    #[test]
    fn test_request_url_appends_token() {
        let client =
            test_client().with_token_provider(Arc::new(|| Some("s3cret&".to_string())));
        let url = CollabClient::request_url(&client.shared);
        assert_eq!(url, "ws://127.0.0.1:1?token=s3cret%26");

        let bare = test_client();
        assert_eq!(
            CollabClient::request_url(&bare.shared),
            "ws://127.0.0.1:1"
        );
    }
}
