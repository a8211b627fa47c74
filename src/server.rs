//! WebSocket collaboration server with room-based message routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── Document + history + presence
//! Client B ──┘         │
//!                      ├── per-client writer queues (fan-out)
//!                      │
//!            heartbeat ┴── ping every client, prune stale presence
//! ```
//!
//! Each connection gets a reader loop and a writer task; every inbound
//! message is routed by its own `roomId` and handled under that room's
//! lock, which is the serialization point that gives the version gate
//! its ordering guarantees. Rooms are created lazily on first join and
//! keep their document, version, and history even when the last client
//! disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::presence::now_ms;
use crate::protocol::{ClientId, Message, RoomId};
use crate::room::{ClientHandle, Room};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Heartbeat tick period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Presence records untouched for longer than this are evicted.
    pub presence_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_ms: 5000,
            presence_ttl_ms: 15_000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

type RoomTable = Arc<RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>>;

/// The collaboration server: accept loop, room registry, heartbeat.
pub struct CollabServer {
    config: ServerConfig,
    rooms: RoomTable,
    stats: Arc<RwLock<ServerStats>>,
    /// Process-wide connection serial, used to tell a client's old
    /// socket apart from its replacement.
    conn_seq: Arc<AtomicU64>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            conn_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening and run the accept loop. Call from an async
    /// runtime; runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        self.spawn_heartbeat();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let conn_id = self.conn_seq.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, conn_id, rooms, stats).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodic tick over every room: ping all clients, evict stale
    /// presence.
    fn spawn_heartbeat(&self) {
        let rooms = self.rooms.clone();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let ttl_ms = self.config.presence_ttl_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let snapshot: Vec<Arc<Mutex<Room>>> =
                    rooms.read().await.values().cloned().collect();
                let now = now_ms();
                for room in snapshot {
                    room.lock().await.heartbeat(now, ttl_ms);
                }
            }
        });
    }

    /// Handle a single WebSocket connection until it closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: u64,
        rooms: RoomTable,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: drain the outbound queue into the socket. Rooms
        // only ever see the queue's sender, wrapped in a ClientHandle.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        let handle = ClientHandle::new(conn_id, out_tx);

        // The (room, client) this socket last joined, for close cleanup.
        let mut joined: Option<(RoomId, ClientId)> = None;

        while let Some(frame) = ws_receiver.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => {
                    log::info!("connection closed from {addr}");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("websocket error from {addr}: {e}");
                    break;
                }
            };

            let msg = match Message::decode(text.as_str()) {
                Ok(msg) => msg,
                Err(e) => {
                    // Malformed payloads are dropped; the socket stays open.
                    log::debug!("dropping malformed message from {addr}: {e}");
                    continue;
                }
            };

            {
                let mut s = stats.write().await;
                s.total_messages += 1;
                s.total_bytes += text.len() as u64;
            }

            Self::dispatch(&rooms, &stats, &handle, &mut joined, msg).await;
        }

        // The socket is gone; detach from the room unless a newer
        // connection for the same client has taken over.
        if let Some((room_id, client_id)) = joined {
            let room = rooms.read().await.get(&room_id).cloned();
            if let Some(room) = room {
                room.lock().await.handle_disconnect(&client_id, conn_id);
            }
        }
        writer.abort();
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        Ok(())
    }

    /// Route one inbound message to its room.
    async fn dispatch(
        rooms: &RoomTable,
        stats: &Arc<RwLock<ServerStats>>,
        handle: &ClientHandle,
        joined: &mut Option<(RoomId, ClientId)>,
        msg: Message,
    ) {
        match msg {
            Message::Join {
                room_id,
                client_id,
                presence,
            } => {
                let room = Self::get_or_create(rooms, stats, &room_id).await;
                room.lock()
                    .await
                    .handle_join(handle.clone(), &client_id, presence, now_ms());
                *joined = Some((room_id, client_id));
            }
            Message::Leave { room_id, client_id } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock().await.handle_leave(&client_id);
                }
                *joined = None;
            }
            Message::Steps {
                room_id,
                client_id,
                version,
                steps,
                ..
            } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock().await.handle_steps(&client_id, version, &steps);
                } else {
                    log::debug!("steps for unknown room {room_id}");
                }
            }
            Message::Presence {
                room_id,
                client_id,
                presence,
            } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock()
                        .await
                        .handle_presence(&client_id, presence, now_ms());
                }
            }
            Message::DocRequest { room_id, client_id } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock().await.handle_doc_request(&client_id);
                }
            }
            Message::HistoryRequest {
                room_id,
                client_id,
                since_version,
            } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock()
                        .await
                        .handle_history_request(&client_id, since_version);
                }
            }
            Message::Pong {
                room_id, client_id, ..
            } => {
                if let Some(room) = Self::lookup(rooms, &room_id).await {
                    room.lock().await.handle_pong(&client_id, now_ms());
                }
            }
            // Server-originated types arriving from a client are no-ops.
            Message::Ping { .. }
            | Message::Ack { .. }
            | Message::Error { .. }
            | Message::DocSnapshot { .. }
            | Message::History { .. }
            | Message::PresenceSnapshot { .. } => {
                log::debug!("ignoring server-bound message type from client");
            }
        }
    }

    async fn lookup(rooms: &RoomTable, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        rooms.read().await.get(room_id).cloned()
    }

    /// Get or lazily create the room for `room_id`.
    async fn get_or_create(
        rooms: &RoomTable,
        stats: &Arc<RwLock<ServerStats>>,
        room_id: &str,
    ) -> Arc<Mutex<Room>> {
        // Fast path: read lock.
        if let Some(room) = rooms.read().await.get(room_id) {
            return room.clone();
        }

        let mut table = rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = table.get(room_id) {
            return room.clone();
        }
        log::info!("creating room {room_id}");
        let room = Arc::new(Mutex::new(Room::new(room_id)));
        table.insert(room_id.to_string(), room.clone());
        let room_count = table.len();
        drop(table);

        stats.write().await.active_rooms = room_count;
        room
    }

    /// Server statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
