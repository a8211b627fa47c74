//! Room state and message handlers: the authoritative serialization point.
//!
//! A [`Room`] owns everything about one collaboration session — the
//! authoritative document, the monotonic version counter, the append-only
//! step history, the connected client handles, and the presence table.
//! The server processes a room's messages one at a time under the room
//! lock, so the handlers here are synchronous and never await; outbound
//! traffic is enqueued onto per-client writer queues.
//!
//! The version gate in [`Room::handle_steps`] is what makes the history
//! serializable: a batch is admitted only when it was produced against
//! the current head, everything else is bounced back with a fresh
//! snapshot for the client to rebase onto.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::presence::PresenceStore;
use crate::protocol::{codes, ClientId, Message, PresenceEntry, RoomId, UserPresence};
use crate::transform::{Document, Schema, Step, TransformError};

/// Outbound handle for one connected client.
///
/// Wraps the connection's writer queue. `conn_id` is a process-wide
/// serial that tells an old socket apart from its replacement when a
/// client rejoins under the same id (last-writer-wins).
#[derive(Debug, Clone)]
pub struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Best-effort send; a failure means the connection is gone and its
    /// close event will perform the cleanup.
    fn send_text(&self, text: String) {
        let _ = self.tx.send(text);
    }

    pub fn send(&self, msg: &Message) {
        match msg.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => log::warn!("dropping unencodable message: {e}"),
        }
    }
}

/// One accepted batch: applying `steps` to the document at `from_version`
/// yields the document at `to_version = from_version + 1`.
#[derive(Debug, Clone)]
pub struct StepBatch {
    pub from_version: u64,
    pub to_version: u64,
    pub steps: Vec<Step>,
    pub author: ClientId,
}

/// One collaboration session: document, version, history, clients,
/// presence.
pub struct Room {
    id: RoomId,
    schema: Schema,
    doc: Document,
    version: u64,
    history: Vec<StepBatch>,
    clients: HashMap<ClientId, ClientHandle>,
    presence: PresenceStore,
}

impl Room {
    /// Create an empty room at version 0.
    pub fn new(id: impl Into<RoomId>) -> Self {
        let schema = Schema;
        Self {
            id: id.into(),
            doc: schema.empty_doc(),
            schema,
            version: 0,
            history: Vec::new(),
            clients: HashMap::new(),
            presence: PresenceStore::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn history(&self) -> &[StepBatch] {
        &self.history
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// A client entered the room. Registers the handle (replacing any
    /// prior socket with the same id), announces the join to everyone
    /// else, and brings the joiner up to date with the current document
    /// and presence table.
    pub fn handle_join(
        &mut self,
        handle: ClientHandle,
        client_id: &str,
        presence: Option<UserPresence>,
        now_ms: u64,
    ) {
        self.clients.insert(client_id.to_string(), handle);
        log::info!("room {}: client {client_id} joined", self.id);

        self.broadcast_except(
            client_id,
            &Message::Join {
                room_id: self.id.clone(),
                client_id: client_id.to_string(),
                presence: None,
            },
        );

        self.send_to(client_id, &self.doc_snapshot(client_id));
        self.send_to(
            client_id,
            &Message::PresenceSnapshot {
                room_id: self.id.clone(),
                client_id: client_id.to_string(),
                presences: self
                    .presence
                    .entries()
                    .into_iter()
                    .map(|(client_id, presence)| PresenceEntry {
                        client_id,
                        presence,
                    })
                    .collect(),
            },
        );

        // An initial presence rides along with the join so remote users
        // see the newcomer's cursor immediately.
        if let Some(presence) = presence {
            self.handle_presence(client_id, presence, now_ms);
        }
    }

    /// Upsert a presence record and fan it out. The broadcast includes
    /// the sender; clients tolerate echoes of their own presence.
    pub fn handle_presence(&mut self, client_id: &str, mut presence: UserPresence, now_ms: u64) {
        presence.timestamp = Some(now_ms);
        self.presence.upsert(client_id, presence.clone(), now_ms);
        self.broadcast(&Message::Presence {
            room_id: self.id.clone(),
            client_id: client_id.to_string(),
            presence,
        });
    }

    /// A client left cleanly: drop its handle and presence, tell the rest.
    pub fn handle_leave(&mut self, client_id: &str) {
        self.clients.remove(client_id);
        self.presence.remove(client_id);
        self.broadcast(&Message::Leave {
            room_id: self.id.clone(),
            client_id: client_id.to_string(),
        });
        log::info!("room {}: client {client_id} left", self.id);
    }

    /// A client's socket closed. Runs leave cleanup unless the client
    /// has already been superseded by a newer connection.
    pub fn handle_disconnect(&mut self, client_id: &str, conn_id: u64) {
        match self.clients.get(client_id) {
            Some(handle) if handle.conn_id() == conn_id => self.handle_leave(client_id),
            _ => log::debug!(
                "room {}: stale socket for {client_id} closed, newer connection active",
                self.id
            ),
        }
    }

    /// The version gate. Admits a batch only when it was produced against
    /// the current head; applies it atomically; fans it out to everyone
    /// but the sender (who already applied it optimistically) and acks
    /// the sender with the new version.
    pub fn handle_steps(&mut self, client_id: &str, version: Option<u64>, steps: &[Value]) {
        if let Some(base) = version {
            if base != self.version {
                log::debug!(
                    "room {}: rejecting steps from {client_id}: expected {}, got {base}",
                    self.id,
                    self.version
                );
                self.send_to(
                    client_id,
                    &Message::error(
                        self.id.as_str(),
                        client_id,
                        codes::VERSION_MISMATCH,
                        format!("expected {}, got {base}", self.version),
                    ),
                );
                self.send_to(client_id, &self.doc_snapshot(client_id));
                return;
            }
        }

        // Apply against a scratch document so a failure anywhere in the
        // batch leaves the room untouched.
        let mut next = self.doc.clone();
        let mut decoded = Vec::with_capacity(steps.len());
        for raw in steps {
            let step = match self.schema.step_from_json(raw) {
                Ok(step) => step,
                Err(e) => return self.reject_apply(client_id, e),
            };
            next = match step.apply(&next) {
                Ok(doc) => doc,
                Err(e) => return self.reject_apply(client_id, e),
            };
            decoded.push(step);
        }

        self.doc = next;
        let from_version = self.version;
        self.version += 1;
        self.history.push(StepBatch {
            from_version,
            to_version: self.version,
            steps: decoded.clone(),
            author: client_id.to_string(),
        });
        log::debug!(
            "room {}: accepted {} steps from {client_id}, now at version {}",
            self.id,
            decoded.len(),
            self.version
        );

        self.broadcast_except(
            client_id,
            &Message::Steps {
                room_id: self.id.clone(),
                client_id: client_id.to_string(),
                version: Some(self.version),
                steps: decoded.iter().map(Step::to_json).collect(),
                client_selection: None,
            },
        );
        self.send_to(
            client_id,
            &Message::steps_ack(self.id.as_str(), client_id, self.version),
        );
    }

    fn reject_apply(&self, client_id: &str, reason: TransformError) {
        log::debug!(
            "room {}: steps from {client_id} failed to apply: {reason}",
            self.id
        );
        self.send_to(
            client_id,
            &Message::error(
                self.id.as_str(),
                client_id,
                codes::APPLY_FAILED,
                reason.to_string(),
            ),
        );
    }

    /// Send the current snapshot to the requester only.
    pub fn handle_doc_request(&self, client_id: &str) {
        self.send_to(client_id, &self.doc_snapshot(client_id));
    }

    /// Reply with the flattened steps of the batches in
    /// `(since_version, version]`. A negative or beyond-head
    /// `since_version` yields an empty history at the current version.
    pub fn handle_history_request(&self, client_id: &str, since_version: i64) {
        let (from_version, steps) = if since_version < 0 || since_version as u64 > self.version {
            (self.version, Vec::new())
        } else {
            let since = since_version as u64;
            let flattened = self.history[since as usize..]
                .iter()
                .flat_map(|batch| batch.steps.iter().map(Step::to_json))
                .collect();
            (since, flattened)
        };
        self.send_to(
            client_id,
            &Message::History {
                room_id: self.id.clone(),
                client_id: client_id.to_string(),
                from_version,
                to_version: self.version,
                steps,
            },
        );
    }

    /// Bare heartbeat touch: refresh the presence timestamp without
    /// altering cursor fields. Clients without a presence record are
    /// left alone.
    pub fn handle_pong(&mut self, client_id: &str, now_ms: u64) {
        if self.presence.touch(client_id, now_ms) {
            log::trace!("room {}: pong from {client_id}", self.id);
        }
    }

    /// One heartbeat tick: ping every client, then evict presence
    /// records older than `ttl_ms` and announce each eviction as a
    /// `leave`. Sockets are untouched — their liveness is the connection
    /// layer's concern. Returns the evicted client ids.
    pub fn heartbeat(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<ClientId> {
        self.broadcast(&Message::ping(self.id.as_str(), now_ms));
        let evicted = self.presence.prune_older_than(ttl_ms, now_ms);
        for client_id in &evicted {
            log::info!("room {}: evicting stale presence for {client_id}", self.id);
            self.broadcast(&Message::Leave {
                room_id: self.id.clone(),
                client_id: client_id.clone(),
            });
        }
        evicted
    }

    fn doc_snapshot(&self, client_id: &str) -> Message {
        Message::DocSnapshot {
            room_id: self.id.clone(),
            client_id: client_id.to_string(),
            version: self.version,
            doc: self.doc.to_json(),
        }
    }

    fn send_to(&self, client_id: &str, msg: &Message) {
        if let Some(handle) = self.clients.get(client_id) {
            handle.send(msg);
        }
    }

    /// Fan out to every client, encoding once.
    fn broadcast(&self, msg: &Message) {
        match msg.encode() {
            Ok(text) => {
                for handle in self.clients.values() {
                    handle.send_text(text.clone());
                }
            }
            Err(e) => log::warn!("room {}: dropping unencodable broadcast: {e}", self.id),
        }
    }

    /// Fan out to every client except `skip` (the sender of an accepted
    /// batch has already applied it optimistically).
    fn broadcast_except(&self, skip: &str, msg: &Message) {
        match msg.encode() {
            Ok(text) => {
                for (client_id, handle) in &self.clients {
                    if client_id != skip {
                        handle.send_text(text.clone());
                    }
                }
            }
            Err(e) => log::warn!("room {}: dropping unencodable broadcast: {e}", self.id),
        }
    }
}
