//! # chorus — coordination core for real-time collaborative text editing
//!
//! A room-based authoritative server plus a rebase-capable client for
//! multiplayer editing over step operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     JSON frames     │  (central)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ local editor │                     │    Room      │
//! │ + step queue │                     │ doc/version/ │
//! └──────────────┘                     │ history      │
//!                                      └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ fan-out to    │
//!                                     │ other clients │
//!                                     └───────────────┘
//! ```
//!
//! Every room serializes its messages, so accepted step batches form a
//! single global history: a batch is admitted only when it was produced
//! against the current version, anything stale is bounced back with a
//! snapshot and the client rebases its queued work through the missed
//! server steps.
//!
//! ## Modules
//!
//! - [`protocol`] — tagged-JSON wire messages (`join`, `steps`, `ack`, …)
//! - [`transform`] — step application and position mapping
//! - [`presence`] — per-room presence table with TTL eviction
//! - [`room`] — authoritative room state and message handlers
//! - [`server`] — WebSocket accept loop, room registry, heartbeat
//! - [`client`] — connection engine with offline queue and rebase

pub mod client;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod transform;

// Re-exports for convenience
pub use client::{
    ClientConfig, ClientError, CollabClient, CollabEvent, ConnectionState, TokenProvider,
};
pub use presence::{now_ms, PresenceStore};
pub use protocol::{
    codes, AckType, ClientId, CursorRange, Message, PresenceEntry, ProtocolError, RoomId,
    UserInfo, UserPresence, SERVER_CLIENT_ID,
};
pub use room::{ClientHandle, Room, StepBatch};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use transform::{
    Document, MapRange, MapResult, Mapping, Schema, Step, StepMap, TransformError,
};
