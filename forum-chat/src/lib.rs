//! # forum-chat: Real-time chat hub for the forum
//!
//! Fans chat messages out to every connected client over WebSocket,
//! replays recent history to newcomers and persists messages from
//! authenticated senders.
//!
//! ## Architecture
//!
//! ```text
//!  Client A ──┐                                   ┌── Client A
//!             │  reader loop        writer loop   │
//!  Client B ──┼──► HubHandle::submit ──► Hub ─────┼── Client B
//!             │        │            (control loop)│
//!  Client C ──┘        ▼                 │        └── Client C
//!                 ┌───────────┐          │ history replay
//!                 │ ChatStore │ ◄────────┘
//!                 │ (Memory / │
//!                 │  RocksDB) │
//!                 └───────────┘
//! ```
//!
//! The set of live connections is owned by a single task (the hub's
//! control loop). Readers, writers and the server only talk to it through
//! a [`hub::HubHandle`]; nothing else touches the set.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire format with raw-text fallback
//! - [`identity`]: Sender identity and token validation seam
//! - [`store`]: `ChatStore` trait, in-memory and RocksDB engines
//! - [`hub`]: Control loop, membership and broadcast
//! - [`connection`]: Per-client reader/writer loops and lifecycle
//! - [`server`]: TCP accept loop and WebSocket handshake
//! - [`client`]: Minimal WebSocket chat client

pub mod protocol;
pub mod identity;
pub mod store;
pub mod hub;
pub mod connection;
pub mod server;
pub mod client;

pub use client::{ChatClient, ClientError};
pub use connection::{Connection, ConnectionConfig, ConnectionHandle, ConnectionId, ConnectionState, Lifecycle};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats, Payload};
pub use identity::{ConnectParams, Identity, RejectAll, SharedSecret, TokenValidator};
pub use protocol::{ChatMessage, InboundFrame, ProtocolError};
pub use server::{ChatServer, ServerConfig, ServerError};
pub use store::{ChatStore, MemoryStore, RocksStore, StoreConfig, StoreError};
