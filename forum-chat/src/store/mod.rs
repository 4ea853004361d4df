//! Chat history persistence.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append (authenticated senders)  ┌──────────────┐
//! │ reader loop │ ───────────────────────────────► │  ChatStore   │
//! └─────────────┘                                  │              │
//! ┌─────────────┐  recent_messages(50) on register │  MemoryStore │
//! │ Hub         │ ───────────────────────────────► │  RocksStore  │
//! └─────────────┘                                  └──────────────┘
//! ```
//!
//! Storage failures never stop chat delivery: the hub and the readers
//! log them and carry on.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use thiserror::Error;

use crate::protocol::ChatMessage;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Column family '{0}' not found")]
    ColumnFamilyMissing(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::error::EncodeError),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] bincode::error::DecodeError),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable append-only log of chat messages.
pub trait ChatStore: Send + Sync {
    /// Append one message.
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// The last `limit` messages, oldest first.
    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;
}
