//! Hub: the single owner of the live connection set.
//!
//! ```text
//!   register ──┐
//! unregister ──┼──► mpsc ──► Hub::run (one task) ──► HashMap<ConnectionId, ConnectionHandle>
//!  broadcast ──┘                  │
//!                                 └── try_send onto each connection's outbound queue
//! ```
//!
//! Every membership change and every fan-out happens inside [`Hub::run`],
//! so the map needs no lock. Callers reach it through a cloneable
//! [`HubHandle`].
//!
//! Backpressure: a connection whose outbound queue is full is dropped on
//! the spot (its queue sender is released, which closes the queue). One
//! slow consumer never delays delivery to the others.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::identity::Identity;
use crate::protocol::{ChatMessage, InboundFrame};
use crate::store::ChatStore;

/// Messages replayed to a newly registered connection.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Capacity of the hub's command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 100;

/// A pre-serialized outbound frame, shared by every recipient.
pub type Payload = Arc<Vec<u8>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of stored messages replayed on register
    pub history_limit: usize,
    /// Command channel capacity
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// Counters kept by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: usize,
    pub total_registered: u64,
    pub messages_broadcast: u64,
    pub slow_consumers_dropped: u64,
    pub history_replayed: u64,
    pub empty_rejected: u64,
}

enum Command {
    Register(ConnectionHandle),
    Unregister {
        id: ConnectionId,
        done: oneshot::Sender<bool>,
    },
    Broadcast(Payload),
    Stats(oneshot::Sender<HubStats>),
    Members(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown,
}

/// The control loop state. Build with [`Hub::new`], drive with [`Hub::run`].
pub struct Hub {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    commands: mpsc::Receiver<Command>,
    store: Arc<dyn ChatStore>,
    config: HubConfig,
    stats: HubStats,
}

impl Hub {
    /// Create the hub and its first handle. Nothing runs until [`Hub::run`].
    pub fn new(store: Arc<dyn ChatStore>, config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let handle = HubHandle {
            commands: tx,
            store: store.clone(),
        };
        let hub = Self {
            connections: HashMap::new(),
            commands: rx,
            store,
            config,
            stats: HubStats::default(),
        };
        (hub, handle)
    }

    /// Create the hub and spawn its control loop on the current runtime.
    pub fn spawn(store: Arc<dyn ChatStore>, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(store, config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Run the control loop until shutdown is requested or every handle
    /// is dropped. On exit all outbound queues are closed.
    pub async fn run(mut self) {
        log::info!("Hub started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(handle) => self.register(handle),
                Command::Unregister { id, done } => {
                    let _ = done.send(self.unregister(id));
                }
                Command::Broadcast(payload) => self.broadcast(payload),
                Command::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Members(reply) => {
                    let _ = reply.send(self.connections.keys().copied().collect());
                }
                Command::Shutdown => break,
            }
        }

        let closing = self.connections.len();
        self.connections.clear();
        log::info!("Hub stopped, closed {closing} connections");
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        log::info!(
            "Registering connection {id}: user {} ({})",
            handle.identity().user_id,
            handle.identity().username
        );
        self.connections.insert(id, handle);
        self.stats.total_registered += 1;

        let history = match self.store.recent_messages(self.config.history_limit) {
            Ok(history) => history,
            Err(e) => {
                log::error!("Failed to load history for {id}, joining without it: {e}");
                return;
            }
        };

        let mut replayed = 0u64;
        for message in &history {
            let payload = match message.encode() {
                Ok(bytes) => Arc::new(bytes),
                Err(e) => {
                    log::error!("Failed to encode history message: {e}");
                    continue;
                }
            };
            let Some(handle) = self.connections.get(&id) else {
                break;
            };
            match handle.try_send(payload) {
                Ok(()) => replayed += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Connection {id} queue full during history replay, dropping");
                    self.connections.remove(&id);
                    self.stats.slow_consumers_dropped += 1;
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Connection {id} went away during history replay");
                    self.connections.remove(&id);
                    break;
                }
            }
        }

        self.stats.history_replayed += replayed;
        log::debug!("Replayed {replayed}/{} history messages to {id}", history.len());
    }

    /// Remove and close. Returns whether the connection was present.
    fn unregister(&mut self, id: ConnectionId) -> bool {
        // Dropping the handle releases the only queue sender, which closes
        // the queue. Absent ids are a no-op, so both loops may call this.
        match self.connections.remove(&id) {
            Some(handle) => {
                log::info!("Unregistered connection {id} (user {})", handle.identity().user_id);
                true
            }
            None => false,
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        if payload.is_empty() {
            log::warn!("Rejecting empty broadcast");
            self.stats.empty_rejected += 1;
            return;
        }

        log::debug!("Broadcasting {} bytes to {} connections", payload.len(), self.connections.len());

        let mut dropped = 0u64;
        self.connections.retain(|id, handle| match handle.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Connection {id} queue full, disconnecting slow consumer");
                dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {id} queue already closed, removing");
                false
            }
        });

        self.stats.messages_broadcast += 1;
        self.stats.slow_consumers_dropped += dropped;
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            active_connections: self.connections.len(),
            ..self.stats.clone()
        }
    }
}

/// Cloneable front door to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    store: Arc<dyn ChatStore>,
}

impl HubHandle {
    /// Add a connection to the live set and queue its history replay.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(Command::Register(handle)).await
    }

    /// Remove a connection and close its queue. Idempotent.
    ///
    /// Resolves once the hub has processed the request. Returns whether the
    /// connection was still registered (`false` if the hub is gone).
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Unregister { id, done }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queue a pre-serialized frame for every live connection.
    pub async fn broadcast(&self, payload: Payload) -> Result<(), HubError> {
        self.send(Command::Broadcast(payload)).await
    }

    /// Handle one inbound frame from `sender`.
    ///
    /// Decodes (with raw-text fallback), stamps, persists when the sender
    /// is authenticated, then broadcasts. Storage failures are logged and
    /// do not stop the broadcast. Returns the message that was broadcast,
    /// or `None` when the frame had no content.
    pub async fn submit(&self, sender: &Identity, raw: &[u8]) -> Option<ChatMessage> {
        let Some(message) = InboundFrame::parse(raw).into_message(sender) else {
            log::debug!("Ignoring empty message from user {}", sender.user_id);
            return None;
        };

        if sender.authenticated {
            if let Err(e) = self.store.append(&message) {
                log::error!("Failed to persist message from user {}: {e}", sender.user_id);
            }
        }

        let payload = match message.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode message from user {}: {e}", sender.user_id);
                return None;
            }
        };

        if self.broadcast(payload).await.is_err() {
            log::warn!("Hub stopped, message from user {} not delivered", sender.user_id);
        }
        Some(message)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ids of every live connection, in no particular order.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Members(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ask the control loop to close every connection and stop.
    pub async fn shutdown(&self) {
        if self.send(Command::Shutdown).await.is_err() {
            log::debug!("Hub already stopped");
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}
