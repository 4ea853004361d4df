//! One client's WebSocket, adapted to the hub.
//!
//! Each connection runs two loops:
//! - **reader**: frames in → [`HubHandle::submit`], with an idle deadline
//! - **writer**: outbound queue → frames out, with a write deadline and
//!   keepalive pings when idle
//!
//! Lifecycle:
//! ```text
//! Open ──register──► Registered ──any loop exits──► Closing ──both done──► Closed
//! ```
//! Whichever loop stops first starts the teardown. The reader always
//! unregisters (idempotent in the hub); the writer stopping wakes the
//! reader. The stream is dropped, and so closed, once both halves are gone.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::hub::{HubHandle, Payload};
use crate::identity::Identity;

pub type ConnectionId = Uuid;

/// Floor for the keepalive period; a zero period is not a valid interval.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue slots
    pub queue_capacity: usize,
    /// Close if nothing (data or pong) arrives for this long
    pub read_timeout: Duration,
    /// Give up on a single frame write after this long
    pub write_timeout: Duration,
    /// Ping after this long without outbound traffic; keep below `read_timeout`
    pub ping_interval: Duration,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(50),
            max_frame_bytes: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Registered = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Registered,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Shared view of a connection's state. Transitions only move forward.
#[derive(Debug, Clone)]
pub struct Lifecycle(Arc<AtomicU8>);

impl Lifecycle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Open as u8)))
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn registered(&self) -> bool {
        self.advance(ConnectionState::Open, ConnectionState::Registered)
    }

    /// Move to Closing. Only the first caller gets `true`.
    fn begin_close(&self) -> bool {
        self.advance(ConnectionState::Registered, ConnectionState::Closing)
            || self.advance(ConnectionState::Open, ConnectionState::Closing)
    }

    fn closed(&self) {
        self.0.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// The hub's record of a live connection. Holds the only sender of the
/// connection's outbound queue: dropping it closes the queue.
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<Payload>,
}

impl ConnectionHandle {
    /// A fresh handle plus the receiving end of its outbound queue.
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            identity,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Non-blocking enqueue.
    pub fn try_send(&self, payload: Payload) -> Result<(), mpsc::error::TrySendError<Payload>> {
        self.outbound.try_send(payload)
    }
}

#[derive(Error, Debug)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Socket(#[from] WsError),
}

/// A client connection that has not started yet. Call [`Connection::run`].
pub struct Connection<S> {
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Payload>,
    stream: S,
    hub: HubHandle,
    config: ConnectionConfig,
    lifecycle: Lifecycle,
}

impl<S> Connection<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    pub fn new(stream: S, identity: Identity, hub: HubHandle, config: ConnectionConfig) -> Self {
        let (handle, outbound) = ConnectionHandle::new(identity, config.queue_capacity);
        Self {
            handle,
            outbound,
            stream,
            hub,
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn identity(&self) -> &Identity {
        self.handle.identity()
    }

    /// State observer; stays valid after `run` consumes the connection.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Register with the hub and run both loops until the connection ends.
    pub async fn run(self) {
        let Self {
            handle,
            outbound,
            stream,
            hub,
            config,
            lifecycle,
        } = self;
        let id = handle.id();
        let identity = handle.identity().clone();

        if hub.register(handle).await.is_err() {
            log::warn!("Hub not running, refusing connection {id}");
            lifecycle.closed();
            return;
        }
        lifecycle.registered();
        log::debug!("Connection {id} registered (user {})", identity.user_id);

        let (sink, source) = stream.split();
        // Dropped by the writer on exit, which wakes the reader.
        let (writer_alive, writer_gone) = oneshot::channel::<()>();

        let writer = tokio::spawn(write_loop(
            id,
            sink,
            outbound,
            config.clone(),
            lifecycle.clone(),
            writer_alive,
        ));

        read_loop(id, &identity, source, &hub, &config, writer_gone).await;
        if lifecycle.begin_close() {
            log::debug!("Connection {id} closing (reader finished first)");
        }
        hub.unregister(id).await;

        if let Err(e) = writer.await {
            log::error!("Writer task for {id} failed: {e}");
        }
        lifecycle.closed();
        log::info!("Connection {id} closed (user {})", identity.user_id);
    }
}

async fn read_loop<R>(
    id: ConnectionId,
    identity: &Identity,
    mut source: R,
    hub: &HubHandle,
    config: &ConnectionConfig,
    mut writer_gone: oneshot::Receiver<()>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    log::debug!("Reader for {id} started");

    loop {
        // Every frame, pongs included, restarts the idle deadline.
        let next = tokio::select! {
            _ = &mut writer_gone => {
                log::debug!("Writer for {id} is gone, stopping reader");
                return;
            }
            next = timeout(config.read_timeout, source.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                log::info!("Connection {id} idle for {:?}, closing", config.read_timeout);
                return;
            }
            Ok(None) => {
                log::debug!("Connection {id} stream ended");
                return;
            }
            Ok(Some(Err(e))) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        log::debug!("Connection {id} closed: {e}")
                    }
                    _ => log::warn!("Read error on {id}: {e}"),
                }
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let data: &[u8] = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => &bytes[..],
            Message::Close(reason) => {
                log::debug!("Connection {id} sent close: {reason:?}");
                return;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        if data.len() > config.max_frame_bytes {
            log::warn!(
                "Connection {id} sent {} bytes (limit {}), closing",
                data.len(),
                config.max_frame_bytes
            );
            return;
        }

        hub.submit(identity, data).await;
    }
}

async fn write_loop<W>(
    id: ConnectionId,
    mut sink: W,
    mut outbound: mpsc::Receiver<Payload>,
    config: ConnectionConfig,
    lifecycle: Lifecycle,
    _writer_alive: oneshot::Sender<()>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    log::debug!("Writer for {id} started");
    let ping_interval = config.ping_interval.max(MIN_PING_INTERVAL);
    let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = send_frame(&mut sink, to_frame(&payload), config.write_timeout).await {
                        log::warn!("Write error on {id}: {e}");
                        break;
                    }
                    // Traffic counts as liveness; push the next ping back.
                    keepalive.reset();
                }
                None => {
                    log::debug!("Queue for {id} closed, sending close frame");
                    if let Err(e) = send_frame(&mut sink, Message::Close(None), config.write_timeout).await {
                        log::debug!("Close frame to {id} not sent: {e}");
                    }
                    break;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Vec::new().into()), config.write_timeout).await {
                    log::warn!("Ping to {id} failed: {e}");
                    break;
                }
                log::trace!("Ping sent to {id}");
            }
        }
    }

    if lifecycle.begin_close() {
        log::debug!("Connection {id} closing (writer finished first)");
    }
    match timeout(config.write_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Closing stream for {id}: {e}"),
        Err(_) => log::debug!(
            "Closing stream for {id} timed out after {:?}",
            config.write_timeout
        ),
    }
    log::debug!("Writer for {id} stopped");
}

async fn send_frame<W>(sink: &mut W, frame: Message, deadline: Duration) -> Result<(), WriteError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(WriteError::Timeout(deadline)),
    }
}

/// Payloads are JSON, so they normally go out as text frames.
fn to_frame(payload: &[u8]) -> Message {
    match std::str::from_utf8(payload) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => Message::Binary(payload.to_vec().into()),
    }
}
