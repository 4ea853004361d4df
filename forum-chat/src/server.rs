//! WebSocket chat server.
//!
//! Architecture:
//! ```text
//! TcpListener ──accept──► handshake (path check, ?token&user_id&username)
//!                              │
//!                              ▼
//!                    Identity (TokenValidator) ──► Connection::run
//!                                                      │
//!                                                      ▼
//!                                                 HubHandle ──► Hub (one task)
//! ```
//!
//! Shutdown closes every connection: the hub drops all outbound queues,
//! each writer sends a close frame, and the accept loop stops.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::connection::{Connection, ConnectionConfig};
use crate::hub::{Hub, HubConfig, HubHandle, HubStats};
use crate::identity::{ConnectParams, TokenValidator};
use crate::store::ChatStore;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Server is already running")]
    AlreadyRunning,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path that upgrades to the chat WebSocket
    pub ws_path: String,
    /// Hub settings (history replay, command buffer)
    pub hub: HubConfig,
    /// Per-connection timers and limits
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
            ws_path: "/ws".to_string(),
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// The chat server: one hub, one accept loop.
pub struct ChatServer {
    config: ServerConfig,
    hub: HubHandle,
    /// Taken by the first call to `run`
    pending_hub: Mutex<Option<Hub>>,
    validator: Arc<dyn TokenValidator>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn ChatStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        let (hub, handle) = Hub::new(store, config.hub.clone());
        Self {
            config,
            hub: handle,
            pending_hub: Mutex::new(Some(hub)),
            validator,
        }
    }

    /// Serve until the process ends.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every connection.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let hub = self.take_hub()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Chat server listening on {}{}",
            self.config.bind_addr,
            self.config.ws_path
        );

        let hub_task = tokio::spawn(hub.run());
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(ServerError::Io(e)),
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let config = self.config.clone();
                    let validator = self.validator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, hub, config, validator).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        };

        self.hub.shutdown().await;
        if let Err(e) = hub_task.await {
            log::error!("Hub task failed: {e}");
        }
        log::info!("Chat server stopped");
        result
    }

    fn take_hub(&self) -> Result<Hub, ServerError> {
        self.pending_hub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ServerError::AlreadyRunning)
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: HubHandle,
        config: ServerConfig,
        validator: Arc<dyn TokenValidator>,
    ) -> Result<(), ServerError> {
        let mut params = ConnectParams::default();
        let ws_path = config.ws_path.as_str();

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != ws_path {
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            params = ConnectParams::from_query(request.uri().query());
            Ok(response)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let identity = params.resolve(validator.as_ref());
        log::info!(
            "WebSocket connection from {addr}: user {} ({}), authenticated: {}",
            identity.user_id,
            identity.username,
            identity.authenticated
        );

        Connection::new(ws_stream, identity, hub, config.connection)
            .run()
            .await;
        Ok(())
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub async fn stats(&self) -> Option<HubStats> {
        self.hub.stats().await.ok()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn ws_path(&self) -> &str {
        &self.config.ws_path
    }
}
