use clap::Parser;
use forum_chat::{
    ChatServer, ChatStore, MemoryStore, RejectAll, RocksStore, ServerConfig, SharedSecret,
    StoreConfig, TokenValidator,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Real-time chat hub for the forum.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CHAT_BIND_ADDR", default_value = "127.0.0.1:8081")]
    bind: String,

    /// Request path that upgrades to the chat WebSocket
    #[arg(long, env = "CHAT_WS_PATH", default_value = "/ws")]
    ws_path: String,

    /// RocksDB directory; messages are kept in memory when omitted
    #[arg(long, env = "CHAT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Token accepted as proof of identity
    #[arg(long, env = "CHAT_SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// Messages replayed to a client when it joins
    #[arg(long, env = "CHAT_HISTORY_LIMIT", default_value_t = 50)]
    history_limit: usize,

    /// Outbound frames buffered per client before it is dropped
    #[arg(long, env = "CHAT_QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let store: Arc<dyn ChatStore> = match &args.db_path {
        Some(path) => {
            log::info!("Persisting chat history to {}", path.display());
            Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)
        }
        None => {
            log::warn!("No database path configured, chat history is kept in memory");
            Arc::new(MemoryStore::default())
        }
    };

    let validator: Arc<dyn TokenValidator> = match args.shared_secret {
        Some(secret) if !secret.is_empty() => Arc::new(SharedSecret::new(secret)),
        _ => {
            log::warn!("No shared secret configured, every client is unauthenticated");
            Arc::new(RejectAll)
        }
    };

    let mut config = ServerConfig {
        bind_addr: args.bind,
        ws_path: args.ws_path,
        ..ServerConfig::default()
    };
    config.hub.history_limit = args.history_limit;
    config.connection.queue_capacity = args.queue_capacity.max(1);

    let server = ChatServer::new(config, store, validator);
    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutdown signal received, closing all connections");
}
