//! Persistence integration tests.
//!
//! Verifies:
//! - Authenticated messages land in RocksDB through the full server stack
//! - History replay is capped and oldest first
//! - Restart: stop the server, reopen the database, history survives

use forum_chat::client::ChatClient;
use forum_chat::identity::{ConnectParams, SharedSecret};
use forum_chat::server::{ChatServer, ServerConfig};
use forum_chat::store::{ChatStore, RocksStore, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const SECRET: &str = "persist-secret";
const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn open_store(path: &Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

struct Running {
    url: String,
    server: Arc<ChatServer>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn start(store: Arc<RocksStore>) -> Running {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(ChatServer::new(
        config,
        store,
        Arc::new(SharedSecret::new(SECRET)),
    ));

    let (stop, stopped) = oneshot::channel::<()>();
    let running = server.clone();
    let task = tokio::spawn(async move {
        running
            .run_until(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Running {
        url: format!("ws://127.0.0.1:{port}/ws"),
        server,
        stop,
        task,
    }
}

async fn wait_for_active(server: &ChatServer, expected: usize) {
    for _ in 0..100 {
        let active = server.stats().await.map(|s| s.active_connections).unwrap_or(0);
        if active == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} active connections");
}

async fn wait_for_stored(store: &RocksStore, expected: usize) {
    for _ in 0..200 {
        if store.recent_messages(usize::MAX).unwrap().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} stored messages");
}

fn alice() -> ConnectParams {
    ConnectParams {
        token: Some(SECRET.to_string()),
        user_id: Some(1),
        username: Some("alice".to_string()),
    }
}

fn guest() -> ConnectParams {
    ConnectParams {
        token: None,
        user_id: Some(9),
        username: Some("guest".to_string()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_messages_persisted_through_server() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let running = start(store.clone()).await;

    let mut client = ChatClient::connect_with(&running.url, &alice()).await.unwrap();
    wait_for_active(&running.server, 1).await;
    client.send_text("persist me").await.unwrap();
    assert_eq!(client.next_message(WAIT).await.unwrap().content, "persist me");

    wait_for_stored(&store, 1).await;
    let stored = store.recent_messages(50).unwrap();
    assert_eq!(stored[0].content, "persist me");
    assert_eq!(stored[0].username, "alice");
    assert_eq!(store.next_sequence(), 1);
}

#[tokio::test]
async fn test_history_capped_to_latest_fifty() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let running = start(store.clone()).await;

    let mut writer = ChatClient::connect_with(&running.url, &alice()).await.unwrap();
    wait_for_active(&running.server, 1).await;
    for i in 0..60 {
        writer.send_text(&format!("msg {i}")).await.unwrap();
    }
    wait_for_stored(&store, 60).await;

    let mut reader = ChatClient::connect_with(&running.url, &guest()).await.unwrap();
    let history: Vec<String> = reader
        .drain(QUIET)
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();

    let expected: Vec<String> = (10..60).map(|i| format!("msg {i}")).collect();
    assert_eq!(history, expected);
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempdir().unwrap();

    {
        let store = open_store(dir.path());
        let running = start(store.clone()).await;

        let mut client = ChatClient::connect_with(&running.url, &alice()).await.unwrap();
        wait_for_active(&running.server, 1).await;
        for text in ["first", "second"] {
            client.send_text(text).await.unwrap();
        }
        wait_for_stored(&store, 2).await;
        store.sync().unwrap();

        running.stop.send(()).unwrap();
        running.task.await.unwrap();
        drop(client);
        drop(running.server);

        // Connection tasks hold the store until they finish closing.
        for _ in 0..200 {
            if Arc::strong_count(&store) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&store), 1, "store still shared after shutdown");
    }

    let store = open_store(dir.path());
    assert_eq!(store.next_sequence(), 2);
    let running = start(store.clone()).await;

    let mut client = ChatClient::connect_with(&running.url, &guest()).await.unwrap();
    let history: Vec<String> = client
        .drain(QUIET)
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, vec!["first", "second"]);

    // Unauthenticated messages after restart are still not persisted.
    client.send_text("ephemeral").await.unwrap();
    tokio::time::sleep(QUIET).await;
    assert_eq!(store.recent_messages(50).unwrap().len(), 2);
}
