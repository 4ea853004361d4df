use criterion::{criterion_group, criterion_main, Criterion};
use forum_chat::connection::ConnectionHandle;
use forum_chat::hub::{Hub, HubConfig};
use forum_chat::identity::Identity;
use forum_chat::protocol::{ChatMessage, InboundFrame};
use forum_chat::store::{ChatStore, MemoryStore, RocksStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;

fn bench_frame_parse_json(c: &mut Criterion) {
    let raw = br#"{"userID":1,"username":"alice","content":"hello everyone"}"#;

    c.bench_function("frame_parse_json", |b| {
        b.iter(|| {
            black_box(InboundFrame::parse(black_box(raw)));
        })
    });
}

fn bench_frame_parse_raw_text(c: &mut Criterion) {
    let raw = b"just some plain text that is not json";

    c.bench_function("frame_parse_raw_text", |b| {
        b.iter(|| {
            black_box(InboundFrame::parse(black_box(raw)));
        })
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let sender = Identity::authenticated(1, "alice");
    let msg = ChatMessage::stamped(&sender, "hello everyone");

    c.bench_function("message_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_fanout(c: &mut Criterion, clients: usize) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sender = Identity::unauthenticated(1, "alice");

    c.bench_function(&format!("hub_submit_fanout_{clients}"), |b| {
        b.iter(|| {
            rt.block_on(async {
                let (hub, task) = Hub::spawn(Arc::new(MemoryStore::default()), HubConfig::default());
                let mut receivers = Vec::with_capacity(clients);
                for i in 0..clients {
                    let (handle, rx) =
                        ConnectionHandle::new(Identity::unauthenticated(i as i64, "peer"), 256);
                    hub.register(handle).await.unwrap();
                    receivers.push(rx);
                }

                hub.submit(&sender, black_box(b"hello everyone")).await;
                for rx in &mut receivers {
                    black_box(rx.recv().await);
                }

                hub.shutdown().await;
                task.await.unwrap();
            });
        })
    });
}

fn bench_fanout_10(c: &mut Criterion) {
    bench_fanout(c, 10);
}

fn bench_fanout_100(c: &mut Criterion) {
    bench_fanout(c, 100);
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let msg = ChatMessage::stamped(&Identity::authenticated(1, "alice"), "hello everyone");

    c.bench_function("rocks_append", |b| {
        b.iter(|| {
            store.append(black_box(&msg)).unwrap();
        })
    });
}

fn bench_rocks_recent_50(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let sender = Identity::authenticated(1, "alice");
    for i in 0..1000 {
        store
            .append(&ChatMessage::stamped(&sender, format!("message {i}")))
            .unwrap();
    }

    c.bench_function("rocks_recent_50", |b| {
        b.iter(|| {
            black_box(store.recent_messages(black_box(50)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_frame_parse_json,
    bench_frame_parse_raw_text,
    bench_message_encode,
    bench_fanout_10,
    bench_fanout_100,
    bench_rocks_append,
    bench_rocks_recent_50,
);
criterion_main!(benches);
