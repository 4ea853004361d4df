//! RocksDB-backed chat history.
//!
//! Column families:
//! - `messages`: bincode-encoded `ChatMessage`, keyed by an 8-byte
//!   big-endian sequence number so key order is append order.
//!
//! The next sequence number is recovered from the last key on open, so
//! history keeps its order across restarts.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ChatStore, StoreError};
use crate::protocol::ChatMessage;

const CF_MESSAGES: &str = "messages";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("forum_chat_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-supplied (usually temporary) directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable chat log.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next key to assign
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(
            CF_MESSAGES,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Opened chat store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Chat text compresses well and is read back in short tail scans.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        opts
    }

    /// Highest stored key + 1, or 0 for an empty log.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_MESSAGES) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_key(&key).map_or(0, |seq| seq + 1),
            _ => 0,
        }
    }

    /// Sequence number the next append will use.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_MESSAGES)
            .ok_or(StoreError::ColumnFamilyMissing(CF_MESSAGES))
    }
}

impl ChatStore for RocksStore {
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let value = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, seq.to_be_bytes(), &value, &write_opts)
            .inspect_err(|e| log::error!("Failed to store message {seq}: {e}"))?;

        log::debug!(
            "Stored message {seq} from user {} ({} bytes)",
            message.user_id,
            value.len()
        );
        Ok(())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let cf = self.cf()?;
        let mut messages = Vec::with_capacity(limit.min(1024));

        // Newest first off the reverse iterator, flipped before returning.
        for item in self.db.iterator_cf(cf, IteratorMode::End).take(limit) {
            let (_, value) = item?;
            let (message, _): (ChatMessage, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            messages.push(message);
        }
        messages.reverse();

        log::debug!("Loaded {} recent messages", messages.len());
        Ok(messages)
    }
}

fn decode_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use chrono::{TimeZone, Utc};

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open_empty() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.next_sequence(), 0);
        assert!(store.recent_messages(50).unwrap().is_empty());
    }

    #[test]
    fn test_append_and_recent_oldest_first() {
        let (_dir, store) = open_temp();
        let alice = Identity::authenticated(1, "alice");
        for i in 0..10 {
            store.append(&ChatMessage::stamped(&alice, format!("m{i}"))).unwrap();
        }

        let recent = store.recent_messages(3).unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9"]);
        assert_eq!(store.next_sequence(), 10);
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let (_dir, store) = open_temp();
        let ts = Utc.with_ymd_and_hms(2025, 4, 22, 23, 51, 38).unwrap()
            + chrono::Duration::nanoseconds(843_016_900);
        let message = ChatMessage::new(1, "testuser", "This is a test message", ts);

        store.append(&message).unwrap();
        let loaded = store.recent_messages(1).unwrap();
        assert_eq!(loaded, vec![message]);
    }

    #[test]
    fn test_sequence_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let bob = Identity::authenticated(2, "bob");

        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.append(&ChatMessage::stamped(&bob, "first")).unwrap();
            store.append(&ChatMessage::stamped(&bob, "second")).unwrap();
            store.sync().unwrap();
        }

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.next_sequence(), 2);
        store.append(&ChatMessage::stamped(&bob, "third")).unwrap();

        let contents: Vec<String> = store
            .recent_messages(50)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(decode_key(&42u64.to_be_bytes()), Some(42));
        assert_eq!(decode_key(&[1, 2, 3]), None);
    }
}
