//! In-process chat history, bounded to the most recent messages.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::{ChatStore, StoreError};
use crate::protocol::ChatMessage;

/// Default number of messages retained.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Ring of the most recent messages. Oldest messages are evicted first.
pub struct MemoryStore {
    messages: Mutex<VecDeque<ChatMessage>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock can't leave the deque half-updated,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<ChatMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl ChatStore for MemoryStore {
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut messages = self.lock();
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(message.clone());
        Ok(())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.lock();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn msg(content: &str) -> ChatMessage {
        ChatMessage::stamped(&Identity::authenticated(1, "alice"), content)
    }

    #[test]
    fn test_recent_messages_oldest_first() {
        let store = MemoryStore::new(100);
        for i in 0..5 {
            store.append(&msg(&format!("m{i}"))).unwrap();
        }

        let recent = store.recent_messages(3).unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_limit_larger_than_history() {
        let store = MemoryStore::new(100);
        store.append(&msg("only")).unwrap();
        assert_eq!(store.recent_messages(50).unwrap().len(), 1);
        assert!(MemoryStore::default().recent_messages(50).unwrap().is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = MemoryStore::new(2);
        store.append(&msg("a")).unwrap();
        store.append(&msg("b")).unwrap();
        store.append(&msg("c")).unwrap();

        assert_eq!(store.len(), 2);
        let recent = store.recent_messages(10).unwrap();
        assert_eq!(recent[0].content, "b");
        assert_eq!(recent[1].content, "c");
    }

    #[test]
    fn test_zero_limit() {
        let store = MemoryStore::new(4);
        store.append(&msg("a")).unwrap();
        assert!(store.recent_messages(0).unwrap().is_empty());
    }
}
