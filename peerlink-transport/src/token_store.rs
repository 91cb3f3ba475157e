use std::sync::Mutex;

use bytes::Bytes;
use quinn::TokenStore;

/// Bounded in-memory store for address-validation tokens.
///
/// Tokens let a reconnecting client skip address validation and attempt
/// 0-RTT. The store is a single LIFO: the server name is ignored and the
/// most recent token wins, with the oldest evicted when full. A capacity of
/// zero disables storage.
pub struct MemoryTokenStore {
    capacity: usize,
    tokens: Mutex<Vec<Bytes>>,
}

impl MemoryTokenStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tokens: Mutex::new(Vec::new()),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn insert(&self, _server_name: &str, token: Bytes) {
        // A zero-capacity store holds nothing.
        if self.capacity == 0 {
            return;
        }
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.len() >= self.capacity {
            tokens.remove(0);
        }
        tokens.push(token);
    }

    fn take(&self, _server_name: &str) -> Option<Bytes> {
        self.tokens.lock().unwrap().pop()
    }
}
