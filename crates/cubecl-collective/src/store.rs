//! Key-value stores used to exchange bootstrap ids between ranks.

use crate::error::StoreError;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use web_time::Instant;

/// A key-value store shared by every rank of a process group.
pub trait Store: Send + Sync {
    /// Publish a value under the given key, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Get the value published under the given key, waiting for it to be published.
    ///
    /// The wait is bounded by the store's own timeout.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().set(key, value)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.as_ref().get(key)
    }
}

/// An in-process store, shared by ranks running as threads of the same process.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    cond: Condvar,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Vec<u8>>,
    closed: bool,
}

impl MemoryStore {
    /// Default time a [get](Store::get) waits for a key.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Create a new store with the [default timeout](Self::DEFAULT_TIMEOUT).
    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Create a new store where [get](Store::get) gives up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Close the store, failing every pending and future call.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.cond.notify_all();
    }

    /// Number of keys currently published.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.values.len()
    }

    /// Whether no key was published yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(StoreError::Closed);
        }

        state.values.insert(key.to_string(), value.to_vec());
        self.cond.notify_all();

        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if state.closed {
                return Err(StoreError::Closed);
            }
            if let Some(value) = state.values.get(key) {
                return Ok(value.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout {
                    key: key.to_string(),
                });
            }

            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
