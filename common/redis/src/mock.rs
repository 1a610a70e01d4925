use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Client, CustomRedisError, KeyEvent, SwapOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One recorded store operation, for tests that assert on traffic.
#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: &'static str,
    pub key: String,
}

/// In-memory stand-in for a Redis server.
///
/// Unlike a canned-response mock, this implements the semantics the
/// coordination core depends on: `swap_if` compares and writes under a
/// single lock acquisition, and every mutation publishes a [`KeyEvent`].
/// Cloning yields a new client handle to the same server: the backing map,
/// event channel, forced-conflict counter and call log are shared, while the
/// closed flag is per-handle. A test can run any number of instances against
/// one store.
pub struct MockRedisClient {
    values: Arc<Mutex<HashMap<String, String>>>,
    events: broadcast::Sender<KeyEvent>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
    forced_conflicts: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

impl Clone for MockRedisClient {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            events: self.events.clone(),
            calls: Arc::clone(&self.calls),
            forced_conflicts: Arc::clone(&self.forced_conflicts),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for MockRedisClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            values: Arc::new(Mutex::new(HashMap::new())),
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
            forced_conflicts: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockRedisCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &'static str, key: &str) {
        self.lock_calls().push(MockRedisCall {
            op,
            key: key.to_string(),
        });
    }

    fn publish(&self, key: &str, operation: &str) {
        let _unused = self.events.send(KeyEvent {
            key: key.to_string(),
            operation: operation.to_string(),
        });
    }

    fn ensure_open(&self) -> Result<(), CustomRedisError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CustomRedisError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Consume one forced conflict if any remain.
    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Force the next `n` swap attempts (across all handles) to report
    /// `Conflict`, for deterministic contention tests.
    pub fn fail_next_swaps(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }

    /// Direct peek at a stored raw value, without going through the call log.
    pub fn raw_value(&self, key: &str) -> Option<String> {
        self.lock_values().get(key).cloned()
    }

    /// Seed a value without firing an event. Models state that existed
    /// before any instance connected.
    pub fn seed(&self, key: &str, value: &str) {
        self.lock_values()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        self.ensure_open()?;
        self.record("get", &k);
        Ok(self.lock_values().get(&k).cloned())
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        self.record("set", &k);
        self.lock_values().insert(k.clone(), v);
        self.publish(&k, "set");
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        self.record("del", &k);
        let removed = self.lock_values().remove(&k).is_some();
        // real Redis fires no event when DEL hits a missing key
        if removed {
            self.publish(&k, "del");
        }
        Ok(())
    }

    async fn swap_if(
        &self,
        k: String,
        expected: Option<String>,
        candidate: String,
    ) -> Result<SwapOutcome, CustomRedisError> {
        self.ensure_open()?;
        self.record("swap_if", &k);
        if self.take_forced_conflict() {
            return Ok(SwapOutcome::Conflict);
        }
        {
            let mut values = self.lock_values();
            let matches = match (&expected, values.get(&k)) {
                (Some(expected), Some(current)) => expected == current,
                (None, None) => true,
                _ => false,
            };
            if !matches {
                return Ok(SwapOutcome::Conflict);
            }
            values.insert(k.clone(), candidate);
        }
        self.publish(&k, "set");
        Ok(SwapOutcome::Swapped)
    }

    async fn subscribe(&self, key: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        // Every handle's receiver sees every event; consumers filter on the
        // keys they declared, which is the same set a real subscription
        // would deliver.
        self.record("subscribe", &key);
        Ok(())
    }

    fn key_events(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), CustomRedisError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
