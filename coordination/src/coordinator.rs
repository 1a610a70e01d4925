//! Lifecycle controller: gates a user start callback behind full dependency
//! resolution, gates self-registration behind a successful start, and drives
//! graceful teardown.

use std::sync::Arc;

use common_redis::{Client, KeyEvent, RedisClient, RedisConfig};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resolver::{DependencySet, DependencyUpdate};

type StartCallback = Box<dyn FnOnce() + Send>;

enum RegistrationState {
    Unregistered,
    Registered { key: String, instance_id: String },
}

struct PendingRegistration {
    key: String,
    payload: serde_json::Map<String, Value>,
}

struct State {
    dependencies: DependencySet,
    /// Self-registration declared but not yet performed. Explicitly tagged:
    /// `None` means no self-registration was declared.
    pending: Option<PendingRegistration>,
    registration: RegistrationState,
    start_callback: Option<StartCallback>,
    started: bool,
    exited: bool,
}

struct Shared {
    store: Arc<dyn Client>,
    registry: Registry,
    state: Mutex<State>,
    cancel: CancellationToken,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// One coordinating instance.
///
/// All state mutation goes through a single async mutex, so dependency
/// deliveries and start-gate evaluation happen strictly in notification
/// arrival order, one at a time. Cross-instance safety is entirely the
/// registry engine's concern.
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Connect to the backing Redis and spawn the notification listener.
    pub async fn connect(config: CoordinatorConfig) -> Result<Self> {
        let store = RedisClient::connect(RedisConfig {
            host: config.host,
            port: config.port,
            database: config.database,
            ..RedisConfig::default()
        })
        .await?;
        Ok(Self::with_store(Arc::new(store), config.retry))
    }

    /// Build a coordinator over any store implementation. Tests hand in the
    /// mock client; alternative backends only need the `Client` contract.
    pub fn with_store(store: Arc<dyn Client>, retry: RetryConfig) -> Self {
        let shared = Arc::new(Shared {
            registry: Registry::new(Arc::clone(&store), retry),
            state: Mutex::new(State {
                dependencies: DependencySet::default(),
                pending: None,
                registration: RegistrationState::Unregistered,
                start_callback: None,
                started: false,
                exited: false,
            }),
            cancel: CancellationToken::new(),
            listener: std::sync::Mutex::new(None),
            store,
        });

        let listener = spawn_listener(Arc::clone(&shared));
        store_listener(&shared, Some(listener));

        Coordinator { shared }
    }

    /// Declare a dependency: subscribe to its change channel, deliver the
    /// current value if the record already exists, and re-deliver on every
    /// subsequent change for the lifetime of this instance, including after
    /// start has fired.
    pub async fn declare_dependency<F>(&self, key: &str, callback: F) -> Result<()>
    where
        F: Fn(DependencyUpdate) + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        ensure_live(&state)?;

        // Subscribe before the initial fetch so a write landing in between
        // still produces a notification; the event waits in the channel
        // until this lock is released.
        shared.store.subscribe(key.to_string()).await?;

        let value = match shared.store.get(key.to_string()).await? {
            Some(raw) => Some(parse_value(key, &raw)?),
            None => None,
        };

        // Declared only once subscribe and the initial read succeeded; a
        // failure above leaves the set untouched instead of wedging the
        // start gate on an unsubscribed key.
        state.dependencies.declare(key, Arc::new(callback));
        state.dependencies.deliver_if_present(key, value);

        try_start(shared, &mut state).await
    }

    /// Record this instance's own registration. Before start has fired this
    /// only stores the pending entry; afterwards it registers immediately.
    pub async fn declare_self(&self, key: &str, payload: Value) -> Result<()> {
        let Value::Object(payload) = payload else {
            return Err(Error::InvalidPayload);
        };
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        ensure_live(&state)?;
        state.pending = Some(PendingRegistration {
            key: key.to_string(),
            payload,
        });
        try_register(shared, &mut state).await
    }

    /// Record the start callback and run the start gate. With zero declared
    /// dependencies the callback fires before this returns.
    pub async fn start<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        ensure_live(&state)?;
        state.start_callback = Some(Box::new(callback));
        try_start(shared, &mut state).await
    }

    /// Remove this instance's registration entry, leaving every other entry
    /// untouched. Succeeds without store traffic when nothing was ever
    /// registered.
    pub async fn unregister_self(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        ensure_live(&state)?;
        state.pending = None;
        if let RegistrationState::Registered { key, instance_id } = &state.registration {
            let (key, instance_id) = (key.clone(), instance_id.clone());
            shared
                .registry
                .remove_entry(&key, &instance_id, &shared.cancel)
                .await?;
            state.registration = RegistrationState::Unregistered;
        }
        Ok(())
    }

    /// Tear down: unregister, stop the notification listener, then release
    /// the store connections. Idempotent once complete; a failed teardown
    /// leaves the instance retryable rather than latching success with the
    /// registry entry orphaned.
    pub async fn teardown(&self) -> Result<()> {
        let shared = &self.shared;

        // Cancel first: an in-flight registration retry loop (which holds
        // the state lock) observes this between attempts and aborts instead
        // of orphaning a write.
        shared.cancel.cancel();

        {
            let mut state = shared.state.lock().await;
            if state.exited {
                return Ok(());
            }
            state.pending = None;
            if let RegistrationState::Registered { key, instance_id } =
                std::mem::replace(&mut state.registration, RegistrationState::Unregistered)
            {
                // teardown's own unregister runs to completion; it is not
                // subject to the instance cancel token
                if let Err(e) = shared
                    .registry
                    .remove_entry(&key, &instance_id, &CancellationToken::new())
                    .await
                {
                    // entry still in the store; put the registration back so
                    // a retried teardown removes it
                    state.registration = RegistrationState::Registered { key, instance_id };
                    return Err(e);
                }
            }
        }

        if let Some(listener) = store_listener(shared, None) {
            if let Err(e) = listener.await {
                if e.is_panic() {
                    warn!(error = %e, "notification listener panicked");
                }
            }
        }

        shared.store.close().await?;

        shared.state.lock().await.exited = true;
        info!("coordinator torn down");
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // a dropped instance must not keep its listener task alive
        self.shared.cancel.cancel();
    }
}

fn ensure_live(state: &State) -> Result<()> {
    if state.exited {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Swap the listener handle in or out, surviving a poisoned lock.
fn store_listener(shared: &Shared, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
    let mut guard = match shared.listener.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match handle {
        Some(handle) => guard.replace(handle),
        None => guard.take(),
    }
}

fn spawn_listener(shared: Arc<Shared>) -> JoinHandle<()> {
    let mut events = shared.store.key_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = handle_key_event(&shared, event).await {
                            warn!(error = %e, "failed to process change notification");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification listener lagged, resyncing dependencies");
                        if let Err(e) = resync_dependencies(&shared).await {
                            warn!(error = %e, "failed to resync after lagged notifications");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Fetch-then-deliver for one change notification. The state lock is held
/// across the fetch so deliveries never reorder within an instance.
async fn handle_key_event(shared: &Shared, event: KeyEvent) -> Result<()> {
    let mut state = shared.state.lock().await;
    if state.exited || !state.dependencies.contains(&event.key) {
        return Ok(());
    }
    debug!(key = %event.key, operation = %event.operation, "dependency changed");

    // fetch unconditionally: the value may be gone again after a delete
    let update = match shared.store.get(event.key.clone()).await {
        Ok(Some(raw)) => parse_value(&event.key, &raw).map(Some),
        Ok(None) => Ok(None),
        Err(e) => return Err(e.into()),
    };
    state.dependencies.deliver(&event.key, update);

    try_start(shared, &mut state).await
}

/// Recovery path for lost notifications: re-fetch every declared dependency
/// and deliver the current state, so a dropped event cannot leave the start
/// gate stuck. Absent records are delivered as deletions only for
/// dependencies that had resolved before.
async fn resync_dependencies(shared: &Shared) -> Result<()> {
    let mut state = shared.state.lock().await;
    if state.exited {
        return Ok(());
    }
    for key in state.dependencies.keys() {
        let update = match shared.store.get(key.clone()).await {
            Ok(Some(raw)) => parse_value(&key, &raw).map(Some),
            Ok(None) => Ok(None),
            Err(e) => return Err(e.into()),
        };
        state.dependencies.deliver_current(&key, update);
    }
    try_start(shared, &mut state).await
}

/// The start gate: runs only while not yet started and with a start callback
/// recorded. Once every declared dependency is resolved (vacuously true with
/// none), fires the callback exactly once, then performs any pending
/// self-registration.
async fn try_start(shared: &Shared, state: &mut State) -> Result<()> {
    if state.started || state.start_callback.is_none() {
        return Ok(());
    }
    if !state.dependencies.all_resolved() {
        return Ok(());
    }
    state.started = true;
    if let Some(callback) = state.start_callback.take() {
        info!("all dependencies resolved, starting");
        callback();
    }
    try_register(shared, state).await
}

/// Perform the pending self-registration if start has fired and nothing is
/// registered yet. On failure the pending entry is put back so a later
/// attempt can retry.
async fn try_register(shared: &Shared, state: &mut State) -> Result<()> {
    if !state.started || matches!(state.registration, RegistrationState::Registered { .. }) {
        return Ok(());
    }
    let Some(pending) = state.pending.take() else {
        return Ok(());
    };
    match shared
        .registry
        .append_entry(&pending.key, pending.payload.clone(), &shared.cancel)
        .await
    {
        Ok(instance_id) => {
            debug!(key = %pending.key, instance_id = %instance_id, "registered");
            state.registration = RegistrationState::Registered {
                key: pending.key,
                instance_id,
            };
            Ok(())
        }
        Err(e) => {
            state.pending = Some(pending);
            Err(e)
        }
    }
}

fn parse_value(key: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|source| Error::MalformedValue {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn coordinator(mock: &MockRedisClient) -> Coordinator {
        Coordinator::with_store(Arc::new(mock.clone()), RetryConfig::default())
    }

    #[tokio::test]
    async fn test_zero_dependency_start_fires_inline() {
        let mock = MockRedisClient::new();
        let c = coordinator(&mock);
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);

        c.start(move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(started.load(Ordering::SeqCst));
        // the gate check itself needs no store round trip
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_declare_self_before_start_does_not_write() {
        let mock = MockRedisClient::new();
        let c = coordinator(&mock);

        c.declare_self("services.api", json!({"host": "host1"}))
            .await
            .unwrap();
        assert!(mock.raw_value("services.api").is_none());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_object_payload_is_rejected() {
        let mock = MockRedisClient::new();
        let c = coordinator(&mock);

        let err = c
            .declare_self("services.api", json!("just a string"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload));
    }

    #[tokio::test]
    async fn test_unresolved_dependency_blocks_the_gate() {
        let mock = MockRedisClient::new();
        let c = coordinator(&mock);
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);

        c.declare_dependency("services.cache", |_| {}).await.unwrap();
        c.start(move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_malformed_dependency_value_surfaces_at_declare() {
        let mock = MockRedisClient::new();
        mock.seed("services.cache", "{ definitely not json");
        let c = coordinator(&mock);

        let err = c
            .declare_dependency("services.cache", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedValue { .. }));
    }

    #[tokio::test]
    async fn test_failed_declaration_does_not_wedge_the_gate() {
        let mock = MockRedisClient::new();
        mock.seed("services.cache", "{ definitely not json");
        let c = coordinator(&mock);
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);

        assert!(c
            .declare_dependency("services.cache", |_| {})
            .await
            .is_err());

        // the failed declaration left no entry behind, so the gate is still
        // vacuously satisfied
        c.start(move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(started.load(Ordering::SeqCst));
    }
}
