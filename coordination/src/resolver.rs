//! Dependency resolver: tracks the set of named dependencies one instance
//! is waiting on, delivers observed values to the declaring callback, and
//! keeps the per-dependency one-way `resolved` flag the start gate reads.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;

/// Delivered on every observed change of a declared dependency: the parsed
/// current value (`None` after a delete), or the malformed-value error for a
/// record that exists but does not parse.
pub type DependencyUpdate = std::result::Result<Option<Value>, Error>;

pub type DependencyCallback = Arc<dyn Fn(DependencyUpdate) + Send + Sync>;

struct Dependency {
    callback: DependencyCallback,
    resolved: bool,
}

/// The dependency set is owned by its instance; there is no shared or
/// global subscription state.
#[derive(Default)]
pub(crate) struct DependencySet {
    deps: HashMap<String, Dependency>,
}

impl DependencySet {
    pub fn declare(&mut self, key: &str, callback: DependencyCallback) {
        self.deps.insert(
            key.to_string(),
            Dependency {
                callback,
                resolved: false,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.deps.contains_key(key)
    }

    /// Vacuously true with zero dependencies.
    pub fn all_resolved(&self) -> bool {
        self.deps.values().all(|dep| dep.resolved)
    }

    /// Invoke the callback for `key` with a fetched value. A successful
    /// delivery marks the dependency resolved (idempotent; the flag never
    /// reverts, even when the value is gone); an error delivery leaves the
    /// flag untouched. Keys never declared are ignored.
    pub fn deliver(&mut self, key: &str, update: DependencyUpdate) {
        let Some(dep) = self.deps.get_mut(key) else {
            return;
        };
        let delivered = update.is_ok();
        (dep.callback)(update);
        if delivered {
            dep.resolved = true;
        }
    }

    /// Existence-gated initial delivery: invoke the callback only when the
    /// record was present at declaration time, so a dependency that does
    /// not exist yet never sees a spurious "deleted" delivery.
    pub fn deliver_if_present(&mut self, key: &str, value: Option<Value>) {
        if let Some(value) = value {
            self.deliver(key, Ok(Some(value)));
        }
    }

    /// Delivery for a resynchronization pass after notifications were lost.
    /// A present value is delivered normally; an absent record is delivered
    /// as a deletion only when the dependency had resolved before, so a
    /// record never observed stays pending without a spurious delivery.
    pub fn deliver_current(&mut self, key: &str, update: DependencyUpdate) {
        match update {
            Ok(None) => {
                if self.deps.get(key).is_some_and(|dep| dep.resolved) {
                    self.deliver(key, Ok(None));
                }
            }
            other => self.deliver(key, other),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.deps.keys().cloned().collect()
    }
}
