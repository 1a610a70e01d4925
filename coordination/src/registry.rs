//! Atomic registry engine: append/remove of entries in a shared list value
//! via optimistic concurrency (read, modify, conditional-write, retry on
//! conflict).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common_redis::{Client, SwapOutcome};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// One instance's announcement inside a registration list: the caller's
/// payload fields plus the generated instance id used to target removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub instance_id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

/// `<wall-clock-millis>:<random 0..999999>`, unique within one registration
/// list with overwhelming probability.
pub fn generate_instance_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let nonce = rand::thread_rng().gen_range(0..1_000_000);
    format!("{millis}:{nonce}")
}

/// Multi-writer-safe mutation of shared registration lists. Correctness
/// under concurrent callers rests entirely on the store's conditional-swap
/// atomicity; the engine itself holds no cross-instance state.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Client>,
    retry: RetryConfig,
}

impl Registry {
    pub fn new(store: Arc<dyn Client>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Append `payload` plus a fresh instance id to the list under `key` and
    /// return the id. `cancel` is checked between attempts so a concurrent
    /// teardown aborts a pending registration instead of orphaning a write.
    pub async fn append_entry(
        &self,
        key: &str,
        payload: serde_json::Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let entry = RegistrationEntry {
            instance_id: generate_instance_id(),
            payload,
        };
        self.mutate(key, cancel, |mut entries| {
            entries.push(entry.clone());
            Some(entries)
        })
        .await?;
        Ok(entry.instance_id)
    }

    /// Remove exactly the entry whose instance id matches, leaving every
    /// other entry untouched. An absent record, or a list that does not
    /// contain the id, is already clean and succeeds without a write.
    pub async fn remove_entry(
        &self,
        key: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.mutate(key, cancel, |entries| {
            let filtered: Vec<RegistrationEntry> = entries
                .iter()
                .filter(|e| e.instance_id != instance_id)
                .cloned()
                .collect();
            if filtered.len() == entries.len() {
                None
            } else {
                Some(filtered)
            }
        })
        .await
    }

    /// The read-modify-conditional-write loop shared by append and remove.
    /// `modify` returning `None` means the list already has the desired
    /// shape and no write is needed.
    async fn mutate<F>(&self, key: &str, cancel: &CancellationToken, mut modify: F) -> Result<()>
    where
        F: FnMut(Vec<RegistrationEntry>) -> Option<Vec<RegistrationEntry>>,
    {
        for attempt in 0..self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(&self.retry, attempt)).await;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }

            let raw = self.store.get(key.to_string()).await?;
            let entries = match &raw {
                Some(raw) => parse_entries(key, raw)?,
                None => Vec::new(),
            };

            let Some(candidate) = modify(entries) else {
                return Ok(());
            };
            let candidate =
                serde_json::to_string(&candidate).expect("registration entries always serialize");

            match self.store.swap_if(key.to_string(), raw, candidate).await? {
                SwapOutcome::Swapped => {
                    trace!(key = %key, attempt, "conditional write applied");
                    return Ok(());
                }
                SwapOutcome::Conflict => {
                    debug!(key = %key, attempt, "conditional write lost the race, retrying");
                }
            }
        }

        Err(Error::ContentionExhausted {
            key: key.to_string(),
            attempts: self.retry.max_attempts,
        })
    }
}

fn parse_entries(key: &str, raw: &str) -> Result<Vec<RegistrationEntry>> {
    serde_json::from_str(raw).map_err(|source| Error::MalformedValue {
        key: key.to_string(),
        source,
    })
}

/// Full-jitter exponential backoff: a uniform draw from zero up to the
/// capped exponential delay for this attempt.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let cap = retry
        .initial_backoff
        .saturating_mul(1u32 << shift)
        .min(retry.max_backoff);
    let cap_ms = cap.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;
    use serde_json::json;

    fn payload(host: &str) -> serde_json::Map<String, Value> {
        let Value::Object(map) = json!({ "host": host }) else {
            unreachable!()
        };
        map
    }

    fn registry(mock: &MockRedisClient, retry: RetryConfig) -> Registry {
        Registry::new(Arc::new(mock.clone()), retry)
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_instance_ids_have_two_numeric_parts() {
        let id = generate_instance_id();
        let (millis, nonce) = id.split_once(':').expect("id should contain a colon");
        assert!(millis.parse::<u128>().is_ok());
        let nonce: u32 = nonce.parse().unwrap();
        assert!(nonce < 1_000_000);
    }

    #[test]
    fn test_backoff_stays_within_the_cap() {
        let retry = RetryConfig::default();
        for attempt in 1..10 {
            assert!(backoff_delay(&retry, attempt) <= retry.max_backoff);
        }
    }

    #[tokio::test]
    async fn test_append_creates_the_list() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, RetryConfig::default());
        let cancel = CancellationToken::new();

        let id = registry
            .append_entry("services.api", payload("host1"), &cancel)
            .await
            .unwrap();

        let raw = mock.raw_value("services.api").unwrap();
        let entries: Vec<RegistrationEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instance_id, id);
        assert_eq!(entries[0].payload["host"], json!("host1"));
    }

    #[tokio::test]
    async fn test_append_retries_through_conflicts() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, fast_retry(8));
        mock.fail_next_swaps(3);

        registry
            .append_entry("services.api", payload("host1"), &CancellationToken::new())
            .await
            .unwrap();

        let swaps = mock.calls().iter().filter(|c| c.op == "swap_if").count();
        assert_eq!(swaps, 4);
    }

    #[tokio::test]
    async fn test_append_gives_up_after_max_attempts() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, fast_retry(3));
        mock.fail_next_swaps(3);

        let err = registry
            .append_entry("services.api", payload("host1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ContentionExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_any_store_call() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, RetryConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry
            .append_entry("services.api", payload("host1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_list_is_an_error_not_an_empty_list() {
        let mock = MockRedisClient::new();
        mock.seed("services.api", "not json at all");
        let registry = registry(&mock, RetryConfig::default());

        let err = registry
            .append_entry("services.api", payload("host1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedValue { .. }));
        // nothing was overwritten
        assert_eq!(
            mock.raw_value("services.api").as_deref(),
            Some("not json at all")
        );
    }

    #[tokio::test]
    async fn test_remove_on_absent_key_is_a_clean_noop() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, RetryConfig::default());

        registry
            .remove_entry("services.api", "123:456", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!mock.calls().iter().any(|c| c.op == "swap_if"));
    }

    #[tokio::test]
    async fn test_remove_drops_only_the_matching_entry() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, RetryConfig::default());
        let cancel = CancellationToken::new();

        let first = registry
            .append_entry("services.api", payload("host1"), &cancel)
            .await
            .unwrap();
        let second = registry
            .append_entry("services.api", payload("host2"), &cancel)
            .await
            .unwrap();

        registry
            .remove_entry("services.api", &first, &cancel)
            .await
            .unwrap();

        let raw = mock.raw_value("services.api").unwrap();
        let entries: Vec<RegistrationEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instance_id, second);
        assert_eq!(entries[0].payload["host"], json!("host2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_appends_lose_no_updates() {
        let mock = MockRedisClient::new();
        let registry = registry(&mock, RetryConfig::default());

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .append_entry("services.api", payload(&format!("host{i}")), &CancellationToken::new())
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        let raw = mock.raw_value("services.api").unwrap();
        let entries: Vec<RegistrationEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 8);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
