use common_redis::CustomRedisError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] CustomRedisError),

    /// A fetched record exists but does not parse as the expected JSON
    /// shape. Distinct from an absent record, and never downgraded to an
    /// empty list.
    #[error("malformed value under key {key}: {source}")]
    MalformedValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The bounded compare-and-swap loop ran out of attempts.
    #[error("gave up on key {key} after {attempts} contended write attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    /// A teardown cancelled the operation between retry attempts.
    #[error("operation cancelled by teardown")]
    Cancelled,

    #[error("registration payload must be a JSON object")]
    InvalidPayload,
}
