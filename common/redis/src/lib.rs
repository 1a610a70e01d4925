//! Minimal key-value coordination store abstraction over Redis.
//!
//! The [`Client`] trait is the full capability contract the coordination
//! core needs from its backing store: GET / SET / DEL, a per-key
//! change-notification subscription, and one atomic conditional-swap
//! primitive. [`RedisClient`] implements it against a real server;
//! [`MockRedisClient`] is an in-memory stand-in with the same semantics,
//! used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

/// Outcome of a conditional swap: either the candidate value was written,
/// or the record changed since the caller read it and nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped,
    Conflict,
}

/// A change notification for a single record key.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub key: String,
    /// The store-side command that fired the event ("set", "del", ...).
    pub operation: String,
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Fetch the raw value under `key`; an absent record is `None`, not an
    /// error.
    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError>;

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;

    async fn del(&self, k: String) -> Result<(), CustomRedisError>;

    /// Atomic compare-and-set, executed as a single server-side step: write
    /// `candidate` iff the current raw value equals `expected`, or the key
    /// is absent and `expected` is `None`.
    async fn swap_if(
        &self,
        k: String,
        expected: Option<String>,
        candidate: String,
    ) -> Result<SwapOutcome, CustomRedisError>;

    /// Subscribe to change notifications for `key`. Events arrive on the
    /// stream returned by [`key_events`](Client::key_events).
    async fn subscribe(&self, key: String) -> Result<(), CustomRedisError>;

    /// The notification stream for this client. Every call returns a fresh
    /// receiver positioned at the current end of the stream.
    fn key_events(&self) -> broadcast::Receiver<KeyEvent>;

    /// Release the command and subscription connections. Subsequent
    /// operations fail with [`CustomRedisError::ConnectionClosed`].
    async fn close(&self) -> Result<(), CustomRedisError>;
}

mod client;
mod mock;

pub use client::{RedisClient, RedisConfig};
pub use mock::{MockRedisCall, MockRedisClient};
