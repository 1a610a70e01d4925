use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{Client, CustomRedisError, KeyEvent, SwapOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Conditional swap, executed server-side as one atomic step. ARGV[1] is the
/// raw value the caller read, ARGV[2] the candidate, ARGV[3] is "1" when the
/// caller read the key as absent (GET on a missing key returns false in
/// Lua). Branching on ARGV[3] first keeps "read as absent" and "read as
/// empty string" distinct: a create never overwrites a value that appeared
/// in the meantime, not even an empty one.
const SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[3] == '1' then
  if current == false then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
  end
  return 0
end
if current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

static SWAP: Lazy<redis::Script> = Lazy::new(|| redis::Script::new(SWAP_SCRIPT));

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    /// Issue `CONFIG SET notify-keyspace-events` on connect so key
    /// subscriptions actually fire. Disable when the server is already
    /// configured (e.g. managed Redis that rejects CONFIG).
    pub configure_keyspace_events: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            configure_keyspace_events: true,
        }
    }
}

impl RedisConfig {
    fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Keyspace notifications arrive on `__keyspace@<db>__:<key>` with the
    /// command name as payload.
    fn keyspace_prefix(&self) -> String {
        format!("__keyspace@{}__:", self.database)
    }
}

/// Store client backed by a real Redis server.
///
/// Owns exactly two connections: one multiplexed command connection and one
/// pub/sub connection for keyspace notifications. Both are released once,
/// via [`close`](Client::close).
pub struct RedisClient {
    connection: MultiplexedConnection,
    subscriber: Mutex<PubSubSink>,
    events: broadcast::Sender<KeyEvent>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    keyspace_prefix: String,
    closed: AtomicBool,
}

impl RedisClient {
    pub async fn connect(config: RedisConfig) -> Result<Self, CustomRedisError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| CustomRedisError::InvalidConfiguration(e.to_string()))?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        if config.configure_keyspace_events {
            // K = keyspace channel, g = generic commands (DEL), $ = string
            // commands (SET), x = expirations
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Kg$x")
                .query_async::<()>(&mut connection)
                .await?;
        }

        let pubsub = client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let keyspace_prefix = config.keyspace_prefix();
        let listener = {
            let events = events.clone();
            let prefix = keyspace_prefix.clone();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name();
                    let Some(key) = channel.strip_prefix(&prefix) else {
                        continue;
                    };
                    let operation: String = match msg.get_payload() {
                        Ok(operation) => operation,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "unreadable keyspace event payload");
                            continue;
                        }
                    };
                    // send only fails when no receiver exists, which is fine
                    let _unused = events.send(KeyEvent {
                        key: key.to_string(),
                        operation,
                    });
                }
            })
        };

        Ok(Self {
            connection,
            subscriber: Mutex::new(sink),
            events,
            listener: StdMutex::new(Some(listener)),
            keyspace_prefix,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), CustomRedisError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CustomRedisError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(k).await?;
        Ok(value)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(k, v).await?;
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(k).await?;
        Ok(())
    }

    async fn swap_if(
        &self,
        k: String,
        expected: Option<String>,
        candidate: String,
    ) -> Result<SwapOutcome, CustomRedisError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        let allow_create = if expected.is_none() { "1" } else { "0" };
        let swapped: i64 = SWAP
            .key(&k)
            .arg(expected.unwrap_or_default())
            .arg(candidate)
            .arg(allow_create)
            .invoke_async(&mut conn)
            .await?;
        Ok(if swapped == 1 {
            SwapOutcome::Swapped
        } else {
            SwapOutcome::Conflict
        })
    }

    async fn subscribe(&self, key: String) -> Result<(), CustomRedisError> {
        self.ensure_open()?;
        let channel = format!("{}{}", self.keyspace_prefix, key);
        let mut sink = self.subscriber.lock().await;
        sink.subscribe(channel).await?;
        Ok(())
    }

    fn key_events(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), CustomRedisError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = match self.listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        Ok(())
    }
}
