//! Redis backplane
//!
//! Broadcasts travel over Redis pub/sub; member counters are plain integer
//! keys. Commands share one multiplexed connection, while every
//! subscription owns a dedicated pub/sub connection.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Backplane, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BackplaneError;

/// Decrements a counter and deletes it once it reaches zero, atomically
const DECREMENT_SCRIPT: &str = r#"
local count = redis.call('DECR', KEYS[1])
if count <= 0 then
    redis.call('DEL', KEYS[1])
end
return count
"#;

/// Backplane backed by a Redis server
#[derive(Clone)]
pub struct RedisBackplane {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    decrement: ::redis::Script,
}

impl RedisBackplane {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url = %url, "Connected to Redis backplane");

        Ok(Self {
            client,
            conn,
            decrement: ::redis::Script::new(DECREMENT_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisBackplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackplane").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = channel.to_string();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => {
                            let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::warn!(channel = %name, "Redis subscription stream ended");
                            break;
                        }
                    },
                }
            }
            tracing::debug!(channel = %name, "Redis subscription closed");
        });

        Ok(Subscription::new(channel, rx, cancel))
    }

    async fn increment(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn decrement(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut conn = self.conn.clone();
        let count: i64 = self.decrement.key(key).invoke_async(&mut conn).await?;
        Ok(count)
    }

    async fn count(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }
}
