//! Redis sink (list, stream or pub/sub), using the `redis` crate's
//! `tokio-comp` + `connection-manager` features for a self-reconnecting
//! multiplexed connection, the way `vector`'s sinks lean on their client
//! crates' own reconnect machinery rather than re-implementing it. The
//! initial connect makes at most `max_retries + 1` attempts (`0` means a
//! single attempt, no retry) and then returns `Err` — it never loops
//! unbounded, so a down Redis instance always surfaces a failure the
//! pipeline's Retry Manager and circuit breaker can observe, per the
//! sinks' fail-fast contract.
use super::{Sink, SinkError};
use crate::config::{RedisMode, RedisSinkConfig};
use crate::record::LogRecord;
use crate::serializer::{Serializer, SerializerConfig};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

pub struct RedisSink {
    config: RedisSinkConfig,
    serializer: Serializer,
    connection: RwLock<Option<ConnectionManager>>,
    client: redis::Client,
}

impl std::fmt::Debug for RedisSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSink")
            .field("url", &self.config.url)
            .field("mode", &self.config.mode)
            .finish()
    }
}

impl RedisSink {
    pub fn new(config: RedisSinkConfig) -> Result<RedisSink, SinkError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(RedisSink {
            config,
            serializer: Serializer::new(SerializerConfig::default()),
            connection: RwLock::new(None),
            client,
        })
    }

    /// Returns the current connection, establishing one if needed. Because
    /// `ConnectionManager` itself reconnects transparently on a dropped
    /// socket once established, this only needs to run once per process
    /// lifetime absent a hard initial-connect failure. Makes at most
    /// `max_retries + 1` attempts, each separated by exponential backoff,
    /// then returns `Err` — bounded even when `max_retries` is `0`, so the
    /// circuit breaker always eventually sees a failure for a down Redis
    /// instance instead of this call blocking forever.
    async fn connection(&self) -> Result<ConnectionManager, SinkError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut attempt: u32 = 0;
        loop {
            let manager_config = ConnectionManagerConfig::new()
                .set_connection_timeout(Duration::from_millis(self.config.connect_timeout_ms))
                .set_response_timeout(Duration::from_millis(self.config.command_timeout_ms));
            match self.client.get_connection_manager_with_config(manager_config).await {
                Ok(conn) => {
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        return Err(err.into());
                    }
                    attempt += 1;
                    let delay = reconnect_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "redis connection failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Backoff before reconnect attempt `attempt` (1-indexed): doubles from
/// 200ms, capped at 30s, plus uniform jitter up to half the capped delay.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = 200u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let capped = base.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=(capped / 2).max(1));
    Duration::from_millis(capped + jitter)
}

#[async_trait]
impl Sink for RedisSink {
    async fn send(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let mut conn = self.connection().await?;
        let payloads: Vec<Vec<u8>> = batch.iter().map(|r| self.serializer.serialize(r)).collect();

        match self.config.mode {
            RedisMode::List => {
                let _: () = conn.lpush(&self.config.key, payloads.clone()).await?;
                if let Some(max_len) = self.config.max_list_len {
                    let _: () = conn.ltrim(&self.config.key, -(max_len as isize), -1).await?;
                }
            }
            RedisMode::Stream => {
                for payload in &payloads {
                    let _: () = conn
                        .xadd(&self.config.key, "*", &[("record", payload.as_slice())])
                        .await?;
                }
            }
            RedisMode::Pubsub => {
                for payload in &payloads {
                    let _: () = conn.publish(&self.config.key, payload.as_slice()).await?;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_url() {
        let config = RedisSinkConfig {
            url: "not-a-url".to_owned(),
            ..RedisSinkConfig::default()
        };
        assert!(RedisSink::new(config).is_err());
    }

    #[test]
    fn reconnect_delay_is_bounded_and_grows() {
        let first = reconnect_delay(1);
        let later = reconnect_delay(20);
        assert!(first.as_millis() >= 200);
        assert!(later.as_millis() <= 45_000);
        assert!(later >= first);
    }
}
