//! Thin Redis key-value helpers sharing the bus connection settings.

use std::time::Duration;

use tracing::instrument;

use crate::event_bus::{RedisBusError, with_connection};

#[derive(Debug, Clone)]
pub struct RedisKeyValue {
    client: redis::Client,
}

impl RedisKeyValue {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisBusError> {
        let key = key.to_string();
        with_connection(&self.client, "GET", move |conn| {
            redis::cmd("GET").arg(&key).query(conn)
        })
        .await
    }

    /// Store `value`; with `expires_in` the key gets a TTL (whole seconds, minimum one).
    #[instrument(skip(self, value), err)]
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        expires_in: Option<Duration>,
    ) -> Result<(), RedisBusError> {
        let key = key.to_string();
        let value = value.to_string();
        with_connection(&self.client, "SET", move |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if let Some(ttl) = expires_in {
                cmd.arg("EX").arg(ttl_seconds(ttl));
            }
            cmd.query::<()>(conn)
        })
        .await
    }

    /// Returns whether the key existed.
    pub async fn del(&self, key: &str) -> Result<bool, RedisBusError> {
        let key = key.to_string();
        let removed: i64 = with_connection(&self.client, "DEL", move |conn| {
            redis::cmd("DEL").arg(&key).query(conn)
        })
        .await?;
        Ok(removed > 0)
    }

    pub async fn ping(&self) -> Result<(), RedisBusError> {
        let reply: String = with_connection(&self.client, "PING", |conn| {
            redis::cmd("PING").query(conn)
        })
        .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(RedisBusError::Command(format!("unexpected PING reply: {reply}")))
        }
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
