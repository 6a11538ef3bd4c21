use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, aio::ConnectionManager};
use tokio::time::timeout;
use tracing::info;

use crate::{error::StoreError, store::KeyValueStore};

/// Redis-backed [`KeyValueStore`]; every round-trip is bounded by `op_timeout`.
///
/// The [`ConnectionManager`] re-dials after the server drops the connection,
/// so a Redis restart costs failed calls, not a process restart.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;

        let connection = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            op_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        timeout(self.op_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let ttl_seconds = ttl.as_secs().max(1);

        // SET NX EX replies OK when the key was created and nil otherwise.
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg("1")
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds)
                    .query_async(&mut conn),
            )
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.del::<_, ()>(key)).await
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.exists::<_, bool>(key)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.ping::<String>()).await.map(|_| ())
    }
}
