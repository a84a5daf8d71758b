use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common_retry::{retry, RetryError, RetryPolicy};

use crate::{DedupCache, DedupError};

/// Redis-backed dedup cache. A failed command triggers connection
/// recreation before the next retry attempt; recreation is serialized
/// behind the connection mutex so concurrent stages do not race it.
pub struct RedisDedupCache {
    client: redis::Client,
    connection: Mutex<MultiplexedConnection>,
    retry_policy: RetryPolicy,
}

impl RedisDedupCache {
    pub async fn connect(url: &str) -> Result<Self, DedupError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("connected to dedup cache");
        Ok(RedisDedupCache {
            client,
            connection: Mutex::new(connection),
            retry_policy: RetryPolicy::default(),
        })
    }

    async fn run<T: redis::FromRedisValue>(
        &self,
        token: &CancellationToken,
        what: &str,
        cmd: impl Fn() -> redis::Pipeline,
    ) -> Result<T, DedupError> {
        retry(token, &self.retry_policy, what, || async {
            let mut connection = self.connection.lock().await.clone();
            match cmd().query_async(&mut connection).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    self.recreate_connection(&err).await;
                    Err(DedupError::Redis(err))
                }
            }
        })
        .await
        .map_err(|err| match err {
            RetryError::Cancelled => DedupError::Cancelled,
            other => other.into_source().unwrap_or(DedupError::Cancelled),
        })
    }

    async fn recreate_connection(&self, cause: &redis::RedisError) {
        if !cause.is_io_error() && !cause.is_connection_dropped() && !cause.is_connection_refusal() {
            return;
        }
        warn!(error = %cause, "dedup cache connection failed, recreating client");
        match self.client.get_multiplexed_async_connection().await {
            Ok(fresh) => {
                *self.connection.lock().await = fresh;
                info!("dedup cache connection recreated");
            }
            Err(err) => warn!(error = %err, "failed to recreate dedup cache connection"),
        }
    }
}

#[async_trait]
impl DedupCache for RedisDedupCache {
    async fn is_processed(
        &self,
        token: &CancellationToken,
        namespace: &str,
        key: &str,
    ) -> Result<bool, DedupError> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let (seen,): (bool,) = self
            .run(token, "dedup membership check", move || {
                let mut pipe = redis::pipe();
                pipe.sismember(&namespace, &key);
                pipe
            })
            .await?;
        Ok(seen)
    }

    async fn mark_processed(
        &self,
        token: &CancellationToken,
        namespace: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<(), DedupError> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let ttl_secs = ttl.as_secs() as i64;
        let _: () = self
            .run(token, "dedup mark", move || {
                // Add and refresh expiry as one MULTI block so a crash
                // between the two cannot leave an immortal namespace.
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .sadd(&namespace, &key)
                    .ignore()
                    .expire(&namespace, ttl_secs)
                    .ignore();
                pipe
            })
            .await?;
        Ok(())
    }
}
