//! Deduplication cache port.
//!
//! Sources mark a content id processed *before* its first downstream
//! publish; every stage may ask whether an id was seen. Namespaces keep
//! ingestion domains apart so one source cannot shadow another's keys.

pub mod memory;
pub mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common_retry::{Classify, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("operation cancelled")]
    Cancelled,
}

impl Classify for DedupError {
    fn classify(&self) -> ErrorClass {
        match self {
            DedupError::Redis(err) => {
                if err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            DedupError::Cancelled => ErrorClass::Fatal,
        }
    }
}

#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn is_processed(
        &self,
        token: &CancellationToken,
        namespace: &str,
        key: &str,
    ) -> Result<bool, DedupError>;

    /// Records `key` under `namespace` and refreshes the namespace expiry,
    /// as one atomic write.
    async fn mark_processed(
        &self,
        token: &CancellationToken,
        namespace: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<(), DedupError>;
}
