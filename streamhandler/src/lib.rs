pub mod config;
pub mod fanout;
pub mod relational;
pub mod search;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("relational write failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("search indexing failed: {0}")]
    Search(String),
}

/// One side of the dual write. Sinks are idempotent by primary key, so the
/// flusher may hand them the same batch again after a partial failure.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn write(&self, items: &[T]) -> Result<(), SinkError>;
}
