//! Primary store and change-stream ports.
//!
//! The primary store owns every persisted headline and sentiment result;
//! the relational store and the search index are derived views fed from
//! the change stream. Writes are idempotent by primary key, which is what
//! lets any pipeline stage re-enter from the beginning on redelivery.

pub mod attr;
pub mod dynamo;
pub mod memory;
pub mod stream;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common_types::{Headline, SentimentAnalysisResult};

pub const HEADLINES_TABLE: &str = "Headlines";
pub const RESULTS_TABLE: &str = "SentimentResults";

/// Rows expire a day after being written; the derived views re-materialize
/// from fresh data continuously.
pub const ROW_TTL_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Backend(String),
    #[error("{residual} items remained unwritten after retries")]
    Residual { residual: usize },
    #[error("failed to decode stored item: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Writes the batch, retrying any subset the backend reports as
    /// unwritten. Returns [`StoreError::Residual`] if items remain after
    /// the bounded retries.
    async fn batch_write_headlines(
        &self,
        token: &CancellationToken,
        headlines: &[Headline],
    ) -> Result<(), StoreError>;

    async fn batch_write_results(
        &self,
        token: &CancellationToken,
        results: &[SentimentAnalysisResult],
    ) -> Result<(), StoreError>;

    async fn list_headlines(&self, token: &CancellationToken)
        -> Result<Vec<Headline>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEventType {
    Insert,
    Modify,
    Remove,
}

/// One event off a table's change stream. Only the after-image matters to
/// the fan-out; before-images are not materialized.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub new_image: serde_json::Value,
}

/// Poll-based change stream iterator positioned at the newest record on
/// creation. `poll` returns an empty batch when the stream is idle.
#[async_trait]
pub trait ChangeStream: Send {
    async fn poll(&mut self, token: &CancellationToken) -> Result<Vec<ChangeEvent>, StoreError>;
}
