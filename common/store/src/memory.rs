use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common_types::{Headline, SentimentAnalysisResult};

use crate::{ChangeEvent, ChangeStream, PrimaryStore, StoreError};

/// In-memory primary store keyed the same way the real tables are. Used by
/// tests and for running the pipeline without an AWS account.
#[derive(Default)]
pub struct MemoryStore {
    pub headlines: Mutex<HashMap<String, Headline>>,
    pub results: Mutex<HashMap<String, SentimentAnalysisResult>>,
    write_calls: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headline_count(&self) -> usize {
        self.headlines.lock().unwrap().len()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Number of non-empty write batches accepted, for asserting
    /// idempotency ("second run produces no net writes").
    pub fn write_calls(&self) -> usize {
        *self.write_calls.lock().unwrap()
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn batch_write_headlines(
        &self,
        _token: &CancellationToken,
        headlines: &[Headline],
    ) -> Result<(), StoreError> {
        if headlines.is_empty() {
            return Ok(());
        }
        *self.write_calls.lock().unwrap() += 1;
        let mut stored = self.headlines.lock().unwrap();
        for headline in headlines {
            stored.insert(headline.id.clone(), headline.clone());
        }
        Ok(())
    }

    async fn batch_write_results(
        &self,
        _token: &CancellationToken,
        results: &[SentimentAnalysisResult],
    ) -> Result<(), StoreError> {
        if results.is_empty() {
            return Ok(());
        }
        *self.write_calls.lock().unwrap() += 1;
        let mut stored = self.results.lock().unwrap();
        for result in results {
            stored.insert(result.content_id().to_string(), result.clone());
        }
        Ok(())
    }

    async fn list_headlines(
        &self,
        _token: &CancellationToken,
    ) -> Result<Vec<Headline>, StoreError> {
        Ok(self.headlines.lock().unwrap().values().cloned().collect())
    }
}

/// Scriptable change stream for fan-out tests: events pushed in are
/// handed out one batch per poll.
#[derive(Default, Clone)]
pub struct MemoryChangeStream {
    batches: Arc<Mutex<VecDeque<Vec<ChangeEvent>>>>,
}

impl MemoryChangeStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, events: Vec<ChangeEvent>) {
        self.batches.lock().unwrap().push_back(events);
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn poll(&mut self, token: &CancellationToken) -> Result<Vec<ChangeEvent>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}
