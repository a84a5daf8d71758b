use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common_batch::BatchBuffer;
use common_kafka::consumer::{MessageHandle, PipelineConsumer, RecvError};
use common_kafka::error::BrokerError;
use common_kafka::ports::{Committer, Publisher};
use common_kafka::tracker::MessageTracker;
use common_store::PrimaryStore;
use common_types::SentimentAnalysisResult;

use crate::error::Error;
use crate::metric_consts::{
    DEAD_LETTERED, MESSAGES_RECEIVED, OFFSETS_COMMITTED, POISON_MESSAGES, RESULTS_STORED,
};
use crate::stages::SHUTDOWN_GRACE;

const STAGE: &str = "results";
const STORE_ATTEMPTS: u32 = 3;

/// Final broker-fed stage: persists scored results into the primary store.
/// Results that cannot be persisted after retries go to the dead-letter
/// topic (when configured) and are never silently committed.
pub struct ResultsStage {
    store: Arc<dyn PrimaryStore>,
    committer: Arc<dyn Committer>,
    publisher: Arc<dyn Publisher>,
    dead_letter_topic: Option<String>,
    tracker: MessageTracker,
    buffer: BatchBuffer<SentimentAnalysisResult>,
    store_batch_size: usize,
}

impl ResultsStage {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        committer: Arc<dyn Committer>,
        publisher: Arc<dyn Publisher>,
        dead_letter_topic: Option<String>,
        store_batch_size: usize,
    ) -> Self {
        ResultsStage {
            store,
            committer,
            publisher,
            dead_letter_topic,
            tracker: MessageTracker::new(),
            buffer: BatchBuffer::new(store_batch_size),
            store_batch_size,
        }
    }

    pub async fn run(
        &self,
        token: &CancellationToken,
        consumer: PipelineConsumer,
        batch_timeout: Duration,
    ) -> Result<(), Error> {
        info!(stage = STAGE, "listening for messages");
        let mut ticker = tokio::time::interval(batch_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.shutdown_flush().await;
                    return Ok(());
                }
                _ = ticker.tick() => self.flush(token).await,
                received = consumer.json_recv::<Vec<SentimentAnalysisResult>>(token) => match received {
                    Ok((results, handle)) => {
                        counter!(MESSAGES_RECEIVED, "stage" => STAGE).increment(1);
                        self.enqueue_message(results, handle);
                        if self.buffer.size() >= self.store_batch_size {
                            self.flush(token).await;
                        }
                    }
                    Err(RecvError::Poison { topic, reason, payload, .. }) => {
                        counter!(POISON_MESSAGES, "stage" => STAGE).increment(1);
                        warn!(stage = STAGE, %topic, %reason, "skipping poison message");
                        crate::stages::dead_letter_poison(
                            &self.publisher,
                            token,
                            self.dead_letter_topic.as_deref(),
                            &topic,
                            &reason,
                            &payload,
                        )
                        .await;
                    }
                    Err(RecvError::Broker(BrokerError::Cancelled)) => continue,
                    Err(RecvError::Broker(err)) => {
                        error!(stage = STAGE, error = %err, "consumer iterator terminated");
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// Every result in a message shares that message's handle; the commit
    /// fires once the batch containing the message's results persisted.
    pub fn enqueue_message(&self, results: Vec<SentimentAnalysisResult>, handle: MessageHandle) {
        for result in results {
            self.tracker.track(result.content_id(), handle.clone());
            self.buffer.add(result);
        }
    }

    /// Write the drained batch with bounded retries. Commits only results
    /// known to be persisted; a batch that never persists is surfaced, not
    /// acknowledged.
    pub async fn flush(&self, token: &CancellationToken) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let mut last_err = None;
        for attempt in 1..=STORE_ATTEMPTS {
            match self.store.batch_write_results(token, &batch).await {
                Ok(()) => {
                    counter!(RESULTS_STORED, "stage" => STAGE).increment(batch.len() as u64);
                    for result in &batch {
                        if let Some(handle) = self.tracker.claim(result.content_id()) {
                            self.commit(token, &handle).await;
                        }
                    }
                    return;
                }
                Err(err) => {
                    error!(stage = STAGE, attempt, error = %err, "failed to write results batch");
                    last_err = Some(err);
                }
            }
        }

        warn!(
            stage = STAGE,
            batch_size = batch.len(),
            error = %last_err.expect("loop ran at least once"),
            "results batch unpersistable, surfacing to dead letter"
        );
        self.dead_letter(token, &batch).await;
        for result in &batch {
            self.tracker.claim(result.content_id());
        }
    }

    async fn dead_letter(&self, token: &CancellationToken, batch: &[SentimentAnalysisResult]) {
        counter!(DEAD_LETTERED, "stage" => STAGE).increment(batch.len() as u64);
        let Some(topic) = &self.dead_letter_topic else {
            return;
        };
        let Ok(payload) = serde_json::to_value(batch) else {
            error!(stage = STAGE, "failed to serialize dead-letter batch");
            return;
        };
        let key = batch[0].content_id().to_string();
        if let Err(err) = self.publisher.publish(token, topic, &key, &payload).await {
            error!(stage = STAGE, error = %err, "failed to publish dead-letter batch");
        }
    }

    async fn shutdown_flush(&self) {
        info!(stage = STAGE, "stopping, flushing in-memory batch");
        let drain_token = CancellationToken::new();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.flush(&drain_token))
            .await
            .is_err()
        {
            warn!(stage = STAGE, "shutdown flush exceeded grace period");
        }
        let leaked = self.tracker.drain();
        if !leaked.is_empty() {
            warn!(
                stage = STAGE,
                unclaimed = leaked.len(),
                "uncommitted messages left for redelivery"
            );
        }
    }

    async fn commit(&self, token: &CancellationToken, handle: &MessageHandle) {
        match self.committer.commit(token, handle).await {
            Ok(()) => {
                counter!(OFFSETS_COMMITTED, "stage" => STAGE).increment(1);
            }
            Err(err) => warn!(stage = STAGE, error = %err, "failed to commit offset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_store::memory::MemoryStore;
    use common_store::StoreError;
    use common_types::{ContentMetadata, RawContent, SentimentAnalysisInput, SentimentLabel};
    use std::sync::atomic::{AtomicU32, Ordering};

    use common_kafka::ports::mock::{RecordingCommitter, RecordingPublisher};

    fn result(id: &str) -> SentimentAnalysisResult {
        SentimentAnalysisResult {
            input: SentimentAnalysisInput::from(RawContent {
                content_id: id.to_string(),
                source: "reddit".to_string(),
                query: Some("apple iphone".to_string()),
                topic: None,
                headline_id: None,
                text: "text".to_string(),
                metadata: ContentMetadata::default(),
            }),
            sentiment_score: 0.5,
            sentiment_label: SentimentLabel::Positive,
            confidence: 0.8,
        }
    }

    fn handle(offset: i64) -> MessageHandle {
        MessageHandle {
            topic: "sentiment-results".to_string(),
            partition: 0,
            offset,
        }
    }

    #[tokio::test]
    async fn persisted_results_commit_their_offsets() {
        let store = Arc::new(MemoryStore::new());
        let committer = Arc::new(RecordingCommitter::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let stage = ResultsStage::new(store.clone(), committer.clone(), publisher, None, 25);
        let token = CancellationToken::new();

        stage.enqueue_message(vec![result("c1"), result("c2")], handle(5));
        stage.flush(&token).await;

        assert_eq!(store.result_count(), 2);
        // Both results shared one message; the handle commits once (the
        // second claim finds the entry already gone).
        assert_eq!(committer.committed_offsets(), vec![5]);
    }

    #[tokio::test]
    async fn store_writes_are_idempotent_by_content_id() {
        let store = Arc::new(MemoryStore::new());
        let committer = Arc::new(RecordingCommitter::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let stage = ResultsStage::new(store.clone(), committer, publisher, None, 25);
        let token = CancellationToken::new();

        stage.enqueue_message(vec![result("c1")], handle(1));
        stage.flush(&token).await;
        // Redelivery of the same content id overwrites, never duplicates.
        stage.enqueue_message(vec![result("c1")], handle(2));
        stage.flush(&token).await;

        assert_eq!(store.result_count(), 1);
    }

    /// Store that always refuses writes, to exercise the dead-letter path.
    #[derive(Default)]
    struct FailingStore {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl PrimaryStore for FailingStore {
        async fn batch_write_headlines(
            &self,
            _token: &CancellationToken,
            _headlines: &[common_types::Headline],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn batch_write_results(
            &self,
            _token: &CancellationToken,
            _results: &[SentimentAnalysisResult],
        ) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Residual { residual: 1 })
        }

        async fn list_headlines(
            &self,
            _token: &CancellationToken,
        ) -> Result<Vec<common_types::Headline>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unpersistable_batch_is_dead_lettered_and_never_committed() {
        let store = Arc::new(FailingStore::default());
        let committer = Arc::new(RecordingCommitter::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let stage = ResultsStage::new(
            store.clone(),
            committer.clone(),
            publisher.clone(),
            Some("sentiment-dead-letter".to_string()),
            25,
        );
        let token = CancellationToken::new();

        stage.enqueue_message(vec![result("c1")], handle(9));
        stage.flush(&token).await;

        assert_eq!(store.attempts.load(Ordering::SeqCst), STORE_ATTEMPTS);
        assert!(committer.committed_offsets().is_empty());
        let dead = publisher.on_topic("sentiment-dead-letter");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].as_array().unwrap()[0]["content_id"], "c1");
    }
}
