use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common_batch::BatchBuffer;
use common_dedup::DedupCache;
use common_kafka::consumer::{MessageHandle, PipelineConsumer, RecvError};
use common_kafka::error::BrokerError;
use common_kafka::ports::{Committer, Publisher};
use common_kafka::tracker::MessageTracker;
use common_kafka::{TOPIC_SENTIMENT_REQUEST, TOPIC_SUMMARY_REQUEST};
use common_types::{RawContent, SentimentAnalysisInput};

use crate::error::Error;
use crate::metric_consts::{
    BATCHES_PUBLISHED, DEDUP_SKIPPED, MESSAGES_RECEIVED, OFFSETS_COMMITTED, POISON_MESSAGES,
    PUBLISH_FAILURES,
};
use crate::stages::SHUTDOWN_GRACE;

const STAGE: &str = "raw_content";

/// First pipeline stage: turns raw content into analysis inputs and routes
/// them. Long texts go to `summary-request` one at a time; everything else
/// batches onto `sentiment-request`. An offset is committed only after the
/// publish its message fed has returned success.
pub struct RawContentStage {
    publisher: Arc<dyn Publisher>,
    committer: Arc<dyn Committer>,
    dedup: Arc<dyn DedupCache>,
    dead_letter_topic: Option<String>,
    tracker: MessageTracker,
    buffer: BatchBuffer<SentimentAnalysisInput>,
    batch_size: usize,
    summary_threshold: usize,
    dedup_ttl: Duration,
}

impl RawContentStage {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        committer: Arc<dyn Committer>,
        dedup: Arc<dyn DedupCache>,
        dead_letter_topic: Option<String>,
        batch_size: usize,
        summary_threshold: usize,
        dedup_ttl: Duration,
    ) -> Self {
        RawContentStage {
            publisher,
            committer,
            dedup,
            dead_letter_topic,
            tracker: MessageTracker::new(),
            buffer: BatchBuffer::new(batch_size),
            batch_size,
            summary_threshold,
            dedup_ttl,
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
                received = consumer.json_recv::<RawContent>(token) => match received {
                    Ok((content, handle)) => self.handle_message(token, content, handle).await,
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

    pub async fn handle_message(
        &self,
        token: &CancellationToken,
        content: RawContent,
        handle: MessageHandle,
    ) {
        counter!(MESSAGES_RECEIVED, "stage" => STAGE).increment(1);

        // Empty text is discarded at the earliest stage, pipeline-wide.
        if content.text.trim().is_empty() {
            self.commit(token, &handle).await;
            return;
        }

        let namespace = format!("pipeline:{}", content.source);
        match self
            .dedup
            .is_processed(token, &namespace, &content.content_id)
            .await
        {
            Ok(true) => {
                counter!(DEDUP_SKIPPED, "stage" => STAGE).increment(1);
                self.commit(token, &handle).await;
                return;
            }
            Ok(false) => {}
            // On cache trouble we prefer a duplicate downstream over a
            // dropped item; the store is idempotent by content id.
            Err(err) => warn!(stage = STAGE, error = %err, "dedup check failed, continuing"),
        }

        // Mark precedes the first downstream publish of this content id.
        if let Err(err) = self
            .dedup
            .mark_processed(token, &namespace, &content.content_id, self.dedup_ttl)
            .await
        {
            warn!(
                stage = STAGE,
                content_id = %content.content_id,
                error = %err,
                "failed to mark content processed, leaving for redelivery"
            );
            return;
        }

        let input = SentimentAnalysisInput::from(content);
        self.tracker.track(&input.content_id, handle);

        if input.text.chars().count() > self.summary_threshold {
            self.send_for_summary(token, input).await;
            return;
        }

        self.buffer.add(input);
        if self.buffer.size() >= self.batch_size {
            self.flush(token).await;
        }
    }

    /// Publish one over-length item to the summary topic, committing its
    /// offset only once the publish succeeded.
    async fn send_for_summary(&self, token: &CancellationToken, input: SentimentAnalysisInput) {
        let payload = match serde_json::to_value(&input) {
            Ok(payload) => payload,
            Err(err) => {
                error!(stage = STAGE, error = %err, "failed to serialize summary request");
                self.tracker.claim(&input.content_id);
                return;
            }
        };

        match self
            .publisher
            .publish(token, TOPIC_SUMMARY_REQUEST, &input.content_id, &payload)
            .await
        {
            Ok(()) => {
                if let Some(handle) = self.tracker.claim(&input.content_id) {
                    self.commit(token, &handle).await;
                }
            }
            Err(err) => {
                counter!(PUBLISH_FAILURES, "stage" => STAGE).increment(1);
                warn!(
                    stage = STAGE,
                    content_id = %input.content_id,
                    error = %err,
                    "summary request publish failed, offset left uncommitted"
                );
                self.tracker.claim(&input.content_id);
            }
        }
    }

    /// Drain the buffer and publish it as one batch message. Tracked
    /// offsets commit only for a successful publish; on failure they are
    /// dropped uncommitted so the broker redelivers.
    pub async fn flush(&self, token: &CancellationToken) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let key = batch[0].content_id.clone();
        let payload = match serde_json::to_value(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                error!(stage = STAGE, error = %err, "failed to serialize batch");
                for input in &batch {
                    self.tracker.claim(&input.content_id);
                }
                return;
            }
        };

        match self
            .publisher
            .publish(token, TOPIC_SENTIMENT_REQUEST, &key, &payload)
            .await
        {
            Ok(()) => {
                counter!(BATCHES_PUBLISHED, "stage" => STAGE).increment(1);
                for input in &batch {
                    if let Some(handle) = self.tracker.claim(&input.content_id) {
                        self.commit(token, &handle).await;
                    }
                }
            }
            Err(err) => {
                counter!(PUBLISH_FAILURES, "stage" => STAGE).increment(1);
                warn!(
                    stage = STAGE,
                    batch_size = batch.len(),
                    error = %err,
                    "batch publish failed, offsets left uncommitted"
                );
                for input in &batch {
                    self.tracker.claim(&input.content_id);
                }
            }
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
    use common_dedup::memory::MemoryDedupCache;
    use common_kafka::TOPIC_SENTIMENT_REQUEST;
    use common_types::ContentMetadata;

    use common_kafka::ports::mock::{RecordingCommitter, RecordingPublisher};

    fn content(id: &str, text: &str) -> RawContent {
        RawContent {
            content_id: id.to_string(),
            source: "reddit".to_string(),
            query: Some("apple iphone".to_string()),
            topic: None,
            headline_id: None,
            text: text.to_string(),
            metadata: ContentMetadata::default(),
        }
    }

    fn handle(offset: i64) -> MessageHandle {
        MessageHandle {
            topic: "raw-content".to_string(),
            partition: 0,
            offset,
        }
    }

    struct Fixture {
        stage: RawContentStage,
        publisher: Arc<RecordingPublisher>,
        committer: Arc<RecordingCommitter>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let publisher = Arc::new(RecordingPublisher::new());
        let committer = Arc::new(RecordingCommitter::new());
        let stage = RawContentStage::new(
            publisher.clone(),
            committer.clone(),
            Arc::new(MemoryDedupCache::new()),
            None,
            batch_size,
            1024,
            Duration::from_secs(60),
        );
        Fixture {
            stage,
            publisher,
            committer,
        }
    }

    #[tokio::test]
    async fn short_text_batches_and_commits_after_publish() {
        let f = fixture(10);
        let token = CancellationToken::new();

        f.stage
            .handle_message(&token, content("c1", "Apple launches new iPhone."), handle(3))
            .await;
        // Buffered, nothing published, nothing committed yet.
        assert!(f.publisher.published.lock().unwrap().is_empty());
        assert!(f.committer.committed_offsets().is_empty());

        f.stage.flush(&token).await;

        let batches = f.publisher.on_topic(TOPIC_SENTIMENT_REQUEST);
        assert_eq!(batches.len(), 1);
        let batch = batches[0].as_array().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["content_id"], "c1");
        assert_eq!(batch[0]["was_summarized"], false);
        assert_eq!(f.committer.committed_offsets(), vec![3]);
    }

    #[tokio::test]
    async fn long_text_goes_to_summary_and_commits_immediately() {
        let f = fixture(10);
        let token = CancellationToken::new();
        let long_text = "x".repeat(2048);

        f.stage
            .handle_message(&token, content("c2", &long_text), handle(7))
            .await;

        let requests = f.publisher.on_topic(TOPIC_SUMMARY_REQUEST);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["content_id"], "c2");
        assert_eq!(requests[0]["text"].as_str().unwrap().len(), 2048);
        assert_eq!(f.committer.committed_offsets(), vec![7]);
        // Nothing left behind in the batch path.
        assert!(f.publisher.on_topic(TOPIC_SENTIMENT_REQUEST).is_empty());
    }

    #[tokio::test]
    async fn threshold_counts_code_points_not_bytes() {
        let f = fixture(10);
        let token = CancellationToken::new();
        // 1000 three-byte characters: over the byte count, under the
        // code-point threshold, so no summarization.
        let text = "€".repeat(1000);

        f.stage
            .handle_message(&token, content("c3", &text), handle(1))
            .await;

        assert!(f.publisher.on_topic(TOPIC_SUMMARY_REQUEST).is_empty());
        assert_eq!(f.stage.buffer.size(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_discarded_and_committed() {
        let f = fixture(10);
        let token = CancellationToken::new();

        f.stage
            .handle_message(&token, content("c4", "   "), handle(9))
            .await;

        assert!(f.publisher.published.lock().unwrap().is_empty());
        assert_eq!(f.committer.committed_offsets(), vec![9]);
    }

    #[tokio::test]
    async fn duplicate_content_id_is_skipped_at_the_dedup_gate() {
        let f = fixture(1);
        let token = CancellationToken::new();

        f.stage
            .handle_message(&token, content("c4", "first delivery"), handle(1))
            .await;
        f.stage
            .handle_message(&token, content("c4", "second delivery"), handle(2))
            .await;

        // Exactly one downstream publish; the duplicate only commits.
        assert_eq!(f.publisher.on_topic(TOPIC_SENTIMENT_REQUEST).len(), 1);
        assert_eq!(f.committer.committed_offsets(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_publish_leaves_offsets_uncommitted() {
        let f = fixture(10);
        let token = CancellationToken::new();
        f.publisher.fail_next_publishes(1);

        f.stage
            .handle_message(&token, content("c5", "some text"), handle(11))
            .await;
        f.stage.flush(&token).await;

        assert!(f.committer.committed_offsets().is_empty());
        assert!(f.stage.tracker.is_empty());
    }

    #[tokio::test]
    async fn reaching_batch_size_flushes_without_waiting_for_the_timer() {
        let f = fixture(2);
        let token = CancellationToken::new();

        f.stage
            .handle_message(&token, content("c6", "one"), handle(1))
            .await;
        assert!(f.publisher.on_topic(TOPIC_SENTIMENT_REQUEST).is_empty());

        f.stage
            .handle_message(&token, content("c7", "two"), handle(2))
            .await;

        let batches = f.publisher.on_topic(TOPIC_SENTIMENT_REQUEST);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_array().unwrap().len(), 2);
        assert_eq!(f.committer.committed_offsets(), vec![1, 2]);
    }
}
