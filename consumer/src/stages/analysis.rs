use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common_batch::BatchBuffer;
use common_inference::{AnalysisBatchRequest, AnalysisRequest, InferenceClient};
use common_kafka::consumer::{MessageHandle, PipelineConsumer, RecvError};
use common_kafka::error::BrokerError;
use common_kafka::ports::{Committer, Publisher};
use common_kafka::tracker::MessageTracker;
use common_kafka::TOPIC_SENTIMENT_RESULTS;
use common_types::{SentimentAnalysisInput, SentimentAnalysisResult, SentimentLabel};

use crate::error::Error;
use crate::metric_consts::{
    BATCHES_PUBLISHED, GATE_HELD, ITEMS_SHED, MESSAGES_RECEIVED, OFFSETS_COMMITTED,
    POISON_MESSAGES, PUBLISH_FAILURES,
};
use crate::stages::{Gate, SHUTDOWN_GRACE};

const STAGE: &str = "analysis";

/// Third stage: runs drained batches through the sentiment analyzer and
/// publishes the scored results. The response is joined back to the
/// requests by content id, never by position.
pub struct AnalysisStage {
    publisher: Arc<dyn Publisher>,
    committer: Arc<dyn Committer>,
    inference: Arc<dyn InferenceClient>,
    gate: Gate,
    dead_letter_topic: Option<String>,
    tracker: MessageTracker,
    buffer: BatchBuffer<SentimentAnalysisInput>,
    batch_size: usize,
    held_cap: usize,
}

impl AnalysisStage {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        committer: Arc<dyn Committer>,
        inference: Arc<dyn InferenceClient>,
        gate: Gate,
        dead_letter_topic: Option<String>,
        batch_size: usize,
        held_cap: usize,
    ) -> Self {
        AnalysisStage {
            publisher,
            committer,
            inference,
            gate,
            dead_letter_topic,
            tracker: MessageTracker::new(),
            buffer: BatchBuffer::new(batch_size),
            batch_size,
            held_cap,
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
                _ = ticker.tick() => self.process_batch(token).await,
                received = consumer.json_recv::<Vec<SentimentAnalysisInput>>(token) => match received {
                    Ok((inputs, handle)) => {
                        counter!(MESSAGES_RECEIVED, "stage" => STAGE).increment(1);
                        self.enqueue_message(inputs, handle);
                        if self.buffer.size() >= self.batch_size {
                            self.process_batch(token).await;
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

    /// One broker message carries a batch of inputs; its offset is tracked
    /// under the first item's content id and commits once per message.
    pub fn enqueue_message(&self, inputs: Vec<SentimentAnalysisInput>, handle: MessageHandle) {
        let Some(first) = inputs.first() else {
            return;
        };

        if self.buffer.size() >= self.held_cap {
            let mut held = self.buffer.drain();
            let shed = held.remove(0);
            self.tracker.claim(&shed.content_id);
            counter!(ITEMS_SHED, "stage" => STAGE).increment(1);
            warn!(
                stage = STAGE,
                content_id = %shed.content_id,
                "held batch full, shedding oldest item"
            );
            for item in held {
                self.buffer.add(item);
            }
        }

        self.tracker.track(&first.content_id, handle);
        for input in inputs {
            self.buffer.add(input);
        }
    }

    pub async fn process_batch(&self, token: &CancellationToken) {
        if !self.gate.is_open() {
            counter!(GATE_HELD, "stage" => STAGE).increment(1);
            warn!(
                stage = STAGE,
                held = self.buffer.size(),
                "analyzer unhealthy, holding batch"
            );
            return;
        }

        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let request = AnalysisBatchRequest {
            posts: batch
                .iter()
                .map(|input| AnalysisRequest {
                    content_id: input.content_id.clone(),
                    text: input.text.clone(),
                })
                .collect(),
        };

        let scores = match self.inference.analyze_batch(&request).await {
            Ok(scores) => scores,
            Err(err) => {
                error!(stage = STAGE, error = %err, "analyze batch failed, leaving offsets uncommitted");
                for input in &batch {
                    self.tracker.claim(&input.content_id);
                }
                return;
            }
        };

        // Map lookup, not positional join: |response| <= |request| and
        // order is not part of the backend contract.
        let by_id: HashMap<&str, &common_inference::AnalysisResponse> = scores
            .iter()
            .map(|score| (score.content_id.as_str(), score))
            .collect();

        let mut results = Vec::with_capacity(batch.len());
        let batch_ids: Vec<String> = batch.iter().map(|i| i.content_id.clone()).collect();
        for input in batch {
            let Some(score) = by_id.get(input.content_id.as_str()) else {
                warn!(
                    stage = STAGE,
                    content_id = %input.content_id,
                    "no sentiment score returned for content id"
                );
                continue;
            };
            results.push(SentimentAnalysisResult {
                input,
                sentiment_score: score.sentiment_score,
                sentiment_label: SentimentLabel::from_str_lossy(&score.sentiment_label),
                confidence: score.confidence,
            });
        }

        if results.is_empty() {
            for content_id in &batch_ids {
                self.tracker.claim(content_id);
            }
            return;
        }

        self.publish_results(token, results, &batch_ids).await;
    }

    async fn publish_results(
        &self,
        token: &CancellationToken,
        results: Vec<SentimentAnalysisResult>,
        batch_ids: &[String],
    ) {
        let key = results[0].content_id().to_string();
        let payload = match serde_json::to_value(&results) {
            Ok(payload) => payload,
            Err(err) => {
                error!(stage = STAGE, error = %err, "failed to serialize results batch");
                for content_id in batch_ids {
                    self.tracker.claim(content_id);
                }
                return;
            }
        };

        match self
            .publisher
            .publish(token, TOPIC_SENTIMENT_RESULTS, &key, &payload)
            .await
        {
            Ok(()) => {
                counter!(BATCHES_PUBLISHED, "stage" => STAGE).increment(1);
                for content_id in batch_ids {
                    if let Some(handle) = self.tracker.claim(content_id) {
                        self.commit(token, &handle).await;
                    }
                }
            }
            Err(err) => {
                counter!(PUBLISH_FAILURES, "stage" => STAGE).increment(1);
                warn!(
                    stage = STAGE,
                    batch_size = results.len(),
                    error = %err,
                    "results publish failed, offsets left uncommitted"
                );
                for content_id in batch_ids {
                    self.tracker.claim(content_id);
                }
            }
        }
    }

    async fn shutdown_flush(&self) {
        info!(stage = STAGE, "stopping, flushing in-memory batch");
        let drain_token = CancellationToken::new();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.process_batch(&drain_token))
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

/// Backends label with free-form strings; anything unrecognized maps to
/// neutral rather than poisoning the batch.
trait FromStrLossy {
    fn from_str_lossy(raw: &str) -> SentimentLabel;
}

impl FromStrLossy for SentimentLabel {
    fn from_str_lossy(raw: &str) -> SentimentLabel {
        match raw.to_ascii_lowercase().as_str() {
            "positive" => SentimentLabel::Positive,
            "negative" => SentimentLabel::Negative,
            _ => SentimentLabel::Neutral,
        }
    }
}
