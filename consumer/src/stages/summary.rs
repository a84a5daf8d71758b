use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common_batch::BatchBuffer;
use common_inference::{InferenceClient, SummaryBatchRequest, SummaryRequest};
use common_kafka::consumer::{MessageHandle, PipelineConsumer, RecvError};
use common_kafka::error::BrokerError;
use common_kafka::ports::{Committer, Publisher};
use common_kafka::tracker::MessageTracker;
use common_kafka::TOPIC_SENTIMENT_REQUEST;
use common_types::SentimentAnalysisInput;

use crate::error::Error;
use crate::metric_consts::{
    GATE_HELD, ITEMS_SHED, MESSAGES_RECEIVED, OFFSETS_COMMITTED, POISON_MESSAGES,
    PUBLISH_FAILURES, SUMMARIES_REJECTED,
};
use crate::stages::{Gate, SHUTDOWN_GRACE};

const STAGE: &str = "summary";

/// Second stage: summarizes over-length inputs, then feeds them to the
/// analysis topic. Flushing is gated on summarizer health; while the gate
/// is closed the batch is held in memory (bounded, shedding oldest-first)
/// and the consumer keeps polling so the group does not rebalance.
pub struct SummaryStage {
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

impl SummaryStage {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        committer: Arc<dyn Committer>,
        inference: Arc<dyn InferenceClient>,
        gate: Gate,
        dead_letter_topic: Option<String>,
        batch_size: usize,
        held_cap: usize,
    ) -> Self {
        SummaryStage {
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
                received = consumer.json_recv::<SentimentAnalysisInput>(token) => match received {
                    Ok((input, handle)) => {
                        counter!(MESSAGES_RECEIVED, "stage" => STAGE).increment(1);
                        self.enqueue(input, handle);
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

    /// Track and buffer one input. Beyond the held cap (reachable only
    /// while the gate is closed) the oldest item is shed; its offset stays
    /// uncommitted, so redelivery covers it once the backend recovers.
    pub fn enqueue(&self, input: SentimentAnalysisInput, handle: MessageHandle) {
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
        self.tracker.track(&input.content_id, handle);
        self.buffer.add(input);
    }

    pub async fn process_batch(&self, token: &CancellationToken) {
        if !self.gate.is_open() {
            counter!(GATE_HELD, "stage" => STAGE).increment(1);
            warn!(
                stage = STAGE,
                held = self.buffer.size(),
                "summarizer unhealthy, holding batch"
            );
            return;
        }

        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let request = SummaryBatchRequest {
            inputs: batch
                .iter()
                .map(|input| SummaryRequest {
                    content_id: input.content_id.clone(),
                    text: input.text.clone(),
                })
                .collect(),
        };

        let response = match self.inference.summarize_batch(&request).await {
            Ok(response) => response,
            Err(err) => {
                error!(stage = STAGE, error = %err, "summarize batch failed, leaving offsets uncommitted");
                for input in &batch {
                    self.tracker.claim(&input.content_id);
                }
                return;
            }
        };

        // Join by content id; the backend owes us no ordering and may
        // answer for a subset.
        let summaries: HashMap<&str, &str> = response
            .summaries
            .iter()
            .map(|s| (s.content_id.as_str(), s.summary.as_str()))
            .collect();

        for input in batch {
            let Some(summary) = summaries.get(input.content_id.as_str()) else {
                warn!(
                    stage = STAGE,
                    content_id = %input.content_id,
                    "no summary returned, leaving for redelivery"
                );
                self.tracker.claim(&input.content_id);
                continue;
            };

            if summary.is_empty() || *summary == input.text {
                counter!(SUMMARIES_REJECTED, "stage" => STAGE).increment(1);
                warn!(
                    stage = STAGE,
                    content_id = %input.content_id,
                    "dropping low-value summary"
                );
                // A deliberate drop is processed work; ack it.
                if let Some(handle) = self.tracker.claim(&input.content_id) {
                    self.commit(token, &handle).await;
                }
                continue;
            }

            let summarized = input.with_summary(summary.to_string());
            self.send_for_analysis(token, summarized).await;
        }
    }

    /// One accepted item, published as a single-element batch so the
    /// analysis stage has exactly one payload shape to decode.
    async fn send_for_analysis(&self, token: &CancellationToken, input: SentimentAnalysisInput) {
        let content_id = input.content_id.clone();
        let payload = match serde_json::to_value(vec![&input]) {
            Ok(payload) => payload,
            Err(err) => {
                error!(stage = STAGE, error = %err, "failed to serialize analysis request");
                self.tracker.claim(&content_id);
                return;
            }
        };

        match self
            .publisher
            .publish(token, TOPIC_SENTIMENT_REQUEST, &content_id, &payload)
            .await
        {
            Ok(()) => {
                if let Some(handle) = self.tracker.claim(&content_id) {
                    self.commit(token, &handle).await;
                }
            }
            Err(err) => {
                counter!(PUBLISH_FAILURES, "stage" => STAGE).increment(1);
                warn!(
                    stage = STAGE,
                    content_id = %content_id,
                    error = %err,
                    "analysis publish failed, offset left uncommitted"
                );
                self.tracker.claim(&content_id);
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
