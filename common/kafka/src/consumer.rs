use std::sync::Arc;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common_retry::{retry, RetryError, RetryPolicy};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::BrokerError;

/// Identifies one consumed message for deferred acknowledgement. Stages
/// hold these in their tracker and commit only after the downstream
/// publish the message feeds has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    /// Message could not be decoded; its offset has already been committed
    /// so it will not be redelivered. Carries the raw payload for the
    /// dead-letter path and a bounded preview for the log line.
    #[error("poison message on {topic}: {reason}")]
    Poison {
        topic: String,
        reason: String,
        payload: Vec<u8>,
        handle: MessageHandle,
    },
}

/// Committing consumer bound to a single topic, configured for
/// `read_committed` isolation with all offset management manual.
#[derive(Clone)]
pub struct PipelineConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
    retry_policy: RetryPolicy,
}

impl PipelineConsumer {
    pub fn new(kafka: &KafkaConfig, config: &ConsumerConfig) -> Result<Self, BrokerError> {
        Self::for_topic(kafka, config, &config.kafka_consumer_topic)
    }

    /// Subscribe to a specific topic, ignoring `kafka_consumer_topic`. Used
    /// by the registry, which already resolved the stage.
    pub fn for_topic(
        kafka: &KafkaConfig,
        config: &ConsumerConfig,
        topic: &str,
    ) -> Result<Self, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka.kafka_broker)
            .set("group.id", &config.kafka_consumer_group_id)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            // Offsets are committed one message at a time, after the
            // downstream publish that message fed has succeeded.
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("isolation.level", "read_committed");

        if kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: StreamConsumer = client_config.create().map_err(BrokerError::Kafka)?;
        consumer.subscribe(&[topic]).map_err(BrokerError::Kafka)?;
        info!(
            topic,
            group = %config.kafka_consumer_group_id,
            "consumer subscribed"
        );

        Ok(PipelineConsumer {
            inner: Arc::new(Inner {
                consumer,
                topic: topic.to_string(),
                retry_policy: RetryPolicy::default(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Next message decoded as JSON. Broker errors are classified: retryable
    /// ones are absorbed with backoff, fatal ones terminate the iterator.
    /// Undecodable payloads are committed immediately (they would otherwise
    /// redeliver forever) and surfaced as [`RecvError::Poison`].
    pub async fn json_recv<T>(&self, token: &CancellationToken) -> Result<(T, MessageHandle), RecvError>
    where
        T: DeserializeOwned,
    {
        let inner = &self.inner;
        let message = retry(token, &inner.retry_policy, "consumer recv", || async {
            tokio::select! {
                _ = token.cancelled() => Err(BrokerError::Cancelled),
                received = inner.consumer.recv() => {
                    received.map(|m| m.detach()).map_err(BrokerError::Kafka)
                }
            }
        })
        .await
        .map_err(flatten_retry)?;

        let handle = MessageHandle {
            topic: inner.topic.clone(),
            partition: message.partition(),
            offset: message.offset(),
        };

        let payload = message.payload().unwrap_or_default().to_vec();
        match serde_json::from_slice(&payload) {
            Ok(decoded) => Ok((decoded, handle)),
            Err(err) => {
                // Poison pill: ack it so the partition can make progress.
                if let Err(commit_err) = self.commit(token, &handle).await {
                    warn!(
                        topic = %inner.topic,
                        error = %commit_err,
                        "failed to commit poison message offset"
                    );
                }
                Err(RecvError::Poison {
                    topic: inner.topic.clone(),
                    reason: err.to_string(),
                    payload,
                    handle,
                })
            }
        }
    }

    /// Commits the offset of a single message, retrying transient failures.
    pub async fn commit(
        &self,
        token: &CancellationToken,
        handle: &MessageHandle,
    ) -> Result<(), BrokerError> {
        let inner = &self.inner;
        retry(token, &inner.retry_policy, "offset commit", || async {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&handle.topic, handle.partition, Offset::Offset(handle.offset + 1))
                .map_err(BrokerError::Kafka)?;
            inner
                .consumer
                .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
                .map_err(BrokerError::Kafka)?;
            debug!(
                topic = %handle.topic,
                partition = handle.partition,
                offset = handle.offset,
                "committed offset"
            );
            Ok(())
        })
        .await
        .map_err(flatten_retry)
    }
}

fn flatten_retry(err: RetryError<BrokerError>) -> BrokerError {
    match err {
        RetryError::Cancelled => BrokerError::Cancelled,
        other => other.into_source().unwrap_or(BrokerError::Cancelled),
    }
}
