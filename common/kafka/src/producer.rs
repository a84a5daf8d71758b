use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common_retry::{ErrorClass, RetryPolicy};

use crate::config::KafkaConfig;
use crate::error::{classify_kafka_error, requires_producer_rebuild, BrokerError};

/// Explicit lifecycle for the transactional producer. `Fatal` is sticky:
/// a producer that hit an unrecoverable state error must be rebuilt, never
/// silently reused.
enum ProducerState {
    Uninit,
    Ready(FutureProducer),
    Fatal,
}

/// Transactional publisher shared by all tasks of one stage. Every
/// `publish` is its own transaction: begin, produce with delivery
/// confirmation, commit. On producer-epoch loss the producer is torn down,
/// rebuilt, and the pending publish retried exactly once.
pub struct TransactionalProducer {
    config: KafkaConfig,
    transactional_id: String,
    timeout: Duration,
    retry_policy: RetryPolicy,
    state: Mutex<ProducerState>,
}

impl TransactionalProducer {
    pub fn new(config: KafkaConfig, stage: &str) -> Self {
        let transactional_id = transactional_id(&config, stage);
        info!(transactional_id, "initializing transactional producer");
        TransactionalProducer {
            timeout: Duration::from_millis(config.kafka_transaction_timeout_ms as u64),
            transactional_id,
            config,
            retry_policy: RetryPolicy::default(),
            state: Mutex::new(ProducerState::Uninit),
        }
    }

    /// Serializes `payload` and publishes it to `topic` inside a
    /// transaction, keyed by `key`. Returns only after the transaction
    /// committed or definitively failed; a cancelled publish aborts its
    /// transaction before returning.
    pub async fn publish<T: Serialize>(
        &self,
        token: &CancellationToken,
        topic: &str,
        key: &str,
        payload: &T,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_string(payload)?;

        let mut state = self.state.lock().await;
        match self.publish_once(&mut state, token, topic, key, &body).await {
            Ok(()) => Ok(()),
            Err(BrokerError::Kafka(err)) if requires_producer_rebuild(&err) => {
                warn!(
                    topic,
                    key,
                    error = %err,
                    "producer hit a fatal state error, rebuilding and retrying once"
                );
                *state = ProducerState::Uninit;
                match self.publish_once(&mut state, token, topic, key, &body).await {
                    Ok(()) => Ok(()),
                    Err(retry_err) => {
                        error!(topic, key, error = %retry_err, "publish failed after producer rebuild");
                        *state = ProducerState::Fatal;
                        Err(BrokerError::ProducerFatal)
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn publish_once(
        &self,
        state: &mut ProducerState,
        token: &CancellationToken,
        topic: &str,
        key: &str,
        body: &str,
    ) -> Result<(), BrokerError> {
        let producer = self.ensure_ready(state)?;

        producer.begin_transaction()?;

        if let Err(err) = self.produce_with_retry(producer, token, topic, key, body).await {
            if let Err(abort_err) = producer.abort_transaction(self.timeout) {
                warn!(topic, key, error = %abort_err, "failed to abort transaction");
            }
            return Err(err);
        }

        producer.commit_transaction(self.timeout)?;
        debug!(topic, key, "published transactionally");
        Ok(())
    }

    /// Produce inside the open transaction, retrying retryable delivery
    /// errors with backoff. Non-retryable errors surface to the caller,
    /// which aborts.
    async fn produce_with_retry(
        &self,
        producer: &FutureProducer,
        token: &CancellationToken,
        topic: &str,
        key: &str,
        body: &str,
    ) -> Result<(), BrokerError> {
        let mut attempt = 0;
        loop {
            let record = FutureRecord::to(topic).key(key).payload(body);
            match producer.send(record, Timeout::Never).await {
                Ok(_) => return Ok(()),
                Err((err, _)) => {
                    let retryable = classify_kafka_error(&err) == ErrorClass::Retryable
                        && !requires_producer_rebuild(&err);
                    attempt += 1;
                    if !retryable || attempt >= self.retry_policy.max_attempts {
                        return Err(err.into());
                    }
                    let backoff = self.retry_policy.backoff(attempt - 1);
                    warn!(
                        topic,
                        key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "produce failed, retrying inside the open transaction"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(BrokerError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn ensure_ready<'a>(
        &self,
        state: &'a mut ProducerState,
    ) -> Result<&'a FutureProducer, BrokerError> {
        if matches!(state, ProducerState::Uninit | ProducerState::Fatal) {
            let producer = self.build_producer()?;
            *state = ProducerState::Ready(producer);
        }
        match state {
            ProducerState::Ready(producer) => Ok(producer),
            _ => unreachable!("producer state was just initialized"),
        }
    }

    fn build_producer(&self) -> Result<FutureProducer, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.kafka_broker)
            .set("transactional.id", &self.transactional_id)
            // Correctness anchors for exactly-once-within-topic, not tuning.
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "1")
            .set(
                "transaction.timeout.ms",
                self.config.kafka_transaction_timeout_ms.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "linger.ms",
                self.config.kafka_producer_linger_ms.to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                self.config.kafka_producer_queue_messages.to_string(),
            )
            .set(
                "compression.codec",
                self.config.kafka_compression_codec.to_owned(),
            );

        if self.config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;
        producer.init_transactions(self.timeout)?;
        info!(
            transactional_id = %self.transactional_id,
            "transactional producer ready"
        );
        Ok(producer)
    }

    /// Flush and drop the underlying producer with a bounded grace period.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let ProducerState::Ready(producer) = &*state {
            if let Err(err) = producer.flush(Duration::from_secs(5)) {
                warn!(error = %err, "not all messages were delivered before shutdown");
            }
        }
        *state = ProducerState::Uninit;
        info!("transactional producer closed");
    }
}

/// Stable per-instance transactional id. Pinned via `KAFKA_PRODUCER_ID`
/// when set, otherwise derived from the stage, process start time, and pid;
/// collisions between live instances must be prevented by deployment.
fn transactional_id(config: &KafkaConfig, stage: &str) -> String {
    if let Some(pinned) = &config.kafka_producer_id {
        return pinned.clone();
    }
    let startup = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{stage}-{startup}-{}-producer", process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;

    fn config_without_pin() -> KafkaConfig {
        let mut cfg = KafkaConfig::init_from_hashmap(&Default::default()).unwrap();
        cfg.kafka_producer_id = None;
        cfg
    }

    #[test]
    fn transactional_id_derives_from_stage_and_pid() {
        let cfg = config_without_pin();
        let id = transactional_id(&cfg, "raw-content");
        assert!(id.starts_with("raw-content-"));
        assert!(id.ends_with(&format!("-{}-producer", process::id())));
    }

    #[test]
    fn pinned_transactional_id_wins() {
        let mut cfg = config_without_pin();
        cfg.kafka_producer_id = Some("pinned-id".to_string());
        assert_eq!(transactional_id(&cfg, "raw-content"), "pinned-id");
    }
}
