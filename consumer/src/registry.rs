use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use tracing::info;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::consumer::PipelineConsumer;

use crate::error::Error;

type StageFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type StageHandler = Box<dyn Fn(CancellationToken, PipelineConsumer) -> StageFuture + Send + Sync>;

/// Process-wide table binding a topic to the stage that consumes it. One
/// process runs one stage, chosen by `KAFKA_CONSUMER_TOPIC`; deployments
/// that want every stage in one binary run several processes instead.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: HashMap<String, StageHandler>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, topic: &str, handler: F)
    where
        F: Fn(CancellationToken, PipelineConsumer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.handlers.insert(
            topic.to_string(),
            Box::new(move |token, consumer| Box::pin(handler(token, consumer))),
        );
    }

    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Resolves the configured topic, subscribes a consumer to it, and
    /// hands control to the stage until shutdown or a fatal broker error.
    pub async fn start(
        &self,
        token: CancellationToken,
        kafka: &KafkaConfig,
        config: &ConsumerConfig,
    ) -> Result<(), Error> {
        let topic = config.kafka_consumer_topic.clone();
        let handler = self
            .handlers
            .get(&topic)
            .ok_or_else(|| Error::UnknownTopic(topic.clone()))?;

        let consumer = PipelineConsumer::for_topic(kafka, config, &topic)?;
        info!(%topic, "starting stage consumer");
        handler(token, consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_topics_are_listed() {
        let mut registry = ConsumerRegistry::new();
        registry.register("raw-content", |_token, _consumer| async { Ok(()) });
        registry.register("sentiment-results", |_token, _consumer| async { Ok(()) });

        let mut topics = registry.topics();
        topics.sort_unstable();
        assert_eq!(topics, vec!["raw-content", "sentiment-results"]);
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected_before_any_broker_work() {
        let registry = ConsumerRegistry::new();
        let kafka = {
            use envconfig::Envconfig;
            common_kafka::config::KafkaConfig::init_from_hashmap(&Default::default()).unwrap()
        };
        let config = common_kafka::config::ConsumerConfig {
            kafka_consumer_group_id: "test-group".to_string(),
            kafka_consumer_topic: "not-registered".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_dead_letter_topic: None,
        };

        let result = registry
            .start(CancellationToken::new(), &kafka, &config)
            .await;
        assert!(matches!(result, Err(Error::UnknownTopic(topic)) if topic == "not-registered"));
    }
}
