use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use common_dedup::redis_cache::RedisDedupCache;
use common_dedup::DedupCache;
use common_health::{monitor, HealthFlag, HealthRegistry};
use common_inference::http::HttpInferenceClient;
use common_inference::InferenceClient;
use common_kafka::producer::TransactionalProducer;
use common_store::dynamo::DynamoStore;
use common_store::PrimaryStore;

use crate::config::Config;
use crate::error::Error;
use crate::registry::ConsumerRegistry;
use crate::stages::analysis::AnalysisStage;
use crate::stages::raw_content::RawContentStage;
use crate::stages::results::ResultsStage;
use crate::stages::summary::SummaryStage;
use crate::stages::Gate;

const LIVENESS_DEADLINE: Duration = Duration::from_secs(60);

/// Everything a stage needs, built once at startup and shared via `Arc`.
/// The producer is the process singleton; stages never build their own.
pub struct AppContext {
    pub config: Config,
    pub producer: Arc<TransactionalProducer>,
    pub dedup: Arc<dyn DedupCache>,
    pub inference: Arc<dyn InferenceClient>,
    pub store: Arc<dyn PrimaryStore>,
    pub health_registry: HealthRegistry,
    pub summarizer_health: HealthFlag,
    pub analyzer_health: HealthFlag,
}

impl AppContext {
    pub async fn new(config: Config) -> Result<Self, Error> {
        let producer = Arc::new(TransactionalProducer::new(
            config.kafka.clone(),
            &config.consumer.kafka_consumer_topic,
        ));
        let dedup: Arc<dyn DedupCache> =
            Arc::new(RedisDedupCache::connect(&config.dedup_cache_url()).await?);
        let inference: Arc<dyn InferenceClient> =
            Arc::new(HttpInferenceClient::new(config.inference.clone())?);
        let store: Arc<dyn PrimaryStore> = Arc::new(DynamoStore::from_env().await);

        let health_registry = HealthRegistry::new();
        info!(
            topic = %config.consumer.kafka_consumer_topic,
            "application context ready"
        );

        Ok(AppContext {
            config,
            producer,
            dedup,
            inference,
            store,
            health_registry,
            summarizer_health: HealthFlag::new(),
            analyzer_health: HealthFlag::new(),
        })
    }

    /// Background probes that keep the backend health flags current, plus
    /// the worker liveness heartbeat for the `/_liveness` endpoint.
    pub fn spawn_monitors(self: &Arc<Self>, token: &CancellationToken) {
        let interval = Duration::from_secs(self.config.healthcheck_interval_seconds);

        let summarizer = {
            let context = self.clone();
            let token = token.clone();
            let flag = self.summarizer_health.clone();
            async move {
                monitor(token, flag, "summarizer", interval, || {
                    let context = context.clone();
                    async move { context.inference.summarizer_healthy().await }
                })
                .await;
            }
        };
        tokio::spawn(summarizer);

        let analyzer = {
            let context = self.clone();
            let token = token.clone();
            let flag = self.analyzer_health.clone();
            async move {
                monitor(token, flag, "analyzer", interval, || {
                    let context = context.clone();
                    async move { context.inference.analyzer_healthy().await }
                })
                .await;
            }
        };
        tokio::spawn(analyzer);

        let liveness = self.health_registry.register("worker", LIVENESS_DEADLINE);
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_DEADLINE / 2);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => liveness.report_healthy(),
                }
            }
        });
    }

    /// Binds every stage to its topic. The summary and analysis stages are
    /// wrapped by health gates on their respective backends.
    pub fn build_registry(self: &Arc<Self>) -> ConsumerRegistry {
        let mut registry = ConsumerRegistry::new();
        let batch_timeout = self.config.batch_timeout();

        {
            let context = self.clone();
            registry.register(common_kafka::TOPIC_RAW_CONTENT, move |token, consumer| {
                let context = context.clone();
                async move {
                    let stage = RawContentStage::new(
                        context.producer.clone(),
                        Arc::new(consumer.clone()),
                        context.dedup.clone(),
                        context.config.consumer.kafka_dead_letter_topic.clone(),
                        context.config.batch_size,
                        context.config.summary_threshold,
                        context.config.dedup_ttl(),
                    );
                    stage.run(&token, consumer, batch_timeout).await
                }
            });
        }

        {
            let context = self.clone();
            registry.register(common_kafka::TOPIC_SUMMARY_REQUEST, move |token, consumer| {
                let context = context.clone();
                async move {
                    let stage = SummaryStage::new(
                        context.producer.clone(),
                        Arc::new(consumer.clone()),
                        context.inference.clone(),
                        Gate::new(context.summarizer_health.clone()),
                        context.config.consumer.kafka_dead_letter_topic.clone(),
                        context.config.batch_size,
                        context.config.held_batch_cap(),
                    );
                    stage.run(&token, consumer, batch_timeout).await
                }
            });
        }

        {
            let context = self.clone();
            registry.register(
                common_kafka::TOPIC_SENTIMENT_REQUEST,
                move |token, consumer| {
                    let context = context.clone();
                    async move {
                        let stage = AnalysisStage::new(
                            context.producer.clone(),
                            Arc::new(consumer.clone()),
                            context.inference.clone(),
                            Gate::new(context.analyzer_health.clone()),
                            context.config.consumer.kafka_dead_letter_topic.clone(),
                            context.config.batch_size,
                            context.config.held_batch_cap(),
                        );
                        stage.run(&token, consumer, batch_timeout).await
                    }
                },
            );
        }

        {
            let context = self.clone();
            registry.register(
                common_kafka::TOPIC_SENTIMENT_RESULTS,
                move |token, consumer| {
                    let context = context.clone();
                    async move {
                        let stage = ResultsStage::new(
                            context.store.clone(),
                            Arc::new(consumer.clone()),
                            context.producer.clone(),
                            context.config.consumer.kafka_dead_letter_topic.clone(),
                            context.config.store_batch_size,
                        );
                        stage.run(&token, consumer, batch_timeout).await
                    }
                },
            );
        }

        registry
    }
}
