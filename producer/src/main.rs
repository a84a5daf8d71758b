use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_dedup::redis_cache::RedisDedupCache;
use common_kafka::producer::TransactionalProducer;
use common_store::dynamo::DynamoStore;

use producer::config::Config;
use producer::ingest::Ingestor;
use producer::source::RedditSource;

fn setup_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
            EnvFilter::new(level.to_lowercase())
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("starting sentiflow producer");

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                token.cancel();
            }
        });
    }

    let source = match RedditSource::new(&config) {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!(error = %err, "failed to build content source");
            std::process::exit(1);
        }
    };
    let dedup = match RedisDedupCache::connect(&config.dedup_cache_url()).await {
        Ok(dedup) => Arc::new(dedup),
        Err(err) => {
            error!(error = %err, "failed to connect to dedup cache");
            std::process::exit(1);
        }
    };
    let producer = Arc::new(TransactionalProducer::new(
        config.kafka.clone(),
        common_kafka::TOPIC_RAW_CONTENT,
    ));
    let store = Arc::new(DynamoStore::from_env().await);

    let ingestor = Ingestor::new(source, producer.clone(), dedup, store, config.dedup_ttl());
    let report = ingestor.run(&token).await;

    producer.close().await;
    info!(
        published = report.published,
        duplicates = report.skipped_duplicates,
        "producer finished"
    );
}
