use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_store::dynamo::DynamoStore;

use topic_generator::config::Config;
use topic_generator::generator::{GeneratorError, HeadlineGenerator};
use topic_generator::llm::OpenAiClassifier;
use topic_generator::source::{ArticleSource, NewsApiSource};

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
    info!("starting sentiflow topic generator");

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    // The whole run races one deadline; blowing it is an operational
    // failure, not a partial success.
    let token = CancellationToken::new();
    {
        let token = token.clone();
        let timeout = config.app_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        });
    }

    let source = NewsApiSource::new(&config);
    let articles = match source.top_headlines().await {
        Ok(articles) => articles,
        Err(err) => {
            error!(error = %err, "failed to fetch top headlines");
            std::process::exit(1);
        }
    };

    let classifier = Arc::new(OpenAiClassifier::new(&config));
    let store = Arc::new(DynamoStore::from_env().await);
    let generator = HeadlineGenerator::new(
        classifier,
        store,
        config.headline_batch_size,
        config.openai_retry_attempts,
    );

    match generator.run(&token, articles).await {
        Ok(report) => {
            info!(
                ingested = report.ingested,
                persisted = report.persisted,
                dropped = report.dropped,
                "topic generation completed"
            );
        }
        Err(err @ GeneratorError::DeadlineExceeded { .. }) => {
            error!(error = %err, "topic generation timed out");
            std::process::exit(1);
        }
        Err(err) => {
            error!(error = %err, "topic generation failed");
            std::process::exit(1);
        }
    }
}
