use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_store::stream::DynamoChangeStream;
use common_store::{HEADLINES_TABLE, RESULTS_TABLE};
use common_types::{Headline, SentimentAnalysisResult};

use streamhandler::config::Config;
use streamhandler::fanout::FanOut;
use streamhandler::relational::{
    connect_pool, ensure_schema, PostgresHeadlineSink, PostgresResultSink,
};
use streamhandler::search::{connect, SearchIndexSink};
use streamhandler::BatchSink;

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
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("starting sentiflow stream handler");

    let config = Config::init_from_env()?;

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

    let aws_config = aws_config::load_from_env().await;
    let dynamodb = aws_sdk_dynamodb::Client::new(&aws_config);
    let streams = aws_sdk_dynamodbstreams::Client::new(&aws_config);

    let pool = connect_pool(&config).await?;
    ensure_schema(&pool).await?;
    let search = connect(&config).map_err(|err| anyhow::anyhow!(err.to_string()))?;

    match config.processing_mode.as_str() {
        "headlines" => {
            info!("processing headline change records");
            let stream =
                DynamoChangeStream::latest(&dynamodb, streams, HEADLINES_TABLE).await?;
            let sinks: Vec<Arc<dyn BatchSink<Headline>>> = vec![
                Arc::new(PostgresHeadlineSink::new(pool)),
                Arc::new(SearchIndexSink::for_headlines(search)),
            ];
            let mut fanout = FanOut::new(
                HEADLINES_TABLE,
                Box::new(stream),
                sinks,
                config.flush_interval(),
                config.poll_idle(),
            );
            fanout.run(&token).await?;
        }
        "sentiment" => {
            info!("processing sentiment change records");
            let stream =
                DynamoChangeStream::latest(&dynamodb, streams, RESULTS_TABLE).await?;
            let sinks: Vec<Arc<dyn BatchSink<SentimentAnalysisResult>>> = vec![
                Arc::new(PostgresResultSink::new(pool)),
                Arc::new(SearchIndexSink::for_results(search)),
            ];
            let mut fanout = FanOut::new(
                RESULTS_TABLE,
                Box::new(stream),
                sinks,
                config.flush_interval(),
                config.poll_idle(),
            );
            fanout.run(&token).await?;
        }
        other => {
            error!(
                mode = other,
                "PROCESSING_MODE must be 'headlines' or 'sentiment'"
            );
            std::process::exit(1);
        }
    }

    info!("stream handler shut down cleanly");
    Ok(())
}
