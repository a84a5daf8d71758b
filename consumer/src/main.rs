use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use consumer::app_context::AppContext;
use consumer::config::Config;

fn setup_tracing() {
    // LOG_LEVEL is the operator knob; RUST_LOG wins when set for targeted
    // debugging.
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

async fn index() -> &'static str {
    "sentiflow consumer"
}

fn start_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let registry = context.health_registry.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(registry.get_status())));
    let router = common_metrics::setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::spawn(async move {
        if let Err(err) = common_metrics::serve(router, &bind).await {
            warn!(error = %err, "liveness server exited");
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("starting sentiflow consumer");

    let config = Config::init_with_defaults()?;
    let context = Arc::new(AppContext::new(config).await?);

    start_liveness_server(&context.config, context.clone());

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

    context.spawn_monitors(&token);

    let registry = context.build_registry();
    let result = registry
        .start(
            token.clone(),
            &context.config.kafka,
            &context.config.consumer,
        )
        .await;

    // Stage returned: flush whatever the producer still holds, then exit
    // with the stage's verdict.
    context.producer.close().await;
    result?;
    info!("consumer shut down cleanly");
    Ok(())
}
