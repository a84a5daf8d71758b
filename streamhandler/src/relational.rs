use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use common_types::{Headline, SentimentAnalysisResult};

use crate::config::Config;
use crate::{BatchSink, SinkError};

pub async fn connect_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres_max_open_conns)
        .min_connections(config.postgres_min_conns)
        .max_lifetime(Duration::from_secs(
            config.postgres_conn_max_lifetime_minutes * 60,
        ))
        .idle_timeout(Duration::from_secs(
            config.postgres_conn_max_idle_time_minutes * 60,
        ))
        .connect(&config.postgres_dsn())
        .await?;
    info!("connected to relational store");
    Ok(pool)
}

/// The relational views are derived data; create them on startup so a
/// fresh database needs no manual setup.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS headlines (
            id TEXT PRIMARY KEY,
            query TEXT NOT NULL,
            category TEXT NOT NULL,
            sentiment_score DOUBLE PRECISION,
            source TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            published_at TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            url_to_image TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sentiment_results (
            content_id TEXT PRIMARY KEY,
            source TEXT NOT NULL DEFAULT '',
            query TEXT,
            topic TEXT,
            text TEXT NOT NULL DEFAULT '',
            was_summarized BOOLEAN NOT NULL DEFAULT FALSE,
            sentiment_score DOUBLE PRECISION NOT NULL,
            sentiment_label TEXT NOT NULL,
            confidence DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub struct PostgresHeadlineSink {
    pool: PgPool,
}

impl PostgresHeadlineSink {
    pub fn new(pool: PgPool) -> Self {
        PostgresHeadlineSink { pool }
    }
}

#[async_trait]
impl BatchSink<Headline> for PostgresHeadlineSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write(&self, items: &[Headline]) -> Result<(), SinkError> {
        let mut ids = Vec::with_capacity(items.len());
        let mut queries = Vec::with_capacity(items.len());
        let mut categories = Vec::with_capacity(items.len());
        let mut scores = Vec::with_capacity(items.len());
        let mut sources = Vec::with_capacity(items.len());
        let mut titles = Vec::with_capacity(items.len());
        let mut authors = Vec::with_capacity(items.len());
        let mut descriptions = Vec::with_capacity(items.len());
        let mut published = Vec::with_capacity(items.len());
        let mut urls = Vec::with_capacity(items.len());
        let mut images = Vec::with_capacity(items.len());

        for item in items {
            ids.push(item.id.clone());
            queries.push(item.query.clone());
            categories.push(
                item.category
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default(),
            );
            scores.push(item.sentiment_score.map(f64::from));
            sources.push(item.headline_meta.source.clone());
            titles.push(item.headline_meta.title.clone());
            authors.push(item.headline_meta.author.clone());
            descriptions.push(item.headline_meta.description.clone());
            published.push(item.headline_meta.published_at.clone());
            urls.push(item.headline_meta.url.clone());
            images.push(item.headline_meta.url_to_image.clone());
        }

        sqlx::query(
            r#"
            INSERT INTO headlines
                (id, query, category, sentiment_score, source, title, author,
                 description, published_at, url, url_to_image)
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::float8[], $5::text[],
                $6::text[], $7::text[], $8::text[], $9::text[], $10::text[],
                $11::text[])
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&queries)
        .bind(&categories)
        .bind(&scores)
        .bind(&sources)
        .bind(&titles)
        .bind(&authors)
        .bind(&descriptions)
        .bind(&published)
        .bind(&urls)
        .bind(&images)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct PostgresResultSink {
    pool: PgPool,
}

impl PostgresResultSink {
    pub fn new(pool: PgPool) -> Self {
        PostgresResultSink { pool }
    }
}

#[async_trait]
impl BatchSink<SentimentAnalysisResult> for PostgresResultSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write(&self, items: &[SentimentAnalysisResult]) -> Result<(), SinkError> {
        let mut content_ids = Vec::with_capacity(items.len());
        let mut sources = Vec::with_capacity(items.len());
        let mut queries = Vec::with_capacity(items.len());
        let mut topics = Vec::with_capacity(items.len());
        let mut texts = Vec::with_capacity(items.len());
        let mut summarized = Vec::with_capacity(items.len());
        let mut scores = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());
        let mut confidences = Vec::with_capacity(items.len());

        for item in items {
            content_ids.push(item.input.content_id.clone());
            sources.push(item.input.source.clone());
            queries.push(item.input.query.clone());
            topics.push(item.input.topic.clone());
            texts.push(item.input.text.clone());
            summarized.push(item.input.was_summarized);
            scores.push(item.sentiment_score);
            labels.push(
                serde_json::to_value(item.sentiment_label)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "neutral".to_string()),
            );
            confidences.push(item.confidence);
        }

        sqlx::query(
            r#"
            INSERT INTO sentiment_results
                (content_id, source, query, topic, text, was_summarized,
                 sentiment_score, sentiment_label, confidence)
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                $6::boolean[], $7::float8[], $8::text[], $9::float8[])
            ON CONFLICT (content_id) DO NOTHING
            "#,
        )
        .bind(&content_ids)
        .bind(&sources)
        .bind(&queries)
        .bind(&topics)
        .bind(&texts)
        .bind(&summarized)
        .bind(&scores)
        .bind(&labels)
        .bind(&confidences)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
