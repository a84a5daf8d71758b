use async_trait::async_trait;
use meilisearch_sdk::client::Client;
use serde::Serialize;
use tracing::debug;

use common_types::{Headline, SentimentAnalysisResult};

use crate::config::Config;
use crate::{BatchSink, SinkError};

pub const HEADLINES_INDEX: &str = "headlines";
pub const RESULTS_INDEX: &str = "sentiment_results";

pub fn connect(config: &Config) -> Result<Client, SinkError> {
    Client::new(&config.meilisearch_url, config.meilisearch_api_key.as_deref())
        .map_err(|err| SinkError::Search(err.to_string()))
}

/// Search index sink. Documents are the entity serialized as JSON with the
/// entity's primary key as the document id; indexing is add-or-replace, so
/// replays are harmless.
pub struct SearchIndexSink {
    client: Client,
    index: &'static str,
    primary_key: &'static str,
}

impl SearchIndexSink {
    pub fn for_headlines(client: Client) -> Self {
        SearchIndexSink {
            client,
            index: HEADLINES_INDEX,
            primary_key: "id",
        }
    }

    pub fn for_results(client: Client) -> Self {
        SearchIndexSink {
            client,
            index: RESULTS_INDEX,
            primary_key: "content_id",
        }
    }

    async fn index_batch<T: Serialize + Send + Sync>(
        &self,
        items: &[T],
    ) -> Result<(), SinkError> {
        let task = self
            .client
            .index(self.index)
            .add_or_replace(items, Some(self.primary_key))
            .await
            .map_err(|err| SinkError::Search(err.to_string()))?;
        debug!(index = self.index, task_uid = task.task_uid, "indexing task enqueued");
        Ok(())
    }
}

#[async_trait]
impl BatchSink<Headline> for SearchIndexSink {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn write(&self, items: &[Headline]) -> Result<(), SinkError> {
        self.index_batch(items).await
    }
}

#[async_trait]
impl BatchSink<SentimentAnalysisResult> for SearchIndexSink {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn write(&self, items: &[SentimentAnalysisResult]) -> Result<(), SinkError> {
        self.index_batch(items).await
    }
}
