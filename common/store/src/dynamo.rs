use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common_types::{Headline, SentimentAnalysisResult};

use crate::attr::{item_from_json, json_from_item};
use crate::{PrimaryStore, StoreError, HEADLINES_TABLE, RESULTS_TABLE, ROW_TTL_HOURS};

// The backend caps BatchWriteItem at 25 items per request.
const WRITE_CHUNK: usize = 25;
const UNPROCESSED_RETRIES: u32 = 3;

pub struct DynamoStore {
    client: Client,
}

impl DynamoStore {
    pub fn new(client: Client) -> Self {
        DynamoStore { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        DynamoStore {
            client: Client::new(&config),
        }
    }

    async fn batch_write<T: Serialize>(
        &self,
        token: &CancellationToken,
        table: &str,
        rows: &[T],
    ) -> Result<(), StoreError> {
        for chunk in rows.chunks(WRITE_CHUNK) {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let requests = chunk
                .iter()
                .map(|row| self.to_write_request(row))
                .collect::<Result<Vec<_>, _>>()?;

            let mut unprocessed = self.write_once(table, requests).await?;

            // The backend may accept part of a batch; the unwritten subset
            // comes back verbatim and is retried with doubling backoff.
            let mut backoff = Duration::from_millis(500);
            let mut attempt = 0;
            while !unprocessed.is_empty() && attempt < UNPROCESSED_RETRIES {
                attempt += 1;
                warn!(
                    table,
                    attempt,
                    remaining = unprocessed.len(),
                    "retrying unprocessed items"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(StoreError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
                unprocessed = self.write_once(table, unprocessed).await?;
            }

            if !unprocessed.is_empty() {
                return Err(StoreError::Residual {
                    residual: unprocessed.len(),
                });
            }
        }

        info!(table, rows = rows.len(), "batch write complete");
        Ok(())
    }

    async fn write_once(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>, StoreError> {
        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        Ok(output
            .unprocessed_items()
            .and_then(|items| items.get(table))
            .cloned()
            .unwrap_or_default())
    }

    fn to_write_request<T: Serialize>(&self, row: &T) -> Result<WriteRequest, StoreError> {
        let mut item = item_from_json(&serde_json::to_value(row)?);
        item.insert(
            "expires_at".to_string(),
            AttributeValue::N(expiry_epoch().to_string()),
        );
        let put = PutRequest::builder()
            .set_item(Some(item))
            .build()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(WriteRequest::builder().put_request(put).build())
    }
}

fn expiry_epoch() -> i64 {
    (Utc::now() + chrono::Duration::hours(ROW_TTL_HOURS)).timestamp()
}

#[async_trait]
impl PrimaryStore for DynamoStore {
    async fn batch_write_headlines(
        &self,
        token: &CancellationToken,
        headlines: &[Headline],
    ) -> Result<(), StoreError> {
        if headlines.is_empty() {
            return Ok(());
        }
        self.batch_write(token, HEADLINES_TABLE, headlines).await
    }

    async fn batch_write_results(
        &self,
        token: &CancellationToken,
        results: &[SentimentAnalysisResult],
    ) -> Result<(), StoreError> {
        if results.is_empty() {
            return Ok(());
        }
        self.batch_write(token, RESULTS_TABLE, results).await
    }

    async fn list_headlines(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<Headline>, StoreError> {
        let mut headlines = Vec::new();
        let mut last_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let output = self
                .client
                .scan()
                .table_name(HEADLINES_TABLE)
                .set_exclusive_start_key(last_key.clone())
                .send()
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;

            for item in output.items() {
                match serde_json::from_value::<Headline>(json_from_item(item)) {
                    Ok(headline) => headlines.push(headline),
                    // One corrupt row must not hide the rest of the table.
                    Err(err) => warn!(error = %err, "skipping undecodable headline row"),
                }
            }

            last_key = output.last_evaluated_key().cloned();
            if last_key.is_none() {
                break;
            }
        }

        Ok(headlines)
    }
}
