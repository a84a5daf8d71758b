use async_trait::async_trait;
use aws_sdk_dynamodbstreams::types::ShardIteratorType;
use aws_sdk_dynamodbstreams::Client as StreamsClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attr::json_from_stream_image;
use crate::{ChangeEvent, ChangeEventType, ChangeStream, StoreError};

/// Change stream over a DynamoDB table, positioned at the newest record on
/// cold start. Each `poll` drains every open shard once; shards run
/// sequentially, which is enough because cross-shard ordering is not a
/// guarantee the fan-out relies on.
pub struct DynamoChangeStream {
    client: StreamsClient,
    stream_arn: String,
    shard_iterators: Vec<String>,
}

impl DynamoChangeStream {
    /// Discovers the table's stream and takes a latest-position iterator
    /// for every shard.
    pub async fn latest(
        dynamodb: &aws_sdk_dynamodb::Client,
        streams: StreamsClient,
        table: &str,
    ) -> Result<Self, StoreError> {
        let description = dynamodb
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        let stream_arn = description
            .table()
            .and_then(|t| t.latest_stream_arn())
            .ok_or_else(|| StoreError::Backend(format!("table {table} has no change stream")))?
            .to_string();

        let mut stream = DynamoChangeStream {
            client: streams,
            stream_arn,
            shard_iterators: Vec::new(),
        };
        stream.refresh_shards().await?;
        info!(
            table,
            shards = stream.shard_iterators.len(),
            "change stream positioned at latest"
        );
        Ok(stream)
    }

    async fn refresh_shards(&mut self) -> Result<(), StoreError> {
        let description = self
            .client
            .describe_stream()
            .stream_arn(&self.stream_arn)
            .send()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        let shards = description
            .stream_description()
            .map(|d| d.shards().to_vec())
            .unwrap_or_default();

        self.shard_iterators.clear();
        for shard in shards {
            let Some(shard_id) = shard.shard_id() else {
                continue;
            };
            let iterator = self
                .client
                .get_shard_iterator()
                .stream_arn(&self.stream_arn)
                .shard_id(shard_id)
                .shard_iterator_type(ShardIteratorType::Latest)
                .send()
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            if let Some(iterator) = iterator.shard_iterator() {
                self.shard_iterators.push(iterator.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStream for DynamoChangeStream {
    async fn poll(&mut self, token: &CancellationToken) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut events = Vec::new();
        let mut next_iterators = Vec::with_capacity(self.shard_iterators.len());

        for iterator in self.shard_iterators.drain(..) {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let output = match self
                .client
                .get_records()
                .shard_iterator(&iterator)
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    // An expired iterator only costs us this shard until the
                    // next refresh; keep the others alive.
                    warn!(error = %err, "get_records failed for shard");
                    continue;
                }
            };

            for record in output.records() {
                use aws_sdk_dynamodbstreams::types::OperationType;
                let event_type = match record.event_name() {
                    Some(op) if *op == OperationType::Insert => ChangeEventType::Insert,
                    Some(op) if *op == OperationType::Modify => ChangeEventType::Modify,
                    _ => ChangeEventType::Remove,
                };
                let Some(new_image) = record.dynamodb().and_then(|d| d.new_image()) else {
                    continue;
                };
                events.push(ChangeEvent {
                    event_type,
                    new_image: json_from_stream_image(new_image),
                });
            }

            if let Some(next) = output.next_shard_iterator() {
                next_iterators.push(next.to_string());
            }
        }

        self.shard_iterators = next_iterators;
        if self.shard_iterators.is_empty() {
            // Every shard closed or expired; re-discover from the stream.
            debug!("all shard iterators exhausted, refreshing");
            self.refresh_shards().await?;
        }

        Ok(events)
    }
}
