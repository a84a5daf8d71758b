//! Object-safe seams over the broker, so pipeline code can be exercised
//! against in-memory fakes instead of a live cluster.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::consumer::{MessageHandle, PipelineConsumer};
use crate::error::BrokerError;
use crate::producer::TransactionalProducer;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        token: &CancellationToken,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl Publisher for TransactionalProducer {
    async fn publish(
        &self,
        token: &CancellationToken,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        TransactionalProducer::publish(self, token, topic, key, payload).await
    }
}

#[async_trait]
pub trait Committer: Send + Sync {
    async fn commit(
        &self,
        token: &CancellationToken,
        handle: &MessageHandle,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl Committer for PipelineConsumer {
    async fn commit(
        &self,
        token: &CancellationToken,
        handle: &MessageHandle,
    ) -> Result<(), BrokerError> {
        PipelineConsumer::commit(self, token, handle).await
    }
}

/// Recording fakes shared by the service test suites.
pub mod mock {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub published: Mutex<Vec<(String, String, serde_json::Value)>>,
        pub fail_next: AtomicU32,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on_topic(&self, topic: &str) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, _, payload)| payload.clone())
                .collect()
        }

        pub fn fail_next_publishes(&self, count: u32) {
            self.fail_next.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            _token: &CancellationToken,
            topic: &str,
            key: &str,
            payload: &serde_json::Value,
        ) -> Result<(), BrokerError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(BrokerError::ProducerFatal);
            }
            self.published.lock().unwrap().push((
                topic.to_string(),
                key.to_string(),
                payload.clone(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingCommitter {
        pub committed: Mutex<Vec<MessageHandle>>,
    }

    impl RecordingCommitter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn committed_offsets(&self) -> Vec<i64> {
            self.committed.lock().unwrap().iter().map(|h| h.offset).collect()
        }
    }

    #[async_trait]
    impl Committer for RecordingCommitter {
        async fn commit(
            &self,
            _token: &CancellationToken,
            handle: &MessageHandle,
        ) -> Result<(), BrokerError> {
            self.committed.lock().unwrap().push(handle.clone());
            Ok(())
        }
    }
}
