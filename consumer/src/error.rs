use common_dedup::DedupError;
use common_inference::InferenceError;
use common_kafka::error::BrokerError;
use common_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] envconfig::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("no stage registered for topic {0}")]
    UnknownTopic(String),
}
