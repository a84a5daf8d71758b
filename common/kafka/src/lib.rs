pub mod config;
pub mod consumer;
pub mod error;
pub mod ports;
pub mod producer;
pub mod tracker;

/// Topic names are the contract between stages; payload shapes are
/// documented on each stage handler.
pub const TOPIC_RAW_CONTENT: &str = "raw-content";
pub const TOPIC_SUMMARY_REQUEST: &str = "summary-request";
pub const TOPIC_SENTIMENT_REQUEST: &str = "sentiment-request";
pub const TOPIC_SENTIMENT_RESULTS: &str = "sentiment-results";
