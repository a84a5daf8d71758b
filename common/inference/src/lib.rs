//! ML inference port: batched summarization and sentiment analysis over
//! HTTP, plus the health probes the stage gates read.
//!
//! The response contract is keyed, not positional: every response entry
//! carries back the request's `content_id` unchanged, and callers join by
//! that key. A backend returning fewer entries than requested is legal.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub content_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryBatchRequest {
    pub inputs: Vec<SummaryRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub content_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryBatchResponse {
    pub summaries: Vec<SummaryResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub content_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisBatchRequest {
    pub posts: Vec<AnalysisRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub content_id: String,
    pub sentiment_score: f64,
    pub sentiment_label: String,
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {status}: {preview}")]
    Status { status: u16, preview: String },
    #[error("failed to decode response: {reason} (preview: {preview})")]
    Decode { reason: String, preview: String },
    #[error("request failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn summarize_batch(
        &self,
        request: &SummaryBatchRequest,
    ) -> Result<SummaryBatchResponse, InferenceError>;

    async fn analyze_batch(
        &self,
        request: &AnalysisBatchRequest,
    ) -> Result<Vec<AnalysisResponse>, InferenceError>;

    async fn summarizer_healthy(&self) -> bool;

    async fn analyzer_healthy(&self) -> bool;
}
