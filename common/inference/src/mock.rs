use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    AnalysisBatchRequest, AnalysisResponse, InferenceClient, InferenceError, SummaryBatchRequest,
    SummaryBatchResponse, SummaryResponse,
};

/// Scriptable inference backend for stage tests. Summaries and analyses
/// are looked up by content id; unknown ids are simply omitted from the
/// response, which is exactly what a real backend may do.
#[derive(Default)]
pub struct MockInferenceClient {
    pub summaries: Mutex<HashMap<String, String>>,
    pub analyses: Mutex<HashMap<String, AnalysisResponse>>,
    summarizer_healthy: AtomicBool,
    analyzer_healthy: AtomicBool,
    pub summarize_calls: AtomicU32,
    pub analyze_calls: AtomicU32,
    /// When true, reverse response order to prove callers join by key.
    pub reverse_responses: AtomicBool,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        let mock = MockInferenceClient::default();
        mock.summarizer_healthy.store(true, Ordering::SeqCst);
        mock.analyzer_healthy.store(true, Ordering::SeqCst);
        mock
    }

    pub fn set_summary(&self, content_id: &str, summary: &str) {
        self.summaries
            .lock()
            .unwrap()
            .insert(content_id.to_string(), summary.to_string());
    }

    pub fn set_analysis(&self, content_id: &str, score: f64, label: &str, confidence: f64) {
        self.analyses.lock().unwrap().insert(
            content_id.to_string(),
            AnalysisResponse {
                content_id: content_id.to_string(),
                sentiment_score: score,
                sentiment_label: label.to_string(),
                confidence,
            },
        );
    }

    pub fn set_summarizer_healthy(&self, healthy: bool) {
        self.summarizer_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_analyzer_healthy(&self, healthy: bool) {
        self.analyzer_healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn summarize_batch(
        &self,
        request: &SummaryBatchRequest,
    ) -> Result<SummaryBatchResponse, InferenceError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        let summaries = self.summaries.lock().unwrap();
        let mut entries: Vec<SummaryResponse> = request
            .inputs
            .iter()
            .filter_map(|input| {
                summaries.get(&input.content_id).map(|summary| SummaryResponse {
                    content_id: input.content_id.clone(),
                    summary: summary.clone(),
                })
            })
            .collect();
        if self.reverse_responses.load(Ordering::SeqCst) {
            entries.reverse();
        }
        Ok(SummaryBatchResponse { summaries: entries })
    }

    async fn analyze_batch(
        &self,
        request: &AnalysisBatchRequest,
    ) -> Result<Vec<AnalysisResponse>, InferenceError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let analyses = self.analyses.lock().unwrap();
        let mut entries: Vec<AnalysisResponse> = request
            .posts
            .iter()
            .filter_map(|post| analyses.get(&post.content_id).cloned())
            .collect();
        if self.reverse_responses.load(Ordering::SeqCst) {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn summarizer_healthy(&self) -> bool {
        self.summarizer_healthy.load(Ordering::SeqCst)
    }

    async fn analyzer_healthy(&self) -> bool {
        self.analyzer_healthy.load(Ordering::SeqCst)
    }
}
