use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::content::{ContentMetadata, RawContent};

/// Work item flowing through the analysis pipeline. `text` is what the
/// analyzer sees; when summarization ran first, `original_text` keeps what
/// the source produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentAnalysisInput {
    pub content_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub metadata: ContentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub text: String,
    pub was_summarized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
}

impl From<RawContent> for SentimentAnalysisInput {
    fn from(raw: RawContent) -> Self {
        SentimentAnalysisInput {
            content_id: raw.content_id,
            source: raw.source,
            query: raw.query,
            topic: raw.topic,
            metadata: raw.metadata,
            headline_id: raw.headline_id,
            category: None,
            text: raw.text,
            was_summarized: false,
            original_text: None,
        }
    }
}

impl SentimentAnalysisInput {
    /// Rebuilds the input around summarized text, keeping the source text
    /// for later inspection.
    pub fn with_summary(self, summary: String) -> Self {
        SentimentAnalysisInput {
            original_text: Some(self.text),
            text: summary,
            was_summarized: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentAnalysisResult {
    #[serde(flatten)]
    pub input: SentimentAnalysisInput,
    pub sentiment_score: f64,
    pub sentiment_label: SentimentLabel,
    pub confidence: f64,
}

impl SentimentAnalysisResult {
    pub fn content_id(&self) -> &str {
        &self.input.content_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(content_id: &str, text: &str) -> RawContent {
        RawContent {
            content_id: content_id.to_string(),
            source: "reddit".to_string(),
            query: Some("apple iphone".to_string()),
            topic: None,
            headline_id: None,
            text: text.to_string(),
            metadata: ContentMetadata::default(),
        }
    }

    #[test]
    fn conversion_from_raw_keeps_text_and_skips_summary_fields() {
        let input = SentimentAnalysisInput::from(raw("c1", "short text"));
        assert_eq!(input.text, "short text");
        assert!(!input.was_summarized);
        assert!(input.original_text.is_none());
    }

    #[test]
    fn with_summary_preserves_the_original_text() {
        let input = SentimentAnalysisInput::from(raw("c2", "a very long post"));
        let summarized = input.with_summary("shorter".to_string());
        assert!(summarized.was_summarized);
        assert_eq!(summarized.text, "shorter");
        assert_eq!(summarized.original_text.as_deref(), Some("a very long post"));
        assert_ne!(summarized.text, summarized.original_text.clone().unwrap());
    }

    #[test]
    fn result_serializes_flat() {
        let result = SentimentAnalysisResult {
            input: SentimentAnalysisInput::from(raw("c3", "text")),
            sentiment_score: 0.73,
            sentiment_label: SentimentLabel::Positive,
            confidence: 0.9,
        };
        let value = serde_json::to_value(&result).unwrap();
        // Stage payloads are flat objects, not nested envelopes.
        assert_eq!(value["content_id"], "c3");
        assert_eq!(value["sentiment_label"], "positive");
        let back: SentimentAnalysisResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
