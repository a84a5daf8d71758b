use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single piece of public content as produced by a source, before any
/// processing. `content_id` is the routing key for every downstream stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawContent {
    pub content_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Set when this content was fetched for a stored headline's query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline_id: Option<String>,
    pub text: String,
    pub metadata: ContentMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subreddit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RawContent {
    /// The query or topic this content was fetched for. Sources set one of
    /// the two depending on how the fetch was driven.
    pub fn query_or_topic(&self) -> &str {
        self.query
            .as_deref()
            .or(self.topic.as_deref())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_optional_fields() {
        let content = RawContent {
            content_id: "c1".to_string(),
            source: "reddit".to_string(),
            query: None,
            topic: Some("apple iphone".to_string()),
            headline_id: None,
            text: "some text".to_string(),
            metadata: ContentMetadata {
                post_id: Some("t3_abc".to_string()),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&content).unwrap();
        // Absent options are omitted entirely, matching the wire format the
        // sources produce.
        assert!(!json.contains("\"query\""));
        let back: RawContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
        assert_eq!(back.query_or_topic(), "apple iphone");
    }
}
