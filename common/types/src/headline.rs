use serde::{Deserialize, Serialize};

use crate::category::Category;

/// A news headline turned into a queryable record. `query` and `category`
/// are filled in by the classifier; a headline is never persisted while
/// either is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f32>,
    pub headline_meta: HeadlineMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadlineMeta {
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "publishedAt")]
    pub published_at: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "urlToImage")]
    pub url_to_image: String,
}

impl Headline {
    /// True once the classifier has attached both labels. Only classified
    /// headlines may be written to the store.
    pub fn is_classified(&self) -> bool {
        !self.query.is_empty() && self.category.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclassified_headline_is_flagged() {
        let mut headline = Headline {
            id: "h1".to_string(),
            headline_meta: HeadlineMeta {
                source: "NewsAPI".to_string(),
                title: "Apple launches new iPhone".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!headline.is_classified());

        headline.query = "apple iphone launch".to_string();
        assert!(!headline.is_classified());

        headline.category = Some(Category::Technology);
        assert!(headline.is_classified());
    }
}
