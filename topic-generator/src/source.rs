use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::Config;

/// A raw article as the news source hands it over, before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewsArticle {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "publishedAt")]
    pub published_at: String,
    #[serde(default, rename = "urlToImage")]
    pub url_to_image: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("news source returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn top_headlines(&self) -> Result<Vec<NewsArticle>, SourceError>;
}

#[derive(Deserialize)]
struct TopHeadlinesResponse {
    #[serde(default)]
    articles: Vec<NewsArticle>,
}

pub struct NewsApiSource {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl NewsApiSource {
    pub fn new(config: &Config) -> Self {
        NewsApiSource {
            http: reqwest::Client::new(),
            endpoint: config.news_api_endpoint.clone(),
            api_key: config.news_api_key.clone(),
        }
    }
}

#[async_trait]
impl ArticleSource for NewsApiSource {
    async fn top_headlines(&self) -> Result<Vec<NewsArticle>, SourceError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("country", "us"), ("pageSize", "100")])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let body: TopHeadlinesResponse = response.json().await?;
        info!(articles = body.articles.len(), "fetched top headlines");
        Ok(body.articles)
    }
}
