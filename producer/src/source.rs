use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common_types::fingerprint::content_id;
use common_types::{ContentMetadata, RawContent};

use crate::config::Config;

pub const SOURCE_NAME: &str = "reddit";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source returned status {0}")]
    Status(u16),
    #[error("fetch cancelled")]
    Cancelled,
}

/// Pluggable content source. Implementations page through everything the
/// source has for one query and return it as `RawContent`.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        token: &CancellationToken,
        communities: &str,
        query: &str,
    ) -> Result<Vec<RawContent>, SourceError>;
}

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Deserialize)]
struct ListingChild {
    data: Post,
}

#[derive(Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    created_utc: f64,
}

pub struct RedditSource {
    http: reqwest::Client,
    base_url: String,
    max_pages: u32,
}

impl RedditSource {
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(config.reddit_user_agent.clone())
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(RedditSource {
            http,
            base_url: config.reddit_base_url.clone(),
            max_pages: config.max_pages_per_query.max(1),
        })
    }

    async fn fetch_page(
        &self,
        communities: &str,
        query: &str,
        after: &str,
    ) -> Result<(Vec<RawContent>, Option<String>), SourceError> {
        let url = format!("{}/r/{}/search.json", self.base_url, communities);
        let mut params = vec![
            ("q", query.to_string()),
            ("restrict_sr", "on".to_string()),
            ("limit", "100".to_string()),
            ("sort", "new".to_string()),
        ];
        if !after.is_empty() {
            params.push(("after", after.to_string()));
        }

        let response = self.http.get(&url).query(&params).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let listing: Listing = response.json().await?;
        let next_after = listing.data.after.filter(|a| !a.is_empty());
        let posts = listing
            .data
            .children
            .into_iter()
            .map(|child| post_to_raw(child.data, query))
            .collect();
        Ok((posts, next_after))
    }
}

#[async_trait]
impl ContentSource for RedditSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn fetch(
        &self,
        token: &CancellationToken,
        communities: &str,
        query: &str,
    ) -> Result<Vec<RawContent>, SourceError> {
        let mut all = Vec::new();
        let mut after = String::new();

        for page in 0..self.max_pages {
            if token.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let (posts, next_after) = self.fetch_with_retries(communities, query, &after).await?;
            debug!(query, page, posts = posts.len(), "fetched source page");
            all.extend(posts);

            match next_after {
                Some(next) => after = next,
                None => break,
            }
        }

        Ok(all)
    }
}

impl RedditSource {
    async fn fetch_with_retries(
        &self,
        communities: &str,
        query: &str,
        after: &str,
    ) -> Result<(Vec<RawContent>, Option<String>), SourceError> {
        let mut last_err = None;
        for attempt in 1..=3 {
            match self.fetch_page(communities, query, after).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    warn!(query, attempt, error = %err, "source fetch failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.expect("loop ran at least once"))
    }
}

fn post_to_raw(post: Post, query: &str) -> RawContent {
    let timestamp = DateTime::<Utc>::from_timestamp(post.created_utc as i64, 0);
    RawContent {
        content_id: content_id(SOURCE_NAME, &post.id, query),
        source: SOURCE_NAME.to_string(),
        query: Some(query.to_string()),
        topic: None,
        headline_id: None,
        text: post.selftext,
        metadata: ContentMetadata {
            timestamp,
            author: post.author,
            subreddit: Some(post.subreddit),
            post_id: Some(post.id),
            url: Some(format!("https://www.reddit.com{}", post.permalink)),
        },
    }
}
