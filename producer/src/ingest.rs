use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common_dedup::DedupCache;
use common_kafka::ports::Publisher;
use common_kafka::TOPIC_RAW_CONTENT;
use common_store::PrimaryStore;
use common_types::{Category, Headline, RawContent};

use crate::categories::communities_for;
use crate::source::ContentSource;

const CONTENT_PUBLISHED: &str = "sentiflow_content_published";
const CONTENT_SKIPPED: &str = "sentiflow_content_skipped";

#[derive(Debug, Default)]
pub struct IngestReport {
    pub queries: usize,
    pub published: usize,
    pub skipped_duplicates: usize,
    pub skipped_empty: usize,
}

/// Drives one ingestion run: for every stored headline, search its
/// category's communities and publish what comes back onto `raw-content`.
///
/// The dedup gate sits in front of the broker: a post already marked in
/// the source namespace is skipped, and a post is marked *before* its
/// first publish so a crash cannot publish the same id twice.
pub struct Ingestor {
    source: Arc<dyn ContentSource>,
    publisher: Arc<dyn Publisher>,
    dedup: Arc<dyn DedupCache>,
    store: Arc<dyn PrimaryStore>,
    dedup_ttl: Duration,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn ContentSource>,
        publisher: Arc<dyn Publisher>,
        dedup: Arc<dyn DedupCache>,
        store: Arc<dyn PrimaryStore>,
        dedup_ttl: Duration,
    ) -> Self {
        Ingestor {
            source,
            publisher,
            dedup,
            store,
            dedup_ttl,
        }
    }

    pub async fn run(&self, token: &CancellationToken) -> IngestReport {
        let mut report = IngestReport::default();

        let headlines = match self.store.list_headlines(token).await {
            Ok(headlines) => headlines,
            Err(err) => {
                warn!(error = %err, "failed to load stored headlines");
                return report;
            }
        };
        if headlines.is_empty() {
            warn!("no stored headlines, skipping ingestion run");
            return report;
        }

        let by_category = group_by_category(headlines);
        info!(
            categories = by_category.len(),
            "fetching content for stored headlines"
        );

        for category in Category::ALL {
            let Some(group) = by_category.get(&category) else {
                continue;
            };
            let communities = communities_for(category);

            for headline in group {
                if token.is_cancelled() {
                    info!("ingestion cancelled");
                    return report;
                }
                report.queries += 1;

                let posts = match self.source.fetch(token, communities, &headline.query).await {
                    Ok(posts) => posts,
                    Err(err) => {
                        warn!(query = %headline.query, error = %err, "fetch failed for query");
                        continue;
                    }
                };

                for post in posts {
                    self.process_post(token, post, headline, &mut report).await;
                }
            }
        }

        info!(
            queries = report.queries,
            published = report.published,
            duplicates = report.skipped_duplicates,
            empty = report.skipped_empty,
            "ingestion run complete"
        );
        report
    }

    async fn process_post(
        &self,
        token: &CancellationToken,
        mut post: RawContent,
        headline: &Headline,
        report: &mut IngestReport,
    ) {
        // Discard empty text at the earliest stage.
        if post.text.trim().is_empty() {
            report.skipped_empty += 1;
            counter!(CONTENT_SKIPPED, "cause" => "empty").increment(1);
            return;
        }

        let namespace = format!("{}:processed_posts", self.source.name());
        let key = dedup_key(&post);

        match self.dedup.is_processed(token, &namespace, &key).await {
            Ok(true) => {
                report.skipped_duplicates += 1;
                counter!(CONTENT_SKIPPED, "cause" => "duplicate").increment(1);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(%key, error = %err, "dedup check failed, skipping post");
                return;
            }
        }

        // Mark first, publish second: a marked-but-unpublished post is
        // recoverable on the next fetch cycle once the mark expires, while
        // the reverse order could publish one id twice.
        if let Err(err) = self
            .dedup
            .mark_processed(token, &namespace, &key, self.dedup_ttl)
            .await
        {
            warn!(%key, error = %err, "failed to mark post processed, skipping");
            return;
        }

        post.headline_id = Some(headline.id.clone());
        let payload = match serde_json::to_value(&post) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(content_id = %post.content_id, error = %err, "failed to serialize post");
                return;
            }
        };

        match self
            .publisher
            .publish(token, TOPIC_RAW_CONTENT, &post.content_id, &payload)
            .await
        {
            Ok(()) => {
                report.published += 1;
                counter!(CONTENT_PUBLISHED).increment(1);
            }
            Err(err) => {
                warn!(content_id = %post.content_id, error = %err, "failed to publish post");
            }
        }
    }
}

fn dedup_key(post: &RawContent) -> String {
    format!(
        "{}:{}",
        post.query_or_topic(),
        post.metadata.post_id.as_deref().unwrap_or_default()
    )
}

fn group_by_category(headlines: Vec<Headline>) -> HashMap<Category, Vec<Headline>> {
    let mut by_category: HashMap<Category, Vec<Headline>> = HashMap::new();
    for headline in headlines {
        let Some(category) = headline.category else {
            // Unclassified headlines should never have been persisted.
            warn!(id = %headline.id, "skipping stored headline without a category");
            continue;
        };
        by_category.entry(category).or_default().push(headline);
    }
    by_category
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_dedup::memory::MemoryDedupCache;
    use common_kafka::ports::mock::RecordingPublisher;
    use common_store::memory::MemoryStore;
    use common_types::fingerprint::content_id;
    use common_types::{ContentMetadata, HeadlineMeta};
    use std::sync::Mutex;

    use crate::source::{SourceError, SOURCE_NAME};

    struct ScriptedSource {
        posts: Mutex<Vec<RawContent>>,
    }

    impl ScriptedSource {
        fn new(posts: Vec<RawContent>) -> Self {
            ScriptedSource {
                posts: Mutex::new(posts),
            }
        }
    }

    #[async_trait]
    impl ContentSource for ScriptedSource {
        fn name(&self) -> &'static str {
            SOURCE_NAME
        }

        async fn fetch(
            &self,
            _token: &CancellationToken,
            _communities: &str,
            _query: &str,
        ) -> Result<Vec<RawContent>, SourceError> {
            Ok(self.posts.lock().unwrap().clone())
        }
    }

    fn post(post_id: &str, query: &str, text: &str) -> RawContent {
        RawContent {
            content_id: content_id(SOURCE_NAME, post_id, query),
            source: SOURCE_NAME.to_string(),
            query: Some(query.to_string()),
            topic: None,
            headline_id: None,
            text: text.to_string(),
            metadata: ContentMetadata {
                post_id: Some(post_id.to_string()),
                ..Default::default()
            },
        }
    }

    async fn seeded_store(query: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        store
            .batch_write_headlines(
                &token,
                &[Headline {
                    id: "h1".to_string(),
                    query: query.to_string(),
                    category: Some(Category::Technology),
                    sentiment_score: None,
                    headline_meta: HeadlineMeta::default(),
                }],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn posts_are_published_once_and_deduped_across_runs() {
        let query = "apple iphone";
        let source = Arc::new(ScriptedSource::new(vec![
            post("t3_a", query, "first post"),
            post("t3_b", query, "second post"),
        ]));
        let publisher = Arc::new(RecordingPublisher::new());
        let dedup = Arc::new(MemoryDedupCache::new());
        let store = seeded_store(query).await;
        let ingestor = Ingestor::new(
            source,
            publisher.clone(),
            dedup,
            store,
            Duration::from_secs(3600),
        );
        let token = CancellationToken::new();

        let first = ingestor.run(&token).await;
        assert_eq!(first.published, 2);
        assert_eq!(publisher.on_topic(TOPIC_RAW_CONTENT).len(), 2);

        // The same fetch again: everything hits the dedup gate.
        let second = ingestor.run(&token).await;
        assert_eq!(second.published, 0);
        assert_eq!(second.skipped_duplicates, 2);
        assert_eq!(publisher.on_topic(TOPIC_RAW_CONTENT).len(), 2);
    }

    #[tokio::test]
    async fn empty_posts_never_reach_the_broker() {
        let query = "apple iphone";
        let source = Arc::new(ScriptedSource::new(vec![
            post("t3_a", query, "   "),
            post("t3_b", query, "real content"),
        ]));
        let publisher = Arc::new(RecordingPublisher::new());
        let ingestor = Ingestor::new(
            source,
            publisher.clone(),
            Arc::new(MemoryDedupCache::new()),
            seeded_store(query).await,
            Duration::from_secs(3600),
        );

        let report = ingestor.run(&CancellationToken::new()).await;
        assert_eq!(report.published, 1);
        assert_eq!(report.skipped_empty, 1);
        let published = publisher.on_topic(TOPIC_RAW_CONTENT);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["text"], "real content");
        // Published posts carry the headline that drove the query.
        assert_eq!(published[0]["headline_id"], "h1");
    }

    /// Dedup cache and publisher writing to one shared event log, to pin
    /// down the relative order of marks and publishes.
    struct SequencedDedup {
        inner: MemoryDedupCache,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl common_dedup::DedupCache for SequencedDedup {
        async fn is_processed(
            &self,
            token: &CancellationToken,
            namespace: &str,
            key: &str,
        ) -> Result<bool, common_dedup::DedupError> {
            self.inner.is_processed(token, namespace, key).await
        }

        async fn mark_processed(
            &self,
            token: &CancellationToken,
            namespace: &str,
            key: &str,
            ttl: Duration,
        ) -> Result<(), common_dedup::DedupError> {
            self.log.lock().unwrap().push(format!("mark:{key}"));
            self.inner.mark_processed(token, namespace, key, ttl).await
        }
    }

    struct SequencedPublisher {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Publisher for SequencedPublisher {
        async fn publish(
            &self,
            _token: &CancellationToken,
            _topic: &str,
            key: &str,
            _payload: &serde_json::Value,
        ) -> Result<(), common_kafka::error::BrokerError> {
            self.log.lock().unwrap().push(format!("publish:{key}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn mark_strictly_precedes_the_first_publish() {
        let query = "apple iphone";
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(vec![post("t3_a", query, "content")]));
        let dedup = Arc::new(SequencedDedup {
            inner: MemoryDedupCache::new(),
            log: log.clone(),
        });
        let publisher = Arc::new(SequencedPublisher { log: log.clone() });
        let ingestor = Ingestor::new(
            source,
            publisher,
            dedup,
            seeded_store(query).await,
            Duration::from_secs(3600),
        );

        ingestor.run(&CancellationToken::new()).await;

        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("mark:"));
        assert!(events[1].starts_with("publish:"));
    }

    #[tokio::test]
    async fn failed_publish_does_not_block_later_posts() {
        let query = "apple iphone";
        let source = Arc::new(ScriptedSource::new(vec![
            post("t3_a", query, "one"),
            post("t3_b", query, "two"),
        ]));
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.fail_next_publishes(1);
        let ingestor = Ingestor::new(
            source,
            publisher.clone(),
            Arc::new(MemoryDedupCache::new()),
            seeded_store(query).await,
            Duration::from_secs(3600),
        );

        let report = ingestor.run(&CancellationToken::new()).await;
        assert_eq!(report.published, 1);
        assert_eq!(publisher.on_topic(TOPIC_RAW_CONTENT).len(), 1);
    }
}
