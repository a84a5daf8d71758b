use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common_batch::BatchBuffer;
use common_store::{PrimaryStore, StoreError};
use common_types::fingerprint::headline_id;
use common_types::{Category, Headline, HeadlineMeta};

use crate::llm::{ClassifiedHeadline, ClassifierError, HeadlineClassifier};
use crate::source::NewsArticle;

pub const SOURCE_NAME: &str = "NewsAPI";

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("deadline exceeded with {pending} headlines unprocessed")]
    DeadlineExceeded { pending: usize },
}

#[derive(Debug, Default)]
pub struct GeneratorReport {
    pub ingested: usize,
    pub persisted: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Batched headline classification with dedupe and re-queue.
///
/// Articles become headline shells with deterministic ids, accumulate into
/// batches, and each batch goes through one classification round:
/// classify, validate (re-queueing malformed entries), dedupe locally,
/// match back to the shells, filter against everything already stored,
/// persist. The run ends when the buffer is empty and the last round
/// re-queued nothing.
pub struct HeadlineGenerator {
    classifier: Arc<dyn HeadlineClassifier>,
    store: Arc<dyn PrimaryStore>,
    batch_size: usize,
    requeue_cap: u32,
}

impl HeadlineGenerator {
    pub fn new(
        classifier: Arc<dyn HeadlineClassifier>,
        store: Arc<dyn PrimaryStore>,
        batch_size: usize,
        requeue_cap: u32,
    ) -> Self {
        HeadlineGenerator {
            classifier,
            store,
            batch_size,
            requeue_cap,
        }
    }

    pub async fn run(
        &self,
        token: &CancellationToken,
        articles: Vec<NewsArticle>,
    ) -> Result<GeneratorReport, GeneratorError> {
        let mut report = GeneratorReport::default();
        let shells = normalize_articles(articles);
        report.ingested = shells.len();
        info!(headlines = shells.len(), "starting headline generation");

        let stored_ids: HashSet<String> = match self.store.list_headlines(token).await {
            Ok(stored) => stored.into_iter().map(|h| h.id).collect(),
            Err(err) => {
                // An unreadable store only weakens dedupe; the run itself
                // can continue and rely on idempotent writes.
                warn!(error = %err, "failed to load stored headlines, continuing without them");
                HashSet::new()
            }
        };

        let buffer = BatchBuffer::new(self.batch_size);
        let mut requeue_counts: HashMap<String, u32> = HashMap::new();

        for shell in shells {
            if token.is_cancelled() {
                return Err(GeneratorError::DeadlineExceeded {
                    pending: buffer.size() + 1,
                });
            }
            buffer.add(shell);
            if buffer.size() >= self.batch_size {
                self.round(token, &buffer, &stored_ids, &mut requeue_counts, &mut report)
                    .await?;
            }
        }

        // Drain whatever the input loop and re-queues left behind.
        while buffer.has_data() {
            if token.is_cancelled() {
                return Err(GeneratorError::DeadlineExceeded {
                    pending: buffer.size(),
                });
            }
            self.round(token, &buffer, &stored_ids, &mut requeue_counts, &mut report)
                .await?;
        }

        info!(
            persisted = report.persisted,
            requeued = report.requeued,
            dropped = report.dropped,
            "headline generation complete"
        );
        Ok(report)
    }

    /// One classification round over the drained buffer.
    async fn round(
        &self,
        token: &CancellationToken,
        buffer: &BatchBuffer<Headline>,
        stored_ids: &HashSet<String>,
        requeue_counts: &mut HashMap<String, u32>,
        report: &mut GeneratorReport,
    ) -> Result<(), GeneratorError> {
        let batch = buffer.drain();
        if batch.is_empty() {
            return Ok(());
        }
        info!(batch_size = batch.len(), "processing headline batch");

        let by_id: HashMap<&str, &Headline> =
            batch.iter().map(|shell| (shell.id.as_str(), shell)).collect();

        let entries = self.classifier.classify(&batch).await?;

        // Validation pass: well-formed entries move on, malformed ones
        // re-queue their originating shell for a later round.
        let mut valid: Vec<ClassifiedHeadline> = Vec::with_capacity(entries.len());
        let mut answered: HashSet<String> = HashSet::with_capacity(entries.len());
        for entry in entries {
            let Some(original) = by_id.get(entry.id.as_str()) else {
                // Hallucinated ids match nothing and are ignored.
                warn!(id = %entry.id, "classifier returned an unknown id");
                continue;
            };
            answered.insert(entry.id.clone());

            let category_ok = Category::from_str(&entry.category).is_ok();
            if entry.query.trim().is_empty() || !category_ok {
                self.requeue(buffer, original, requeue_counts, report);
                continue;
            }
            valid.push(entry);
        }

        // Shells the model never answered for get the same treatment as
        // malformed ones.
        for shell in &batch {
            if !answered.contains(&shell.id) {
                self.requeue(buffer, shell, requeue_counts, report);
            }
        }

        // Local dedupe by id: first valid entry wins.
        let mut seen: HashSet<&str> = HashSet::with_capacity(valid.len());
        let mut classified: Vec<Headline> = Vec::with_capacity(valid.len());
        for entry in &valid {
            if !seen.insert(entry.id.as_str()) {
                continue;
            }
            let Some(original) = by_id.get(entry.id.as_str()) else {
                continue;
            };
            let category = Category::from_str(&entry.category).ok();
            classified.push(Headline {
                id: original.id.clone(),
                query: entry.query.clone(),
                category,
                sentiment_score: None,
                headline_meta: original.headline_meta.clone(),
            });
        }

        // Filter against everything already persisted.
        let fresh: Vec<Headline> = classified
            .into_iter()
            .filter(|headline| !stored_ids.contains(&headline.id))
            .collect();

        debug_assert!(fresh.iter().all(Headline::is_classified));
        if fresh.is_empty() {
            return Ok(());
        }

        self.store.batch_write_headlines(token, &fresh).await?;
        report.persisted += fresh.len();
        Ok(())
    }

    fn requeue(
        &self,
        buffer: &BatchBuffer<Headline>,
        shell: &Headline,
        requeue_counts: &mut HashMap<String, u32>,
        report: &mut GeneratorReport,
    ) {
        let count = requeue_counts.entry(shell.id.clone()).or_insert(0);
        *count += 1;
        if *count > self.requeue_cap {
            report.dropped += 1;
            warn!(
                id = %shell.id,
                attempts = *count,
                "dropping headline after repeated malformed classifications"
            );
            return;
        }
        report.requeued += 1;
        warn!(id = %shell.id, "re-queueing headline for another round");
        buffer.add(shell.clone());
    }
}

/// Turns raw articles into headline shells with deterministic ids.
pub fn normalize_articles(articles: Vec<NewsArticle>) -> Vec<Headline> {
    articles
        .into_iter()
        .filter(|article| !article.title.trim().is_empty())
        .map(|article| Headline {
            id: headline_id(&article.title, SOURCE_NAME, &article.url),
            query: String::new(),
            category: None,
            sentiment_score: None,
            headline_meta: HeadlineMeta {
                source: SOURCE_NAME.to_string(),
                title: article.title,
                author: article.author,
                description: article.description,
                published_at: article.published_at,
                url: article.url,
                url_to_image: article.url_to_image,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_store::memory::MemoryStore;
    use std::sync::Mutex;

    fn article(title: &str, url: &str) -> NewsArticle {
        NewsArticle {
            title: title.to_string(),
            url: url.to_string(),
            author: "author".to_string(),
            description: "description".to_string(),
            published_at: "2026-08-01T00:00:00Z".to_string(),
            url_to_image: String::new(),
        }
    }

    /// Classifier scripted per round: each call pops the next canned
    /// response and fills in real ids by matching on the title.
    struct ScriptedClassifier {
        rounds: Mutex<Vec<Vec<(String, String, String)>>>, // (title, query, category)
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedClassifier {
        fn new(rounds: Vec<Vec<(&str, &str, &str)>>) -> Self {
            ScriptedClassifier {
                rounds: Mutex::new(
                    rounds
                        .into_iter()
                        .map(|round| {
                            round
                                .into_iter()
                                .map(|(t, q, c)| (t.to_string(), q.to_string(), c.to_string()))
                                .collect()
                        })
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HeadlineClassifier for ScriptedClassifier {
        async fn classify(
            &self,
            batch: &[Headline],
        ) -> Result<Vec<ClassifiedHeadline>, ClassifierError> {
            self.calls.lock().unwrap().push(batch.len());
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.is_empty() {
                return Ok(Vec::new());
            }
            let round = rounds.remove(0);
            Ok(round
                .into_iter()
                .filter_map(|(title, query, category)| {
                    batch
                        .iter()
                        .find(|shell| shell.headline_meta.title == title)
                        .map(|shell| ClassifiedHeadline {
                            id: shell.id.clone(),
                            headline: title.clone(),
                            query,
                            category,
                        })
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn malformed_entries_requeue_and_persist_on_the_next_round() {
        // Round 1: h1 valid, h2 missing query, h3 valid.
        // Round 2: h2 comes back well-formed.
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            vec![
                ("one", "query one", "Technology"),
                ("two", "", "Sports"),
                ("three", "query three", "Sports"),
            ],
            vec![("two", "query two", "Sports")],
        ]));
        let store = Arc::new(MemoryStore::new());
        let generator = HeadlineGenerator::new(classifier.clone(), store.clone(), 100, 5);
        let token = CancellationToken::new();

        let report = generator
            .run(
                &token,
                vec![
                    article("one", "https://example.com/1"),
                    article("two", "https://example.com/2"),
                    article("three", "https://example.com/3"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.headline_count(), 3);
        assert_eq!(report.persisted, 3);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dropped, 0);
        // First round saw all three, second round only the re-queued one.
        assert_eq!(*classifier.calls.lock().unwrap(), vec![3, 1]);
    }

    #[tokio::test]
    async fn persisted_headlines_always_carry_query_and_category() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![vec![
            ("good", "query", "Crime & Law"),
            ("bad category", "query", "Gossip"),
        ]]));
        let store = Arc::new(MemoryStore::new());
        // Cap of zero: anything malformed is dropped instead of re-queued.
        let generator = HeadlineGenerator::new(classifier, store.clone(), 100, 0);
        let token = CancellationToken::new();

        generator
            .run(
                &token,
                vec![
                    article("good", "https://example.com/g"),
                    article("bad category", "https://example.com/b"),
                ],
            )
            .await
            .unwrap();

        let headlines = store.headlines.lock().unwrap();
        assert_eq!(headlines.len(), 1);
        for headline in headlines.values() {
            assert!(headline.is_classified());
            assert_eq!(headline.category, Some(Category::CrimeLaw));
        }
    }

    #[tokio::test]
    async fn second_run_on_identical_input_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();

        for _ in 0..2 {
            let classifier = Arc::new(ScriptedClassifier::new(vec![vec![(
                "repeat",
                "query",
                "Technology",
            )]]));
            let generator = HeadlineGenerator::new(classifier, store.clone(), 100, 5);
            generator
                .run(&token, vec![article("repeat", "https://example.com/r")])
                .await
                .unwrap();
        }

        assert_eq!(store.headline_count(), 1);
        // The second run filtered everything against the stored ids and
        // never issued a write.
        assert_eq!(store.write_calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_input_articles_collapse_to_one_headline() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![vec![(
            "dup",
            "query",
            "Sports",
        )]]));
        let store = Arc::new(MemoryStore::new());
        let generator = HeadlineGenerator::new(classifier, store.clone(), 100, 5);
        let token = CancellationToken::new();

        generator
            .run(
                &token,
                vec![
                    article("dup", "https://example.com/d"),
                    article("dup", "https://example.com/d"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.headline_count(), 1);
    }

    #[tokio::test]
    async fn headlines_dropped_after_the_requeue_cap() {
        // The classifier always answers with an empty category.
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            vec![("stubborn", "query", "")],
            vec![("stubborn", "query", "")],
            vec![("stubborn", "query", "")],
        ]));
        let store = Arc::new(MemoryStore::new());
        let generator = HeadlineGenerator::new(classifier, store.clone(), 100, 2);
        let token = CancellationToken::new();

        let report = generator
            .run(&token, vec![article("stubborn", "https://example.com/s")])
            .await
            .unwrap();

        assert_eq!(store.headline_count(), 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.requeued, 2);
    }

    #[tokio::test]
    async fn empty_titles_are_discarded_during_normalization() {
        let shells = normalize_articles(vec![
            article("", "https://example.com/empty"),
            article("kept", "https://example.com/kept"),
        ]);
        assert_eq!(shells.len(), 1);
        assert_eq!(shells[0].headline_meta.title, "kept");
    }

    #[test]
    fn normalization_is_stable_under_reingestion() {
        let first = normalize_articles(vec![article("same", "https://example.com/s")]);
        let second = normalize_articles(vec![article("same", "https://example.com/s")]);
        assert_eq!(first[0].id, second[0].id);
    }
}
