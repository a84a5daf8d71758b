use sha2::{Digest, Sha256};

/// Deterministic id for a piece of ingested content. The same
/// `(source, post_id, query-or-topic)` triple always hashes to the same id,
/// which is what makes redelivery and store writes idempotent downstream.
pub fn content_id(source: &str, post_id: &str, query_or_topic: &str) -> String {
    digest(&format!("{query_or_topic}:{source}:{post_id}"))
}

/// Deterministic id for a headline, derived from `(title, source, url)`.
pub fn headline_id(title: &str, source: &str, url: &str) -> String {
    digest(&format!("{title}:{source}:{url}"))
}

fn digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_stable() {
        let a = content_id("reddit", "t3_abc", "apple iphone");
        let b = content_id("reddit", "t3_abc", "apple iphone");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_id_varies_with_every_component() {
        let base = content_id("reddit", "t3_abc", "apple iphone");
        assert_ne!(base, content_id("news", "t3_abc", "apple iphone"));
        assert_ne!(base, content_id("reddit", "t3_xyz", "apple iphone"));
        assert_ne!(base, content_id("reddit", "t3_abc", "google pixel"));
    }

    #[test]
    fn headline_id_is_stable_under_reingestion() {
        let first = headline_id("Apple launches new iPhone", "NewsAPI", "https://example.com/a");
        let second = headline_id("Apple launches new iPhone", "NewsAPI", "https://example.com/a");
        assert_eq!(first, second);
    }
}
