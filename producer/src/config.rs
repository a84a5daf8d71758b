use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "DEDUP_CACHE_ADDRESS", default = "localhost:6379")]
    pub dedup_cache_address: String,

    #[envconfig(from = "DEDUP_CACHE_PASSWORD")]
    pub dedup_cache_password: Option<String>,

    #[envconfig(from = "DEDUP_CACHE_TLS", default = "false")]
    pub dedup_cache_tls: bool,

    #[envconfig(default = "86400")]
    pub dedup_ttl_seconds: u64,

    #[envconfig(from = "REDDIT_BASE_URL", default = "https://www.reddit.com")]
    pub reddit_base_url: String,

    #[envconfig(from = "REDDIT_USER_AGENT", default = "sentiflow-ingest/0.1")]
    pub reddit_user_agent: String,

    // Bound on pagination per query, to keep one hot query from starving
    // the rest of the run.
    #[envconfig(default = "5")]
    pub max_pages_per_query: u32,
}

impl Config {
    pub fn dedup_cache_url(&self) -> String {
        let scheme = if self.dedup_cache_tls { "rediss" } else { "redis" };
        match &self.dedup_cache_password {
            Some(password) => format!("{scheme}://:{password}@{}", self.dedup_cache_address),
            None => format!("{scheme}://{}", self.dedup_cache_address),
        }
    }

    pub fn dedup_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dedup_ttl_seconds)
    }
}
