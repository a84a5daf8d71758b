use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    // Overall deadline for one generator run; the process exits 1 when it
    // is exceeded.
    #[envconfig(from = "APP_TIMEOUT_MINUTES", default = "20")]
    pub app_timeout_minutes: u64,

    #[envconfig(from = "OPENAI_API_KEY", default = "")]
    pub openai_api_key: String,

    #[envconfig(from = "OPENAI_BASE_URL", default = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[envconfig(from = "OPENAI_MODEL", default = "gpt-4o-mini")]
    pub openai_model: String,

    #[envconfig(from = "OPENAI_RETRY_ATTEMPTS", default = "5")]
    pub openai_retry_attempts: u32,

    #[envconfig(from = "HEADLINE_BATCH_SIZE", default = "100")]
    pub headline_batch_size: usize,

    #[envconfig(from = "NEWS_API_KEY", default = "")]
    pub news_api_key: String,

    #[envconfig(
        from = "NEWS_API_ENDPOINT",
        default = "https://newsapi.org/v2/top-headlines"
    )]
    pub news_api_endpoint: String,
}

impl Config {
    pub fn app_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.app_timeout_minutes * 60)
    }
}
