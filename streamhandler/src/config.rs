use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    // Which change stream this process fans out: "headlines" or
    // "sentiment".
    #[envconfig(from = "PROCESSING_MODE")]
    pub processing_mode: String,

    #[envconfig(default = "5")]
    pub flush_interval_seconds: u64,

    // How long to wait before polling again when the stream is idle.
    #[envconfig(default = "1")]
    pub poll_idle_seconds: u64,

    #[envconfig(from = "POSTGRES_HOST", default = "localhost")]
    pub postgres_host: String,

    #[envconfig(from = "POSTGRES_PORT", default = "5432")]
    pub postgres_port: u16,

    #[envconfig(from = "POSTGRES_USER", default = "sentiflow")]
    pub postgres_user: String,

    #[envconfig(from = "POSTGRES_PASSWORD", default = "")]
    pub postgres_password: String,

    #[envconfig(from = "POSTGRES_DB", default = "sentiflow")]
    pub postgres_db: String,

    #[envconfig(from = "POSTGRES_MAX_OPEN_CONNS", default = "4")]
    pub postgres_max_open_conns: u32,

    #[envconfig(from = "POSTGRES_MIN_CONNS", default = "0")]
    pub postgres_min_conns: u32,

    #[envconfig(from = "POSTGRES_CONN_MAX_LIFETIME_MINUTES", default = "30")]
    pub postgres_conn_max_lifetime_minutes: u64,

    #[envconfig(from = "POSTGRES_CONN_MAX_IDLE_TIME_MINUTES", default = "5")]
    pub postgres_conn_max_idle_time_minutes: u64,

    #[envconfig(from = "MEILISEARCH_URL", default = "http://localhost:7700")]
    pub meilisearch_url: String,

    #[envconfig(from = "MEILISEARCH_API_KEY")]
    pub meilisearch_api_key: Option<String>,
}

impl Config {
    pub fn postgres_dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_db
        )
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.flush_interval_seconds)
    }

    pub fn poll_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_idle_seconds)
    }
}
