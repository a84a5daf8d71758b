use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    AnalysisBatchRequest, AnalysisResponse, InferenceClient, InferenceError, SummaryBatchRequest,
    SummaryBatchResponse,
};

const PREVIEW_BYTES: usize = 50;

#[derive(Envconfig, Clone)]
pub struct InferenceConfig {
    #[envconfig(default = "http://localhost:8100/summarize")]
    pub summarizer_endpoint: String,

    #[envconfig(default = "http://localhost:8101/analyze_batch")]
    pub analyzer_endpoint: String,

    #[envconfig(default = "http://localhost:8100/health")]
    pub summarizer_health_endpoint: String,

    #[envconfig(default = "http://localhost:8101/health")]
    pub analyzer_health_endpoint: String,

    #[envconfig(from = "APP_ENV", default = "dev")]
    pub app_env: String,

    #[envconfig(default = "10")]
    pub inference_max_attempts: u32,
}

impl InferenceConfig {
    /// Production backends answer fast or not at all; dev backends may be
    /// cold-starting, so give them room.
    pub fn request_timeout(&self) -> Duration {
        if self.app_env == "prod" {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// HTTP client for the inference backends with jittered exponential
/// backoff. 5xx answers and transport errors retry; anything else is
/// returned to the caller as-is.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    config: InferenceConfig,
}

impl HttpInferenceClient {
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(HttpInferenceClient { client, config })
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, InferenceError> {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);
        let attempts = self.config.inference_max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_post(endpoint, request).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt == attempts => return Err(err),
                // A 200 with an undecodable body will not improve on
                // retry; bail out and let the caller handle it.
                Err(err @ InferenceError::Decode { .. }) => return Err(err),
                Err(err) => {
                    warn!(endpoint, attempt, error = %err, "inference request failed, will retry");
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    tokio::time::sleep(backoff + jitter).await;
                    if backoff < max_backoff {
                        backoff *= 2;
                    }
                }
            }
        }

        Err(InferenceError::Exhausted { attempts })
    }

    async fn try_post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, InferenceError> {
        let response = self.client.post(endpoint).json(request).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                preview: preview(&body),
            });
        }

        serde_json::from_slice(&body).map_err(|err| InferenceError::Decode {
            reason: err.to_string(),
            preview: preview(&body),
        })
    }

    async fn probe(&self, endpoint: &str) -> bool {
        match self.client.get(endpoint).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(endpoint, error = %err, "health probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn summarize_batch(
        &self,
        request: &SummaryBatchRequest,
    ) -> Result<SummaryBatchResponse, InferenceError> {
        self.post_json(&self.config.summarizer_endpoint, request).await
    }

    async fn analyze_batch(
        &self,
        request: &AnalysisBatchRequest,
    ) -> Result<Vec<AnalysisResponse>, InferenceError> {
        self.post_json(&self.config.analyzer_endpoint, request).await
    }

    async fn summarizer_healthy(&self) -> bool {
        self.probe(&self.config.summarizer_health_endpoint).await
    }

    async fn analyzer_healthy(&self) -> bool {
        self.probe(&self.config.analyzer_health_endpoint).await
    }
}

/// Bounded slice of a response body for log lines; whole payloads never
/// reach the logs.
fn preview(body: &[u8]) -> String {
    let end = body.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_bounded() {
        let long = vec![b'a'; 500];
        assert_eq!(preview(&long).len(), PREVIEW_BYTES);
        assert_eq!(preview(b"short"), "short");
    }

    #[test]
    fn timeout_depends_on_environment() {
        let mut config = InferenceConfig::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        config.app_env = "prod".to_string();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }
}
