use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common_types::Headline;

use crate::config::Config;

/// System prompt pinning the output contract: one JSON object, ids echoed
/// verbatim, a non-empty query (falling back to the title), categories
/// from the closed set, quotes escaped, no markdown fences.
const SYSTEM_PROMPT: &str = r#"You will receive several news headlines formatted as JSON objects.

Your task is to transform each headline into a queryable format and assign it to one of the predefined categories.

Instructions:

Respond only with a single valid JSON object. Do not include any additional text, commentary, or markdown fences, and do not leave trailing commas.

For each headline object, include the following fields:

- headline: The original headline as it was provided.
    - All forms of double quotation marks in the original headline (standard '"', left curly, right curly) MUST be converted to standard double quotes in the output string value.
    - Standard double quotes and backslashes that appear as part of the headline's text MUST then be properly escaped ('\"' for a quote, '\\' for a backslash).

- query: A concise, clear, and searchable version of the headline.
    - This field MUST ALWAYS contain a non-empty string value. It MUST NOT be null.
    - If a searchable query cannot reasonably be formed from the headline, use the original headline text itself as the query.
    - NEVER return an empty string or a null value for the query field.

- category: Exactly one of the following categories:

    Technology

    Business & Finance

    Politics & World Affairs

    Entertainment & Pop Culture

    Health & Science

    Sports

    Lifestyle & Society

    Memes & Internet Trends

    Crime & Law

- id: Return the exact same ID that was received in the input.

Expected JSON response format:
{
  "headlines": [
    {
      "headline": "Original headline here",
      "query": "Queryable version of the headline",
      "category": "One of the predefined categories",
      "id": "Same ID as provided"
    }
  ]
}
"#;

#[derive(Debug, Clone, Serialize)]
struct ClassifyInput {
    id: String,
    headline: String,
}

/// One entry of the model's answer, before validation. `query` and
/// `category` are raw strings here; the generator decides what is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifiedHeadline {
    pub id: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Default, Deserialize)]
struct ClassifyResponse {
    headlines: Vec<ClassifiedHeadline>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model returned status {0}")]
    Status(u16),
    #[error("no acceptable response after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[async_trait]
pub trait HeadlineClassifier: Send + Sync {
    /// Classify a batch of headline shells. Only output that parses into
    /// the expected shape is accepted; everything else is retried up to
    /// the attempt cap.
    async fn classify(&self, batch: &[Headline])
        -> Result<Vec<ClassifiedHeadline>, ClassifierError>;
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    attempts: u32,
}

impl OpenAiClassifier {
    pub fn new(config: &Config) -> Self {
        OpenAiClassifier {
            http: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.clone(),
            model: config.openai_model.clone(),
            attempts: config.openai_retry_attempts.max(1),
        }
    }

    async fn chat(&self, batch: &[Headline]) -> Result<String, ClassifierError> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: SYSTEM_PROMPT.to_string(),
        }];
        for shell in batch {
            let input = ClassifyInput {
                id: shell.id.clone(),
                headline: shell.headline_meta.title.clone(),
            };
            messages.push(ChatMessage {
                role: "user",
                content: serde_json::to_string(&input).unwrap_or_default(),
            });
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.2,
            response_format: serde_json::json!({"type": "json_object"}),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClassifierError::Status(response.status().as_u16()));
        }

        let chat: ChatResponse = response.json().await?;
        Ok(chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl HeadlineClassifier for OpenAiClassifier {
    async fn classify(
        &self,
        batch: &[Headline],
    ) -> Result<Vec<ClassifiedHeadline>, ClassifierError> {
        for attempt in 1..=self.attempts {
            let raw = match self.chat(batch).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(attempt, error = %err, "classification request failed");
                    continue;
                }
            };

            match parse_response(&raw) {
                Some(entries) => return Ok(entries),
                None => {
                    warn!(
                        attempt,
                        preview = %raw.chars().take(50).collect::<String>(),
                        "model output did not match the expected shape"
                    );
                }
            }
        }

        Err(ClassifierError::Exhausted {
            attempts: self.attempts,
        })
    }
}

/// Strips markdown fences some models still emit despite the prompt, then
/// parses the JSON envelope.
pub fn parse_response(raw: &str) -> Option<Vec<ClassifiedHeadline>> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<ClassifyResponse>(cleaned) {
        Ok(response) => Some(response.headlines),
        Err(err) => {
            debug!(error = %err, "failed to parse classifier output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_json_object() {
        let raw = r#"{"headlines":[{"id":"h1","headline":"A","query":"a","category":"Sports"}]}"#;
        let entries = parse_response(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "h1");
        assert_eq!(entries[0].category, "Sports");
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"headlines\":[{\"id\":\"h2\",\"headline\":\"B\",\"query\":\"b\",\"category\":\"Technology\"}]}\n```";
        let entries = parse_response(raw).unwrap();
        assert_eq!(entries[0].id, "h2");
    }

    #[test]
    fn rejects_output_that_is_not_the_envelope() {
        assert!(parse_response("not json at all").is_none());
        assert!(parse_response(r#"{"topics": []}"#).unwrap_or_default().is_empty());
    }

    #[test]
    fn missing_fields_default_to_empty_strings() {
        let raw = r#"{"headlines":[{"id":"h3"}]}"#;
        let entries = parse_response(raw).unwrap();
        assert_eq!(entries[0].query, "");
        assert_eq!(entries[0].category, "");
    }
}
