//! Challenge solving. The portal shows a short word of obscured text; the
//! solver only has to return that text.

use async_trait::async_trait;
use jtt_storage::{join_url, HttpClientConfig, JsonClient, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Length of every solution the portal has ever accepted.
pub const SOLUTION_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver unavailable: {0}")]
    Unavailable(String),
    #[error("low-confidence answer {0:?}")]
    LowConfidence(String),
    #[error("solver request failed: {0}")]
    Transport(#[from] TransportError),
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// `image` is the portal's inline `data:` URL.
    async fn solve(&self, image: &str) -> Result<String, SolverError>;
}

pub fn solution_format_is_valid(solution: &str) -> bool {
    solution.len() == SOLUTION_LEN && solution.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl OpenAiConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &'static str = "gpt-4o";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
        }
    }
}

const SYSTEM_PROMPT: &str = "The user will send you images containing a single word of \
obfuscated text. Reply only with the text in the image, with no spaces or quotes.";

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Asks a vision-capable chat model to read the challenge image.
#[derive(Debug, Clone)]
pub struct OpenAiSolver {
    config: OpenAiConfig,
    http: JsonClient,
}

impl OpenAiSolver {
    pub fn new(config: OpenAiConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        let http = HttpClientConfig {
            cookie_store: false,
            xhr_headers: false,
            ..http.clone()
        };
        Ok(Self {
            config,
            http: JsonClient::new(&http)?,
        })
    }
}

#[async_trait]
impl ChallengeSolver for OpenAiSolver {
    async fn solve(&self, image: &str) -> Result<String, SolverError> {
        if self.config.api_key.is_empty() {
            return Err(SolverError::Unavailable("no API key configured".into()));
        }
        let body = json!({
            "model": self.config.model,
            "max_tokens": 300,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": [
                    {"type": "image_url", "image_url": {"url": image}}
                ]}
            ]
        });
        let url = join_url(&self.config.base_url, "chat/completions");
        let auth = [("Authorization", format!("Bearer {}", self.config.api_key))];
        let completion: Completion = self.http.post_json(&url, &auth, &body).await?;

        let answer: String = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SolverError::Unavailable("completion without content".into()))?
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '"' && *c != '\'')
            .collect();
        debug!(answer = %answer, "solver answered");
        if answer.is_empty() {
            return Err(SolverError::LowConfidence(answer));
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_four_alphanumerics_pass() {
        assert!(solution_format_is_valid("aB3x"));
        assert!(!solution_format_is_valid("abc"));
        assert!(!solution_format_is_valid("abcde"));
        assert!(!solution_format_is_valid("ab c"));
        assert!(!solution_format_is_valid("ab-c"));
        assert!(!solution_format_is_valid("äbcd"));
    }

    #[tokio::test]
    async fn missing_key_is_unavailable() {
        let solver = OpenAiSolver::new(OpenAiConfig::new(""), &HttpClientConfig::default()).unwrap();
        let err = solver.solve("data:image/png;base64,AAAA").await.unwrap_err();
        assert!(matches!(err, SolverError::Unavailable(_)));
    }
}
