//! Minimal client for Anthropic-Messages-compatible endpoints.
//!
//! Only non-streaming single-turn calls are needed: every stage collaborator
//! sends one system prompt and one user message and expects JSON text back.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use super::retry::{is_retryable_status, with_retry, IsRetryable, RetryConfig};
use crate::constants;
use crate::error::CollaboratorError;

#[derive(Debug, Clone)]
pub struct AiClientConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: usize,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            base_url: constants::ai::DEFAULT_BASE_URL.to_string(),
            model: constants::ai::DEFAULT_MODEL.to_string(),
            max_tokens: constants::ai::MAX_OUTPUT_TOKENS,
            api_key: None,
            request_timeout: Duration::from_secs(constants::ai::REQUEST_TIMEOUT_SECS),
            max_attempts: constants::ai::MAX_ATTEMPTS,
        }
    }
}

/// One failed HTTP exchange.
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(status) = self.status {
            write!(f, "HTTP {}: {}", status, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ApiError {}

impl IsRetryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self.status {
            Some(status) => is_retryable_status(status),
            // Network errors without status codes are typically retryable
            None => {
                self.message.contains("timeout")
                    || self.message.contains("connection")
                    || self.message.contains("network")
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timeout: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        Self {
            message,
            status: err.status().map(|s| s.as_u16()),
            retry_after: None,
        }
    }
}

impl ApiError {
    /// Fold into the collaborator taxonomy once retries are spent.
    pub fn into_collaborator_error(self) -> CollaboratorError {
        match self.status {
            Some(401) | Some(403) => CollaboratorError::Unavailable(self.to_string()),
            _ if self.is_retryable() => CollaboratorError::Transient(self.to_string()),
            Some(_) => CollaboratorError::Rejected(self.to_string()),
            None => CollaboratorError::Unavailable(self.to_string()),
        }
    }
}

pub struct AiClient {
    http: reqwest::Client,
    config: AiClientConfig,
    retry: RetryConfig,
}

impl AiClient {
    pub fn new(config: AiClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let retry = RetryConfig {
            max_attempts: config.max_attempts.max(1),
            ..RetryConfig::default()
        };
        Ok(Self {
            http,
            config,
            retry,
        })
    }

    pub fn config(&self) -> &AiClientConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Single-turn call with transient retry. Returns the concatenated text
    /// blocks of the reply.
    pub async fn call_simple(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, CollaboratorError> {
        if !self.is_configured() {
            return Err(CollaboratorError::Unavailable(
                "no API key configured (set FORGELINE_API_KEY)".to_string(),
            ));
        }
        with_retry(&self.retry, || self.call_once(system_prompt, user_message))
            .await
            .map_err(ApiError::into_collaborator_error)
    }

    async fn call_once(&self, system_prompt: &str, user_message: &str) -> Result<String, ApiError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": system_prompt,
            "messages": [{
                "role": "user",
                "content": user_message
            }]
        });

        let response = self
            .http
            .post(&self.config.base_url)
            .header("x-api-key", self.config.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", constants::ai::ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError {
                message: error_message(&text),
                status: Some(status.as_u16()),
                retry_after,
            });
        }

        let json: Value = response.json().await?;
        let text = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| collect_text(blocks))
            .unwrap_or_default();
        tracing::debug!(model = %self.config.model, chars = text.len(), "AI call completed");
        Ok(text.trim().to_string())
    }
}

fn collect_text(blocks: &[Value]) -> String {
    let mut text = String::new();
    for block in blocks {
        // Thinking blocks may precede the text block
        if block.get("type").and_then(|t| t.as_str()) != Some("text") {
            continue;
        }
        if let Some(chunk) = block.get("text").and_then(|t| t.as_str()) {
            text.push_str(chunk);
        }
    }
    text
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_only_text_blocks() {
        let blocks = vec![
            serde_json::json!({"type": "thinking", "thinking": "hmm"}),
            serde_json::json!({"type": "text", "text": "{\"a\":"}),
            serde_json::json!({"type": "text", "text": "1}"}),
        ];
        assert_eq!(collect_text(&blocks), "{\"a\":1}");
    }

    #[test]
    fn api_errors_map_to_collaborator_taxonomy() {
        let err = |status| ApiError {
            message: "x".into(),
            status: Some(status),
            retry_after: None,
        };
        assert!(matches!(err(429).into_collaborator_error(), CollaboratorError::Transient(_)));
        assert!(matches!(err(400).into_collaborator_error(), CollaboratorError::Rejected(_)));
        assert!(matches!(err(401).into_collaborator_error(), CollaboratorError::Unavailable(_)));
    }

    #[test]
    fn extracts_provider_error_message() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(error_message(body), "Overloaded");
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn unconfigured_client_is_unavailable() {
        let client = AiClient::new(AiClientConfig::default()).unwrap();
        let err = client.call_simple("sys", "hi").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }
}
