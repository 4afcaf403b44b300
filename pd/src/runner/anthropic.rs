//! Anthropic Messages API runner.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Runner, RunnerError, RunnerOutcome, RunnerRequest};
use super::types::TokenUsage;
use crate::config::LlmConfig;

/// Anthropic Messages API client.
pub struct AnthropicRunner {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    haiku_model: String,
    sonnet_model: String,
    opus_model: String,
}

impl AnthropicRunner {
    /// Create a runner from configuration. Reads the API key from the
    /// environment variable named in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, RunnerError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| RunnerError::MissingApiKey(config.api_key_env.clone()))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            haiku_model: config.haiku_model.clone(),
            sonnet_model: config.sonnet_model.clone(),
            opus_model: config.opus_model.clone(),
        })
    }

    fn model_id(&self, model: pmstore::Model) -> &str {
        match model {
            pmstore::Model::Haiku => &self.haiku_model,
            pmstore::Model::Sonnet => &self.sonnet_model,
            pmstore::Model::Opus => &self.opus_model,
        }
    }

    fn build_request_body(&self, request: &RunnerRequest) -> serde_json::Value {
        let mut system = String::new();
        if !request.allowed_tools.is_empty() {
            system.push_str(&format!(
                "Permitted capabilities for this task: {}. Do not assume any other capability.",
                request.allowed_tools.join(", ")
            ));
        }

        let mut body = serde_json::json!({
            "model": self.model_id(request.model),
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        body
    }

    fn parse_response(&self, response: ApiResponse, model: pmstore::Model) -> RunnerOutcome {
        let text = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ApiContentBlock::Text { text } => Some(text),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cache_read_tokens: response.usage.cache_read_input_tokens.unwrap_or(0),
        };

        RunnerOutcome::ok(text, Some(usage.cost_usd(model)))
    }
}

#[async_trait]
impl Runner for AnthropicRunner {
    async fn run(&self, request: RunnerRequest) -> Result<RunnerOutcome, RunnerError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);
        debug!(
            model = request.model.as_str(),
            timeout_secs = request.timeout.as_secs(),
            prompt_len = request.prompt.len(),
            "run: calling Anthropic API"
        );

        let send = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::time::timeout(request.timeout, send)
            .await
            .map_err(|_| RunnerError::Timeout(request.timeout))??;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            warn!(retry_after_secs, "run: rate limited");
            return Err(RunnerError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RunnerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| RunnerError::InvalidResponse(e.to_string()))?;

        Ok(self.parse_response(api_response, request.model))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::Model;
    use std::time::Duration;

    fn test_runner() -> AnthropicRunner {
        AnthropicRunner {
            api_key: "test-key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: Client::new(),
            max_tokens: 4096,
            haiku_model: "claude-3-5-haiku-20241022".to_string(),
            sonnet_model: "claude-sonnet-4-20250514".to_string(),
            opus_model: "claude-opus-4-20250514".to_string(),
        }
    }

    #[test]
    fn test_request_body_includes_allowed_tools() {
        let runner = test_runner();
        let request = RunnerRequest::new("do the task", Model::Sonnet, Duration::from_secs(60))
            .with_allowed_tools(vec!["file_read".to_string(), "shell".to_string()]);

        let body = runner.build_request_body(&request);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert!(body["system"].as_str().unwrap().contains("file_read"));
        assert_eq!(body["messages"][0]["content"], "do the task");
    }

    #[test]
    fn test_request_body_no_system_without_tools() {
        let runner = test_runner();
        let request = RunnerRequest::new("hi", Model::Haiku, Duration::from_secs(60));
        let body = runner.build_request_body(&request);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_response_joins_text_and_prices() {
        let runner = test_runner();
        let api_response: ApiResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ],
            "usage": {"input_tokens": 1000, "output_tokens": 500, "cache_read_input_tokens": null}
        }))
        .unwrap();

        let outcome = runner.parse_response(api_response, Model::Sonnet);
        assert!(outcome.success);
        assert_eq!(outcome.text, "first\nsecond");
        assert!(outcome.cost_usd.unwrap() > 0.0);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_config_requires_key() {
        unsafe { std::env::remove_var("PMDAEMON_TEST_KEY") };
        let config = LlmConfig {
            api_key_env: "PMDAEMON_TEST_KEY".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            AnthropicRunner::from_config(&config),
            Err(RunnerError::MissingApiKey(_))
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_from_config_reads_env_key() {
        unsafe { std::env::set_var("PMDAEMON_TEST_KEY", "test-key-value") };
        let config = LlmConfig {
            api_key_env: "PMDAEMON_TEST_KEY".to_string(),
            ..LlmConfig::default()
        };
        let runner = AnthropicRunner::from_config(&config).unwrap();
        assert_eq!(runner.api_key, "test-key-value");
        unsafe { std::env::remove_var("PMDAEMON_TEST_KEY") };
    }
}
