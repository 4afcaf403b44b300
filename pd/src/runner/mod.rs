//! Runner port: the AI model invocation behind the orchestrator.
//!
//! `run(prompt, {model, timeout, max_turns, allowed_tools}) ->
//! {text, cost_usd, success, error}` with a hard timeout at the call
//! boundary. Workers treat the call as synchronous and one-shot.

use std::sync::Arc;

use tracing::debug;

mod anthropic;
mod error;
mod script;
mod types;

pub use anthropic::AnthropicRunner;
pub use error::RunnerError;
pub use script::ScriptRunner;
pub use types::{RunnerOutcome, RunnerRequest};

use crate::config::LlmConfig;

/// The model invocation capability. One call per worker step; no streaming,
/// no cooperative cancellation inside the call.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, request: RunnerRequest) -> Result<RunnerOutcome, RunnerError>;
}

/// Create a runner from config. `provider: script` reads the completion
/// from a shell command (tests, offline dry-runs).
pub fn create_runner(config: &LlmConfig) -> Result<Arc<dyn Runner>, RunnerError> {
    debug!(provider = %config.provider, "create_runner: called");
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicRunner::from_config(config)?)),
        "script" => {
            let command = config.script_command.clone().ok_or_else(|| {
                RunnerError::InvalidResponse("script provider requires script-command".to_string())
            })?;
            Ok(Arc::new(ScriptRunner::new(command)))
        }
        other => Err(RunnerError::InvalidResponse(format!(
            "Unknown runner provider: '{}'. Supported: anthropic, script",
            other
        ))),
    }
}

/// Extract a JSON object from a model response that may wrap it in a
/// ```json fence or surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            let candidate = rest[..end].trim();
            if candidate.starts_with('{') {
                return Some(candidate);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(text[start..=end].trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fence() {
        let text = "Here is the plan:\n```json\n{\"tasks\": []}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"tasks\": []}"));
    }

    #[test]
    fn test_extract_json_bare() {
        let text = "verdict follows {\"verdict\": \"APPROVED\"} end";
        assert_eq!(extract_json(text), Some("{\"verdict\": \"APPROVED\"}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            ..LlmConfig::default()
        };
        assert!(create_runner(&config).is_err());
    }
}
