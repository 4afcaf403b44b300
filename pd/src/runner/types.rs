//! Runner request/response types.

use std::time::Duration;

use pmstore::Model;

/// Everything needed for one model call.
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    /// Full prompt text (assembled by the caller)
    pub prompt: String,

    /// Model tier to use
    pub model: Model,

    /// Hard timeout at the call boundary, inherited from the task's budget
    pub timeout: Duration,

    /// Upper bound on agent turns, for runners that iterate
    pub max_turns: u32,

    /// Capability subset the runner may advertise, from the task's
    /// permission profile
    pub allowed_tools: Vec<String>,
}

impl RunnerRequest {
    pub fn new(prompt: impl Into<String>, model: Model, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            model,
            timeout,
            max_turns: 1,
            allowed_tools: Vec::new(),
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }
}

/// Result of one model call.
#[derive(Debug, Clone)]
pub struct RunnerOutcome {
    /// Response text
    pub text: String,

    /// Cost in USD, when the provider reports usage
    pub cost_usd: Option<f64>,

    /// Whether the call completed successfully
    pub success: bool,

    /// Error detail for unsuccessful calls
    pub error: Option<String>,
}

impl RunnerOutcome {
    pub fn ok(text: impl Into<String>, cost_usd: Option<f64>) -> Self {
        Self {
            text: text.into(),
            cost_usd,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            cost_usd: None,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Token usage for cost tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Cost in USD based on per-tier pricing.
    pub fn cost_usd(&self, model: Model) -> f64 {
        let (input_price, output_price) = match model {
            Model::Opus => (15.0, 75.0),
            Model::Sonnet => (3.0, 15.0),
            Model::Haiku => (0.25, 1.25),
        };

        let input_cost = (self.input_tokens as f64 / 1_000_000.0) * input_price;
        let output_cost = (self.output_tokens as f64 / 1_000_000.0) * output_price;
        // Cache reads are 90% cheaper
        let cache_cost = (self.cache_read_tokens as f64 / 1_000_000.0) * input_price * 0.1;

        input_cost + output_cost + cache_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_sonnet() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: 500_000,
        };
        // $3 input + $1.50 output + $0.15 cache
        let cost = usage.cost_usd(Model::Sonnet);
        assert!((cost - 4.65).abs() < 0.01);
    }

    #[test]
    fn test_cost_opus() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: 0,
        };
        let cost = usage.cost_usd(Model::Opus);
        assert!((cost - 22.5).abs() < 0.01);
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = RunnerOutcome::ok("done", Some(0.1));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = RunnerOutcome::failed("timed out");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("timed out"));
    }
}
