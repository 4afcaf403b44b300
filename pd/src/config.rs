//! Configuration types and loading.
//!
//! Fallback chain: explicit path, then ./.pmdaemon.yml, then
//! ~/.config/pmdaemon/pmdaemon.yml, then defaults.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pmstore::Model;

/// Main pmdaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runner (LLM provider) configuration
    pub llm: LlmConfig,

    /// Daemon loop tuning
    pub daemon: DaemonConfig,

    /// Host resource thresholds
    pub resources: ResourceConfig,

    /// Review policy
    pub review: ReviewConfig,

    /// Worker self-verification tooling
    pub verification: VerificationConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".pmdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pmdaemon").join("pmdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Runner provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("anthropic", or "script" for offline runs)
    pub provider: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Default model tier when the task recommends none
    #[serde(rename = "default-model")]
    pub default_model: Model,

    /// Model id for the Haiku tier
    #[serde(rename = "haiku-model")]
    pub haiku_model: String,

    /// Model id for the Sonnet tier
    #[serde(rename = "sonnet-model")]
    pub sonnet_model: String,

    /// Model id for the Opus tier
    #[serde(rename = "opus-model")]
    pub opus_model: String,

    /// Shell command for the script provider; receives the prompt on stdin
    #[serde(rename = "script-command")]
    pub script_command: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            default_model: Model::Sonnet,
            haiku_model: "claude-3-5-haiku-20241022".to_string(),
            sonnet_model: "claude-sonnet-4-20250514".to_string(),
            opus_model: "claude-opus-4-20250514".to_string(),
            script_command: None,
        }
    }
}

impl LlmConfig {
    /// Concrete API model id for a tier
    pub fn model_id(&self, model: Model) -> &str {
        match model {
            Model::Haiku => &self.haiku_model,
            Model::Sonnet => &self.sonnet_model,
            Model::Opus => &self.opus_model,
        }
    }
}

/// Daemon loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum concurrent worker subprocesses
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// Default poll interval in seconds (the adaptive poller's start point)
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: f64,

    /// Adaptive poller floor
    #[serde(rename = "min-poll-interval-secs")]
    pub min_poll_interval_secs: f64,

    /// Adaptive poller ceiling
    #[serde(rename = "max-poll-interval-secs")]
    pub max_poll_interval_secs: f64,

    /// Per-worker process timeout in seconds
    #[serde(rename = "worker-timeout-secs")]
    pub worker_timeout_secs: u64,

    /// Seconds a worker log may go without updates before the worker is
    /// considered stuck
    #[serde(rename = "stale-log-timeout-secs")]
    pub stale_log_timeout_secs: u64,

    /// Seconds an ESCALATED task may sit before the safety valve rejects it
    #[serde(rename = "escalated-timeout-secs")]
    pub escalated_timeout_secs: u64,

    /// Interval of the orphaned-DONE review sweep
    #[serde(rename = "orphan-review-interval-secs")]
    pub orphan_review_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            poll_interval_secs: 10.0,
            min_poll_interval_secs: 1.0,
            max_poll_interval_secs: 30.0,
            worker_timeout_secs: 1800,
            stale_log_timeout_secs: 600,
            escalated_timeout_secs: 300,
            orphan_review_interval_secs: 60,
        }
    }
}

/// Host resource thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// CPU percent above which no new workers launch
    #[serde(rename = "max-cpu-percent")]
    pub max_cpu_percent: f32,

    /// Memory percent above which no new workers launch
    #[serde(rename = "max-memory-percent")]
    pub max_memory_percent: f32,

    /// Disable to skip sampling entirely
    #[serde(rename = "enable-monitoring")]
    pub enable_monitoring: bool,

    /// Scale max_workers with the resource trend
    #[serde(rename = "enable-auto-scaling")]
    pub enable_auto_scaling: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: 85.0,
            max_memory_percent: 85.0,
            enable_monitoring: true,
            enable_auto_scaling: true,
        }
    }
}

/// Review policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Spawn reviewers for DONE tasks automatically
    #[serde(rename = "auto-review")]
    pub auto_review: bool,

    /// Model tier used for reviews
    #[serde(rename = "review-model")]
    pub review_model: Model,

    /// Rework budget before PM redesign kicks in
    #[serde(rename = "max-rework")]
    pub max_rework: u32,

    /// Bound on review-driven escalations per task
    #[serde(rename = "escalation-max")]
    pub escalation_max: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            auto_review: true,
            review_model: Model::Sonnet,
            max_rework: 3,
            escalation_max: 2,
        }
    }
}

/// Worker self-verification tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Bounded fix-loop iterations
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Per-extension check commands; `{file}` is substituted.
    /// Extensions without an entry are skipped.
    pub commands: BTreeMap<String, String>,

    /// Optional static-analysis command run best-effort after verification;
    /// `{files}` is substituted. Last integer on stdout is taken as a score.
    #[serde(rename = "analyzer-command")]
    pub analyzer_command: Option<String>,

    /// Optional auto-fixer command run before the analyzer
    #[serde(rename = "fixer-command")]
    pub fixer_command: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert("py".to_string(), "python3 -m py_compile {file}".to_string());
        commands.insert("sh".to_string(), "bash -n {file}".to_string());
        commands.insert("js".to_string(), "node --check {file}".to_string());
        Self {
            max_iterations: 3,
            commands,
            analyzer_command: None,
            fixer_command: None,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,

    /// Root under which PROJECTS/<project>/RESULT/<order>/ trees live
    #[serde(rename = "projects-root")]
    pub projects_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("pm.db"),
            projects_root: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.max_workers, 5);
        assert_eq!(config.resources.max_cpu_percent, 85.0);
        assert_eq!(config.review.max_rework, 3);
        assert_eq!(config.llm.default_model, Model::Sonnet);
        assert!(config.verification.commands.contains_key("py"));
    }

    #[test]
    fn test_kebab_case_yaml_round_trip() {
        let yaml = r#"
daemon:
  max-workers: 3
  escalated-timeout-secs: 120
resources:
  max-cpu-percent: 70.0
review:
  max-rework: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.daemon.max_workers, 3);
        assert_eq!(config.daemon.escalated_timeout_secs, 120);
        assert_eq!(config.resources.max_cpu_percent, 70.0);
        assert_eq!(config.review.max_rework, 2);
        // Unspecified sections keep defaults
        assert_eq!(config.daemon.poll_interval_secs, 10.0);
    }

    #[test]
    fn test_model_id_mapping() {
        let llm = LlmConfig::default();
        assert!(llm.model_id(Model::Opus).contains("opus"));
        assert!(llm.model_id(Model::Haiku).contains("haiku"));
    }
}
