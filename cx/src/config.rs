//! Cortexd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main cortexd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Worker pool limits
    #[serde(rename = "worker-pool")]
    pub worker_pool: WorkerPoolConfig,

    /// Autonomy engine tuning
    pub autonomy: AutonomyConfig,

    /// Cognitive load balancer thresholds
    pub load: LoadConfig,

    /// Supervisor / reliability tuning
    pub supervisor: SupervisorConfig,

    /// Session store tuning
    pub session: SessionConfig,

    /// Temporal scheduler tuning
    pub scheduler: SchedulerConfig,

    /// Policy engine mode and rules
    pub policy: PolicyConfig,

    /// Planner rewrite budget
    pub planner: PlannerConfig,

    /// Sandbox executor defaults
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .cortexd.yml
        let local_config = PathBuf::from(".cortexd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/cortexd/cortexd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("cortexd").join("cortexd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
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

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            model: "llama-3.1-70b".to_string(),
            api_key_env: "CORTEXD_API_KEY".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            max_tokens: 1024,
            timeout_ms: 30_000,
        }
    }
}

/// Worker pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent provider dispatches
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// Maximum concurrent blocking calls routed to the thread executor
    #[serde(rename = "thread-workers")]
    pub thread_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            thread_workers: 8,
        }
    }
}

/// Autonomy engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Default autonomy mode: "full", "hybrid" or "ask_first".
    /// The session context key `autonomy_mode` overrides this at runtime.
    pub mode: String,

    /// Bounded perception event queue size
    #[serde(rename = "event-queue-size")]
    pub event_queue_size: usize,

    /// Number of concurrent event workers
    #[serde(rename = "event-processing-concurrency")]
    pub event_processing_concurrency: usize,

    /// Events older than this are dropped
    #[serde(rename = "max-event-age-secs")]
    pub max_event_age_secs: f64,

    /// Intent classification timeout in milliseconds
    #[serde(rename = "intent-timeout-ms")]
    pub intent_timeout_ms: u64,

    /// Planner DSL generation timeout in milliseconds
    #[serde(rename = "planner-timeout-ms")]
    pub planner_timeout_ms: u64,

    /// Orchestrator dispatch timeout in milliseconds
    #[serde(rename = "execution-timeout-ms")]
    pub execution_timeout_ms: u64,

    /// Confidence at or above which intents run without asking
    #[serde(rename = "high-confidence")]
    pub high_confidence: f64,

    /// Confidence at or above which intents run in full mode (ask otherwise)
    #[serde(rename = "medium-confidence")]
    pub medium_confidence: f64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            mode: "hybrid".to_string(),
            event_queue_size: 1000,
            event_processing_concurrency: 4,
            max_event_age_secs: 30.0,
            intent_timeout_ms: 2_000,
            planner_timeout_ms: 10_000,
            execution_timeout_ms: 60_000,
            high_confidence: 0.85,
            medium_confidence: 0.65,
        }
    }
}

/// Cognitive load balancer thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Smoothing window in seconds
    #[serde(rename = "window-secs")]
    pub window_secs: f64,

    /// Decay spread: weights decay as 2^(-age/spread)
    pub spread: f64,

    /// Soft-throttle threshold
    pub warn: f64,

    /// Hard-throttle threshold
    pub high: f64,

    /// Weight recorded per proposal
    #[serde(rename = "proposal-weight")]
    pub proposal_weight: f64,

    /// Weight recorded per service tick
    #[serde(rename = "tick-weight")]
    pub tick_weight: f64,

    /// Weight recorded per heavy IO event
    #[serde(rename = "io-weight")]
    pub io_weight: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            window_secs: 30.0,
            spread: 6.0,
            warn: 0.6,
            high: 0.8,
            proposal_weight: 1.0,
            tick_weight: 0.5,
            io_weight: 0.8,
        }
    }
}

/// Supervisor / reliability tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Watchdog timeout per service run, in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before a service is marked dead
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Exponential backoff base
    #[serde(rename = "backoff-base")]
    pub backoff_base: f64,

    /// Backoff cap in seconds
    #[serde(rename = "max-backoff-secs")]
    pub max_backoff_secs: f64,

    /// Grace period between clean completion and restart, in milliseconds
    #[serde(rename = "restart-grace-ms")]
    pub restart_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_retries: 5,
            backoff_base: 2.0,
            max_backoff_secs: 300.0,
            restart_grace_ms: 5_000,
        }
    }
}

/// Session store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the session database
    #[serde(rename = "db-path")]
    pub db_path: String,

    /// Default TTL for new sessions, in seconds
    #[serde(rename = "default-ttl-secs")]
    pub default_ttl_secs: f64,

    /// Write-behind queue capacity
    #[serde(rename = "write-queue-size")]
    pub write_queue_size: usize,

    /// Sweeper interval in milliseconds
    #[serde(rename = "sweeper-interval-ms")]
    pub sweeper_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: "data/sessions.db".to_string(),
            default_ttl_secs: 86_400.0,
            write_queue_size: 1024,
            sweeper_interval_ms: 30_000,
        }
    }
}

/// Temporal scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Session context key under which jobs persist
    #[serde(rename = "persistence-key")]
    pub persistence_key: String,

    /// Upper bound on the scheduler sleep, for responsiveness
    #[serde(rename = "max-sleep-ms")]
    pub max_sleep_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            persistence_key: "cognition.scheduler.jobs".to_string(),
            max_sleep_ms: 1_000,
        }
    }
}

/// Policy engine mode and rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// "permissive" or "restrictive"
    pub mode: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: "permissive".to_string(),
        }
    }
}

/// Planner rewrite budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// How many LLM rewrites a failed parse may request
    #[serde(rename = "max-rewrite-attempts")]
    pub max_rewrite_attempts: u32,

    /// Backoff between rewrite attempts, in milliseconds
    #[serde(rename = "rewrite-backoff-ms")]
    pub rewrite_backoff_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_rewrite_attempts: 1,
            rewrite_backoff_ms: 500,
        }
    }
}

/// Sandbox executor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Working directory for sandboxed commands
    #[serde(rename = "work-dir")]
    pub work_dir: String,

    /// Default command timeout in seconds
    #[serde(rename = "default-timeout-secs")]
    pub default_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_dir: "/tmp/cortexd_sandbox".to_string(),
            default_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.autonomy.mode, "hybrid");
        assert_eq!(config.worker_pool.max_workers, 16);
        assert_eq!(config.supervisor.max_retries, 5);
        assert_eq!(config.policy.mode, "permissive");
    }

    #[test]
    fn test_autonomy_thresholds() {
        let config = AutonomyConfig::default();
        assert!(config.high_confidence > config.medium_confidence);
        assert_eq!(config.high_confidence, 0.85);
        assert_eq!(config.medium_confidence, 0.65);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
llm:
  model: mixtral-8x7b
  max-tokens: 512

worker-pool:
  max-workers: 4
  thread-workers: 2

autonomy:
  mode: ask_first
  event-queue-size: 100

load:
  warn: 0.5
  high: 0.7
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.model, "mixtral-8x7b");
        assert_eq!(config.llm.max_tokens, 512);
        assert_eq!(config.worker_pool.max_workers, 4);
        assert_eq!(config.autonomy.mode, "ask_first");
        assert_eq!(config.load.warn, 0.5);
        assert_eq!(config.load.high, 0.7);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
session:
  default-ttl-secs: 60
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // Specified value
        assert_eq!(config.session.default_ttl_secs, 60.0);

        // Defaults for unspecified
        assert_eq!(config.session.db_path, "data/sessions.db");
        assert_eq!(config.autonomy.mode, "hybrid");
        assert_eq!(config.scheduler.persistence_key, "cognition.scheduler.jobs");
    }
}
