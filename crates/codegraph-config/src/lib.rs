//! Configuration for the codegraph pipeline.
//!
//! Hierarchical precedence: CLI flags > environment variables > config file >
//! built-in defaults. The file format is TOML with one section per concern.
//! Environment overrides are restricted to the documented
//! [`OVERRIDABLE_PATHS`] table: there is no dynamic nested-path walking;
//! every overridable field is spelled out.

use camino::Utf8PathBuf;
use codegraph_reconcile::ReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Absolute ceiling on global LLM-call concurrency. Requests beyond this
/// (including `FORCE_MAX_CONCURRENCY`) are clamped, never honored.
pub const GLOBAL_CONCURRENCY_CEILING: usize = 100;

/// Environment variables recognized by [`Config::apply_env_overrides`],
/// mapped to the config path each one overrides.
pub const OVERRIDABLE_PATHS: [(&str, &str); 16] = [
    ("TARGET_DIR", "pipeline.target_dir"),
    ("RUN_ID_OVERRIDE", "pipeline.run_id_override"),
    ("HIGH_PERFORMANCE_MODE", "pipeline.high_performance"),
    ("LOG_DIRECTORY", "pipeline.log_directory"),
    ("BROKER_HOST", "broker.host"),
    ("BROKER_PORT", "broker.port"),
    ("BROKER_DB", "broker.db"),
    ("GRAPH_URI", "graph.uri"),
    ("GRAPH_USER", "graph.user"),
    ("GRAPH_PASSWORD", "graph.password"),
    ("GRAPH_DATABASE", "graph.database"),
    ("LLM_ENDPOINT", "llm.endpoint"),
    ("LLM_API_KEY", "llm.api_key"),
    ("FORCE_MAX_CONCURRENCY", "concurrency.max_global"),
    ("CPU_THRESHOLD", "concurrency.cpu_scale_down_pct"),
    ("MEMORY_THRESHOLD", "concurrency.memory_scale_down_pct"),
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(Utf8PathBuf),

    #[error("invalid config file {path}: {reason}")]
    InvalidFile { path: Utf8PathBuf, reason: String },

    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Directory to analyze.
    pub target_dir: Utf8PathBuf,
    /// Data directory: store database, breaker state files, run reports.
    pub data_dir: Utf8PathBuf,
    /// Externally-supplied run id; generated when absent.
    pub run_id_override: Option<String>,
    /// Use the deterministic stub LLM and the in-memory graph.
    pub test_mode: bool,
    /// Skip adaptive scale-downs; start every worker at its static cap.
    pub high_performance: bool,
    /// Extra log sink directory; stderr-only when absent.
    pub log_directory: Option<Utf8PathBuf>,
    /// Wipe prior rows for this run id before starting.
    pub clear_previous_run: bool,
    /// Grace period for in-flight jobs at shutdown, seconds.
    pub shutdown_timeout_secs: u64,
    /// Absolute ceiling on the completion wait, seconds.
    pub max_wait_secs: u64,
    /// Consecutive all-idle samples required to declare quiescence.
    pub quiescence_samples: u32,
    /// Interval between progress samples, seconds.
    pub sample_interval_secs: u64,
    /// Unchanged-sample count after which a stuck pipeline is deadlocked.
    pub deadlock_samples: u32,
    /// Soft process memory ceiling, MB.
    pub memory_limit_mb: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_dir: Utf8PathBuf::from("."),
            data_dir: Utf8PathBuf::from("./codegraph-data"),
            run_id_override: None,
            test_mode: false,
            high_performance: false,
            log_directory: None,
            clear_previous_run: true,
            shutdown_timeout_secs: 30,
            max_wait_secs: 600,
            quiescence_samples: 3,
            sample_interval_secs: 5,
            deadlock_samples: 5,
            memory_limit_mb: 2048,
        }
    }
}

/// Global and per-worker-type concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Global permit cap. Clamped to [`GLOBAL_CONCURRENCY_CEILING`].
    pub max_global: usize,
    /// Per-worker-type caps; may sum beyond the global cap, which stays
    /// authoritative.
    pub type_caps: BTreeMap<String, usize>,
    /// Floor the adaptive governor never scales below.
    pub min_worker_concurrency: usize,
    /// Seconds between adaptive sampling rounds.
    pub adaptive_interval_secs: u64,
    /// CPU utilization (percent) above which caps scale down.
    pub cpu_scale_down_pct: f32,
    /// CPU utilization below which caps scale back up.
    pub cpu_scale_up_pct: f32,
    /// Memory utilization above which caps scale down.
    pub memory_scale_down_pct: f32,
    /// Memory utilization below which caps scale back up.
    pub memory_scale_up_pct: f32,
    pub scale_up_factor: f64,
    pub scale_down_factor: f64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        let mut type_caps = BTreeMap::new();
        type_caps.insert("file-analysis".to_string(), 40);
        type_caps.insert("directory-aggregation".to_string(), 10);
        type_caps.insert("relationship-resolution".to_string(), 30);
        type_caps.insert("validation".to_string(), 20);
        type_caps.insert("reconciliation".to_string(), 20);
        type_caps.insert("graph-ingestion".to_string(), 5);
        Self {
            max_global: GLOBAL_CONCURRENCY_CEILING,
            type_caps,
            min_worker_concurrency: 1,
            adaptive_interval_secs: 10,
            cpu_scale_down_pct: 90.0,
            cpu_scale_up_pct: 75.0,
            memory_scale_down_pct: 90.0,
            memory_scale_up_pct: 80.0,
            scale_up_factor: 1.3,
            scale_down_factor: 0.7,
        }
    }
}

/// Circuit breaker tuning shared by all service breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Milliseconds the circuit stays open before the first probe window.
    pub reset_timeout_ms: u64,
    /// Initial delay between half-open probe windows.
    pub base_retry_delay_ms: u64,
    /// Ceiling for the probe-window delay.
    pub max_retry_delay_ms: u64,
    /// Multiplier applied to the probe delay after each open/half-open lap.
    pub retry_multiplier: f64,
    /// Success ratio (in [0,1]) required across the recovery window.
    pub partial_recovery_threshold: f64,
    /// Size of the half-open sliding window of recorded probe outcomes.
    pub partial_recovery_window: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout_ms: 30_000,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            retry_multiplier: 2.0,
            partial_recovery_threshold: 0.5,
            partial_recovery_window: 10,
        }
    }
}

/// Worker retry / timeout tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Hard per-job deadline, seconds.
    pub job_timeout_secs: u64,
    /// Requeue budget per job.
    pub retry_attempts: u32,
    /// Base requeue delay, milliseconds; doubles per attempt with jitter.
    pub retry_delay_ms: u64,
    /// Heartbeat interval for cap reshaping, seconds.
    pub heartbeat_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            job_timeout_secs: 120,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            heartbeat_secs: 5,
        }
    }
}

/// LLM collaborator endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub endpoint: String,
    /// API key value. Populated from `LLM_API_KEY`; never read from the
    /// config file in production deployments.
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: None,
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            temperature: 0.1,
            request_timeout_secs: 90,
        }
    }
}

/// Graph store collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub uri: String,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: None,
            database: "neo4j".to_string(),
        }
    }
}

/// Queue broker collaborator settings. The bundled single-process broker
/// ignores these; deployments binding an external broker consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub db: u8,
    /// Seconds before a reserved-but-silent job returns to waiting.
    pub stall_interval_secs: u64,
    /// Retention ceilings for completed/failed job records.
    pub retention_count: usize,
    pub retention_age_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            stall_interval_secs: 30,
            retention_count: 1_000,
            retention_age_secs: 3_600,
        }
    }
}

/// Discovery filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Extension allowlist, without dots.
    pub allowed_extensions: Vec<String>,
    /// Glob denylist applied to relative paths.
    pub denied_globs: Vec<String>,
    /// Files larger than this are skipped, bytes.
    pub max_file_size: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            allowed_extensions: [
                "js", "jsx", "ts", "tsx", "mjs", "cjs", "py", "rb", "go", "rs", "java", "kt",
                "c", "h", "cpp", "hpp", "cs", "php", "swift", "scala",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            denied_globs: [
                "**/.git/**",
                "**/.svn/**",
                "**/.hg/**",
                "**/node_modules/**",
                "**/target/**",
                "**/dist/**",
                "**/build/**",
                "**/*.min.js",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            max_file_size: 1_048_576,
        }
    }
}

/// Outbox publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub poll_interval_ms: u64,
    pub claim_batch_size: usize,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            claim_batch_size: 50,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineSettings,
    pub concurrency: ConcurrencySettings,
    pub breaker: BreakerSettings,
    pub worker: WorkerSettings,
    pub llm: LlmSettings,
    pub graph: GraphSettings,
    pub broker: BrokerSettings,
    pub discovery: DiscoverySettings,
    pub outbox: OutboxSettings,
    pub reconcile: ReconcilerConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults for absent sections.
    pub fn load(path: &camino::Utf8Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_owned()));
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| ConfigError::InvalidFile {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Apply recognized environment variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let vars: Vec<(String, String)> = OVERRIDABLE_PATHS
            .iter()
            .filter_map(|(name, _)| std::env::var(name).ok().map(|v| ((*name).to_string(), v)))
            .collect();
        self.apply_overrides(vars)
    }

    /// Apply overrides from an explicit `(ENV_NAME, value)` iterator.
    ///
    /// Split out from [`apply_env_overrides`] so tests can exercise the
    /// mapping without mutating process-global environment state.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                "TARGET_DIR" => self.pipeline.target_dir = Utf8PathBuf::from(value),
                "RUN_ID_OVERRIDE" => self.pipeline.run_id_override = Some(value),
                "HIGH_PERFORMANCE_MODE" => {
                    self.pipeline.high_performance = parse_bool(&name, &value)?;
                }
                "LOG_DIRECTORY" => self.pipeline.log_directory = Some(Utf8PathBuf::from(value)),
                "BROKER_HOST" => self.broker.host = value,
                "BROKER_PORT" => self.broker.port = parse_num(&name, &value)?,
                "BROKER_DB" => self.broker.db = parse_num(&name, &value)?,
                "GRAPH_URI" => self.graph.uri = value,
                "GRAPH_USER" => self.graph.user = value,
                "GRAPH_PASSWORD" => self.graph.password = Some(value),
                "GRAPH_DATABASE" => self.graph.database = value,
                "LLM_ENDPOINT" => self.llm.endpoint = value,
                "LLM_API_KEY" => self.llm.api_key = Some(value),
                "FORCE_MAX_CONCURRENCY" => {
                    let requested: usize = parse_num(&name, &value)?;
                    self.concurrency.max_global = requested.min(GLOBAL_CONCURRENCY_CEILING);
                }
                "CPU_THRESHOLD" => {
                    self.concurrency.cpu_scale_down_pct = parse_num(&name, &value)?;
                }
                "MEMORY_THRESHOLD" => {
                    self.concurrency.memory_scale_down_pct = parse_num(&name, &value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate cross-field constraints. Called once at startup; a config
    /// that fails here fails the run (no partial application).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.max_global == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency.max_global".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.concurrency.max_global > GLOBAL_CONCURRENCY_CEILING {
            return Err(ConfigError::InvalidValue {
                key: "concurrency.max_global".to_string(),
                value: self.concurrency.max_global.to_string(),
                reason: format!("hard ceiling is {GLOBAL_CONCURRENCY_CEILING}"),
            });
        }
        let p = self.breaker.partial_recovery_threshold;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::InvalidValue {
                key: "breaker.partial_recovery_threshold".to_string(),
                value: p.to_string(),
                reason: "ratio must be in [0,1]".to_string(),
            });
        }
        if self.breaker.retry_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "breaker.retry_multiplier".to_string(),
                value: self.breaker.retry_multiplier.to_string(),
                reason: "multiplier below 1 would shrink backoff".to_string(),
            });
        }
        if self.concurrency.cpu_scale_up_pct >= self.concurrency.cpu_scale_down_pct {
            return Err(ConfigError::InvalidValue {
                key: "concurrency.cpu_scale_up_pct".to_string(),
                value: self.concurrency.cpu_scale_up_pct.to_string(),
                reason: "scale-up watermark must sit below scale-down".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected a number".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.concurrency.max_global, 100);
        assert_eq!(config.concurrency.type_caps["file-analysis"], 40);
        assert_eq!(config.concurrency.type_caps["graph-ingestion"], 5);
    }

    #[test]
    fn force_max_concurrency_is_hard_capped() {
        let mut config = Config::default();
        config
            .apply_overrides([("FORCE_MAX_CONCURRENCY".to_string(), "500".to_string())])
            .unwrap();
        assert_eq!(config.concurrency.max_global, 100);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_map_to_documented_paths() {
        let mut config = Config::default();
        config
            .apply_overrides([
                ("TARGET_DIR".to_string(), "/src/project".to_string()),
                ("RUN_ID_OVERRIDE".to_string(), "run-42".to_string()),
                ("GRAPH_URI".to_string(), "bolt://graph:7687".to_string()),
                ("LLM_API_KEY".to_string(), "sk-test".to_string()),
                ("HIGH_PERFORMANCE_MODE".to_string(), "true".to_string()),
                ("BROKER_PORT".to_string(), "6380".to_string()),
            ])
            .unwrap();
        assert_eq!(config.pipeline.target_dir, Utf8PathBuf::from("/src/project"));
        assert_eq!(config.pipeline.run_id_override.as_deref(), Some("run-42"));
        assert_eq!(config.graph.uri, "bolt://graph:7687");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert!(config.pipeline.high_performance);
        assert_eq!(config.broker.port, 6380);
    }

    #[test]
    fn recovery_threshold_is_a_ratio() {
        let mut config = Config::default();
        config.breaker.partial_recovery_threshold = 50.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("partial_recovery_threshold"));
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides([("HIGH_PERFORMANCE_MODE".to_string(), "maybe".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codegraph.toml");
        std::fs::write(
            &path,
            r#"
[pipeline]
target_dir = "/repo"
test_mode = true

[breaker]
failure_threshold = 5
"#,
        )
        .unwrap();
        let config =
            Config::load(camino::Utf8Path::from_path(&path).unwrap()).unwrap();
        assert_eq!(config.pipeline.target_dir, Utf8PathBuf::from("/repo"));
        assert!(config.pipeline.test_mode);
        assert_eq!(config.breaker.failure_threshold, 5);
        // Untouched sections keep defaults.
        assert_eq!(config.outbox.poll_interval_ms, 1_000);
        assert_eq!(config.worker.retry_attempts, 3);
    }

    #[test]
    fn overridable_paths_table_covers_all_spec_vars() {
        let names: Vec<&str> = OVERRIDABLE_PATHS.iter().map(|(n, _)| *n).collect();
        for required in [
            "TARGET_DIR",
            "RUN_ID_OVERRIDE",
            "BROKER_HOST",
            "GRAPH_URI",
            "LLM_ENDPOINT",
            "FORCE_MAX_CONCURRENCY",
            "LOG_DIRECTORY",
        ] {
            assert!(names.contains(&required), "missing {required}");
        }
    }
}
