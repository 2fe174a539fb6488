//! Worker configuration
//!
//! Loaded once from the environment at startup, or set dynamically in tests.

use std::sync::OnceLock;
use tracing::warn;

/// Judge worker configuration
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Interpreter binary used for script submissions (default: "python3")
    pub python_bin: String,
    /// Optional wrapper command prepended to interpreter invocations,
    /// e.g. ["unshare", "-rn"] where the platform provides it
    pub sandbox_wrapper: Vec<String>,
    /// Maximum submitted code length in characters (default: 10,000)
    pub max_code_len: usize,
    /// Default wall-clock budget for a submission in milliseconds
    pub default_time_budget_ms: u64,
    /// Wall-clock budget for the compile-only syntax check in milliseconds
    pub syntax_check_timeout_ms: u64,
    /// Docker image for SQL sandbox instances
    pub sql_image: String,
    /// Seconds to wait for a fresh SQL instance to accept connections
    pub sql_startup_timeout_secs: u64,
    /// Per-statement timeout for learner queries in milliseconds
    pub sql_statement_timeout_ms: u64,
    /// Instances older than this are reaped by the periodic sweep
    pub sweep_max_age_secs: u64,
    /// Seconds between sweep passes
    pub sweep_interval_secs: u64,
    /// Rate limit: submissions allowed per window
    pub rate_max_requests: usize,
    /// Rate limit: window length in seconds
    pub rate_window_secs: u64,
    /// Rate limit: cool-down imposed after a denial, in seconds
    pub rate_cooldown_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".into(),
            sandbox_wrapper: Vec::new(),
            max_code_len: 10_000,
            default_time_budget_ms: 30_000,
            syntax_check_timeout_ms: 5_000,
            sql_image: "sql_sandbox:latest".into(),
            sql_startup_timeout_secs: 60,
            sql_statement_timeout_ms: 30_000,
            sweep_max_age_secs: 2 * 3600,
            sweep_interval_secs: 600,
            rate_max_requests: 10,
            rate_window_secs: 60,
            rate_cooldown_secs: 300,
        }
    }
}

impl JudgeConfig {
    /// Build a config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let parse_u64 = |key: &str, default: u64| -> u64 {
            match std::env::var(key) {
                Ok(v) => v.parse().unwrap_or_else(|_| {
                    warn!("Invalid {}={}, using default {}", key, v, default);
                    default
                }),
                Err(_) => default,
            }
        };

        let sandbox_wrapper = std::env::var("SANDBOX_WRAPPER")
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        Self {
            python_bin: std::env::var("PYTHON_BIN").unwrap_or(defaults.python_bin),
            sandbox_wrapper,
            max_code_len: parse_u64("MAX_CODE_LEN", defaults.max_code_len as u64) as usize,
            default_time_budget_ms: parse_u64("TIME_BUDGET_MS", defaults.default_time_budget_ms),
            syntax_check_timeout_ms: parse_u64(
                "SYNTAX_CHECK_TIMEOUT_MS",
                defaults.syntax_check_timeout_ms,
            ),
            sql_image: std::env::var("SQL_SANDBOX_IMAGE").unwrap_or(defaults.sql_image),
            sql_startup_timeout_secs: parse_u64(
                "SQL_STARTUP_TIMEOUT_SECS",
                defaults.sql_startup_timeout_secs,
            ),
            sql_statement_timeout_ms: parse_u64(
                "SQL_STATEMENT_TIMEOUT_MS",
                defaults.sql_statement_timeout_ms,
            ),
            sweep_max_age_secs: parse_u64("SWEEP_MAX_AGE_SECS", defaults.sweep_max_age_secs),
            sweep_interval_secs: parse_u64("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            rate_max_requests: parse_u64("RATE_MAX_REQUESTS", defaults.rate_max_requests as u64)
                as usize,
            rate_window_secs: parse_u64("RATE_WINDOW_SECS", defaults.rate_window_secs),
            rate_cooldown_secs: parse_u64("RATE_COOLDOWN_SECS", defaults.rate_cooldown_secs),
        }
    }
}

/// Global worker configuration
static JUDGE_CONFIG: OnceLock<JudgeConfig> = OnceLock::new();

/// Initialize worker configuration from the environment
pub fn init_config() -> anyhow::Result<()> {
    JUDGE_CONFIG
        .set(JudgeConfig::from_env())
        .map_err(|_| anyhow::anyhow!("Judge configuration already initialized"))?;

    Ok(())
}

/// Get worker configuration
pub fn get_config() -> &'static JudgeConfig {
    JUDGE_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<JudgeConfig> = OnceLock::new();

        warn!("Judge configuration not initialized, using default");
        DEFAULT.get_or_init(JudgeConfig::default)
    })
}
