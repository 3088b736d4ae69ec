use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub log_level: String,
    pub default_shell: Option<String>,
    pub shell_args: Vec<String>,

    // Session pool
    pub max_sessions: usize,
    pub output_buffer_chunks: usize,
    pub attention_window: usize,
    pub attention_sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub session_retention: Duration,

    // Resource monitor
    pub session_memory_budget_bytes: u64,
    pub cpu_alert_fraction: f64,
    pub memory_pressure_threshold: f64,
    pub sample_interval: Duration,
    pub health_failure_limit: u32,

    // Capability providers
    pub provider_dirs: Vec<PathBuf>,
    pub provider_idle_timeout: Duration,
    pub provider_start_retries: u32,
    pub provider_cooldown: Duration,
    pub provider_startup_timeout: Duration,

    // Conversational bridge
    pub dispatch_timeout: Duration,
    pub dispatch_retries: u32,
    pub conversation_window: usize,
    pub conversation_history: usize,
    pub echo_dispatch_output: bool,

    // Advisory state cache and audit log
    pub state_dir: Option<PathBuf>,
    pub audit_log_max_size_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_shell: None,
            shell_args: Vec::new(),
            max_sessions: 50,
            output_buffer_chunks: 1000,
            attention_window: 3,
            attention_sweep_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(5),
            session_retention: Duration::from_secs(3600),
            session_memory_budget_bytes: 2 * 1024 * 1024 * 1024,
            cpu_alert_fraction: 0.9,
            memory_pressure_threshold: 0.95,
            sample_interval: Duration::from_secs(2),
            health_failure_limit: 3,
            provider_dirs: Vec::new(),
            provider_idle_timeout: Duration::from_secs(600),
            provider_start_retries: 2,
            provider_cooldown: Duration::from_secs(60),
            provider_startup_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(2),
            dispatch_retries: 1,
            conversation_window: 5,
            conversation_history: 20,
            echo_dispatch_output: false,
            state_dir: None,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    shellexpand::full(path_str)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| anyhow::anyhow!("Failed to expand tilde for path '{}': {}", path_str, e))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        let defaults = Config::default();

        let default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());
        let shell_args = std::env::var("SHELL_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let max_sessions = env_parse("MAX_SESSIONS", defaults.max_sessions)?;
        if max_sessions == 0 {
            anyhow::bail!("MAX_SESSIONS must be at least 1");
        }
        let output_buffer_chunks = env_parse("OUTPUT_BUFFER_CHUNKS", defaults.output_buffer_chunks)?.max(1);
        let attention_window = env_parse("ATTENTION_WINDOW", defaults.attention_window)?.max(1);

        let session_memory_budget_bytes = env_parse(
            "SESSION_MEMORY_BUDGET_MB",
            defaults.session_memory_budget_bytes / (1024 * 1024),
        )? * 1024
            * 1024;

        let cpu_alert_fraction = env_parse("CPU_ALERT_FRACTION", defaults.cpu_alert_fraction)?;
        let memory_pressure_threshold = env_parse("MEMORY_PRESSURE_THRESHOLD", defaults.memory_pressure_threshold)?;
        if !(0.0..=1.0).contains(&memory_pressure_threshold) {
            anyhow::bail!("MEMORY_PRESSURE_THRESHOLD must be within [0, 1], got {}", memory_pressure_threshold);
        }

        let provider_dirs: Vec<PathBuf> = match std::env::var("PROVIDER_DIRS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(expand_tilde)
                .filter_map(Result::ok)
                .collect(),
            _ => vec![expand_tilde("~/.config/cctm/providers")?],
        };
        for dir in provider_dirs.iter().filter(|d| !d.is_dir()) {
            warn!(path = %dir.display(), "Provider directory does not exist; discovery will skip it");
        }

        let state_dir = match std::env::var("STATE_DIR") {
            Ok(raw) if raw.eq_ignore_ascii_case("none") => None,
            Ok(raw) if !raw.trim().is_empty() => Some(expand_tilde(raw.trim())?),
            _ => Some(expand_tilde("~/.local/state/cctm")?),
        };

        let audit_log_max_size_bytes = env_parse("AUDIT_LOG_MAX_SIZE_MB", 10u64)? * 1024 * 1024;

        let echo_dispatch_output = env_parse("ECHO_DISPATCH_OUTPUT", defaults.echo_dispatch_output)?;

        Ok(Config {
            log_level,
            default_shell,
            shell_args,
            max_sessions,
            output_buffer_chunks,
            attention_window,
            attention_sweep_interval: env_millis("ATTENTION_SWEEP_MS", defaults.attention_sweep_interval)?,
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            startup_timeout: env_millis("STARTUP_TIMEOUT_MS", defaults.startup_timeout)?,
            session_retention: env_secs("SESSION_RETENTION_SECS", defaults.session_retention)?,
            session_memory_budget_bytes,
            cpu_alert_fraction,
            memory_pressure_threshold,
            sample_interval: env_millis("SAMPLE_INTERVAL_MS", defaults.sample_interval)?,
            health_failure_limit: env_parse("HEALTH_FAILURE_LIMIT", defaults.health_failure_limit)?.max(1),
            provider_dirs,
            provider_idle_timeout: env_secs("PROVIDER_IDLE_TIMEOUT_SECS", defaults.provider_idle_timeout)?,
            provider_start_retries: env_parse("PROVIDER_START_RETRIES", defaults.provider_start_retries)?,
            provider_cooldown: env_secs("PROVIDER_COOLDOWN_SECS", defaults.provider_cooldown)?,
            provider_startup_timeout: env_millis("PROVIDER_STARTUP_TIMEOUT_MS", defaults.provider_startup_timeout)?,
            dispatch_timeout: env_millis("DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout)?,
            dispatch_retries: env_parse("DISPATCH_RETRIES", defaults.dispatch_retries)?,
            conversation_window: env_parse("CONVERSATION_WINDOW", defaults.conversation_window)?,
            conversation_history: env_parse("CONVERSATION_HISTORY", defaults.conversation_history)?.max(1),
            echo_dispatch_output,
            state_dir,
            audit_log_max_size_bytes,
        })
    }

    /// Path of the audit log for command-surface calls, if a state directory is configured.
    pub fn audit_log_file(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("logs").join("tool_calls.log"))
    }
}
