use maestro_core::{MaestroError, MaestroResult, Severity};
use serde::{Deserialize, Serialize};

/// Tunables for the orchestration engine.
///
/// Every field has a serde default, so a partial TOML file (or an empty one)
/// yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global bound on concurrently running sub-tasks, across all tasks.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Watchdog budget per running sub-task, in milliseconds.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Executor attempts per dispatch (including the first).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between executor attempts; scaled by the attempt number.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Minimum interval between streamed progress events.
    #[serde(default = "default_stream_update_interval_ms")]
    pub stream_update_interval_ms: u64,

    /// Delay before the dispatch loop re-polls when nothing is eligible.
    #[serde(default = "default_dispatch_repoll_ms")]
    pub dispatch_repoll_ms: u64,

    /// Automatic resubmissions allowed per (task, sub-task) pair.
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,

    /// Base delay before an automatic resubmission; scaled by the retry count.
    #[serde(default = "default_auto_retry_delay_ms")]
    pub auto_retry_delay_ms: u64,

    /// Severity at or above which human intervention is required.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: Severity,

    /// Escalate high/critical exceptions automatically instead of waiting.
    #[serde(default = "default_true")]
    pub auto_escalate: bool,

    /// Pause the whole task when a critical exception needs intervention.
    #[serde(default = "default_true")]
    pub pause_on_critical: bool,

    /// Allow automatic retry of timed-out sub-tasks.
    #[serde(default = "default_true")]
    pub auto_retry_on_timeout: bool,

    /// Fixed delay before an automatic collaboration reply is sent.
    #[serde(default = "default_reply_delay_ms")]
    pub reply_delay_ms: u64,

    /// Grace period before a closed collaboration session is purged.
    #[serde(default = "default_session_purge_ms")]
    pub session_purge_ms: u64,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_task_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_stream_update_interval_ms() -> u64 {
    100
}

fn default_dispatch_repoll_ms() -> u64 {
    500
}

fn default_max_auto_retries() -> u32 {
    2
}

fn default_auto_retry_delay_ms() -> u64 {
    1000
}

fn default_escalation_threshold() -> Severity {
    Severity::High
}

fn default_true() -> bool {
    true
}

fn default_reply_delay_ms() -> u64 {
    500
}

fn default_session_purge_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            stream_update_interval_ms: default_stream_update_interval_ms(),
            dispatch_repoll_ms: default_dispatch_repoll_ms(),
            max_auto_retries: default_max_auto_retries(),
            auto_retry_delay_ms: default_auto_retry_delay_ms(),
            escalation_threshold: default_escalation_threshold(),
            auto_escalate: default_true(),
            pause_on_critical: default_true(),
            auto_retry_on_timeout: default_true(),
            reply_delay_ms: default_reply_delay_ms(),
            session_purge_ms: default_session_purge_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(input: &str) -> MaestroResult<Self> {
        toml::from_str(input).map_err(|e| MaestroError::Config(format!("invalid config: {e}")))
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> MaestroResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
