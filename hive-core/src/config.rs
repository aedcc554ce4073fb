//! Runtime configuration and the on-disk layout.
//!
//! Everything lives under the hive home (default `~/.hive`, overridable
//! with `HIVE_HOME`). Env overrides are read once through `dotenvy` so a
//! local `.env` behaves the same as real environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::event::bus::DEFAULT_BUFFER_CAPACITY;
use crate::judge::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::state::IsolationPolicy;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Root of the persistence layout.
    pub home: PathBuf,
    /// Per-subscriber event queue depth.
    pub event_buffer_capacity: usize,
    /// Opt-in JSONL event debug log.
    pub event_log_enabled: bool,
    /// Max concurrent LLM completions; excess callers queue FIFO.
    pub llm_concurrency: usize,
    /// Per-streaming-turn provider timeout.
    pub llm_request_timeout: Duration,
    pub judge_confidence_threshold: f64,
    /// Health judge inspection cadence.
    pub health_interval: Duration,
    /// SSE keepalive comment cadence.
    pub sse_keepalive: Duration,
    /// Default isolation for new sessions.
    pub isolation: IsolationPolicy,
    /// Checkpoint TTL; `None` keeps checkpoints until deleted.
    pub checkpoint_ttl: Option<Duration>,
    /// Reserved event types stay silent until their emitters land.
    pub enable_reserved_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            event_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            event_log_enabled: false,
            llm_concurrency: 4,
            llm_request_timeout: crate::llm::DEFAULT_REQUEST_TIMEOUT,
            judge_confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            health_interval: Duration::from_secs(30),
            sse_keepalive: Duration::from_secs(15),
            isolation: IsolationPolicy::Shared,
            checkpoint_ttl: None,
            enable_reserved_events: false,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".hive")
}

impl RuntimeConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(home) = std::env::var("HIVE_HOME") {
            config.home = PathBuf::from(home);
        }
        if let Some(capacity) = env_parse::<usize>("HIVE_EVENT_BUFFER") {
            config.event_buffer_capacity = capacity.max(1);
        }
        if let Ok(flag) = std::env::var("HIVE_EVENT_LOG") {
            config.event_log_enabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(concurrency) = env_parse::<usize>("HIVE_LLM_CONCURRENCY") {
            config.llm_concurrency = concurrency.max(1);
        }
        if let Some(seconds) = env_parse::<u64>("HIVE_LLM_TIMEOUT_SECS") {
            config.llm_request_timeout = Duration::from_secs(seconds);
        }
        if let Some(threshold) = env_parse::<f64>("HIVE_JUDGE_CONFIDENCE") {
            config.judge_confidence_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(seconds) = env_parse::<u64>("HIVE_HEALTH_INTERVAL_SECS") {
            config.health_interval = Duration::from_secs(seconds.max(1));
        }
        if let Some(seconds) = env_parse::<u64>("HIVE_CHECKPOINT_TTL_SECS") {
            config.checkpoint_ttl = Some(Duration::from_secs(seconds));
        }
        config
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }

    pub fn queen_dir(&self, session_id: &str) -> PathBuf {
        self.home.join("queen").join("session").join(session_id)
    }

    pub fn agent_sessions_dir(&self, agent: &str, workspace_id: &str) -> PathBuf {
        self.home
            .join("agents")
            .join(agent)
            .join("sessions")
            .join(workspace_id)
    }

    pub fn event_logs_dir(&self) -> PathBuf {
        self.home.join("event_logs")
    }

    /// Path for a new event debug log, stamped to the second.
    pub fn event_log_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        self.event_logs_dir().join(format!("{stamp}.jsonl"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_home() {
        let config = RuntimeConfig {
            home: PathBuf::from("/tmp/hive-test"),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.checkpoints_dir(),
            PathBuf::from("/tmp/hive-test/checkpoints")
        );
        assert_eq!(
            config.queen_dir("s1"),
            PathBuf::from("/tmp/hive-test/queen/session/s1")
        );
        assert!(config
            .event_log_path()
            .to_string_lossy()
            .ends_with(".jsonl"));
    }
}
