/// Configuration for the synchronization engine and its HTTP server.
///
/// Values come from the environment, with defaults that work for local
/// development. The CLI layers its flags on top of [`ServerConfig::from_env`].
///
/// | Variable | Default |
/// |---|---|
/// | `SCORECARD_DB_PATH` (or `DB_PATH`) | `golf.db` |
/// | `SCORECARD_BIND` | `0.0.0.0:8080` |
/// | `SCORECARD_MAX_WAIT_SECS` | `30` (also the ceiling) |
/// | `SCORECARD_INBOX_CAPACITY` | `10` |
/// | `SCORECARD_DELETE_POLICY` | `unconditional` |
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on how long a single long-poll may block.
pub const MAX_WAIT_CEILING: Duration = Duration::from_secs(30);

/// Default per-subscriber inbox size.
pub const DEFAULT_INBOX_CAPACITY: usize = 10;

/// Default database file.
pub const DEFAULT_DB_PATH: &str = "golf.db";

/// Default HTTP bind address.
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// How deletes interact with the optimistic-concurrency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Deletes always win, regardless of `base_updated_at`.
    #[default]
    Unconditional,
    /// Deletes obey the same `updated_at <= base_updated_at` gate as upserts.
    Guarded,
}

impl FromStr for DeletePolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unconditional" => Ok(DeletePolicy::Unconditional),
            "guarded" => Ok(DeletePolicy::Guarded),
            other => Err(SyncError::Config(format!(
                "unknown delete policy '{}' (expected 'unconditional' or 'guarded')",
                other
            ))),
        }
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::Unconditional => f.write_str("unconditional"),
            DeletePolicy::Guarded => f.write_str("guarded"),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Longest wait a long-poll may request; never above [`MAX_WAIT_CEILING`]
    pub max_wait: Duration,
    /// Bounded inbox size for each subscriber
    pub inbox_capacity: usize,
    pub delete_policy: DeletePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_wait: MAX_WAIT_CEILING,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load from process environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("SCORECARD_DB_PATH").or_else(|| lookup("DB_PATH")) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup("SCORECARD_MAX_WAIT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| SyncError::Config(format!("SCORECARD_MAX_WAIT_SECS: {}", e)))?;
            config.max_wait = Duration::from_secs(secs).min(MAX_WAIT_CEILING);
        }
        if let Some(capacity) = lookup("SCORECARD_INBOX_CAPACITY") {
            let capacity: usize = capacity
                .trim()
                .parse()
                .map_err(|e| SyncError::Config(format!("SCORECARD_INBOX_CAPACITY: {}", e)))?;
            if capacity == 0 {
                return Err(SyncError::Config(
                    "SCORECARD_INBOX_CAPACITY must be at least 1".to_string(),
                ));
            }
            config.inbox_capacity = capacity;
        }
        if let Some(policy) = lookup("SCORECARD_DELETE_POLICY") {
            config.delete_policy = policy.parse()?;
        }

        Ok(config)
    }

    /// Use a different database file.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Use a different delete policy.
    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Use a different inbox size (at least 1).
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Turn a requested wait in seconds into the effective long-poll timeout.
    ///
    /// Negative requests mean "do not wait"; large ones are capped.
    pub fn clamp_wait(&self, requested_secs: i64) -> Duration {
        if requested_secs <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(requested_secs as u64).min(self.max_wait.min(MAX_WAIT_CEILING))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub sync: SyncConfig,
}

impl ServerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let bind = lookup("SCORECARD_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse()
            .map_err(|e| SyncError::Config(format!("SCORECARD_BIND '{}': {}", bind, e)))?;
        Ok(Self {
            bind,
            sync: SyncConfig::from_lookup(lookup)?,
        })
    }
}
