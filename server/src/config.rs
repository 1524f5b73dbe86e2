//! Configuration management for the coordinator and worker binaries.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Both binaries read the same [`Config`]; each uses the sections it needs.

use crate::scanner::CommandScanner;
use prscan_core::{ConsumerName, GroupName, StreamName, WorkerIdentity};
use prscan_runtime::{DispatcherConfig, PollConfig, PoisonPolicy};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// Environment variable
        var: &'static str,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// A variable the binary cannot run without is missing
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis configuration (request store, stream log, completion ledger)
    pub redis: RedisConfig,
    /// `PostgreSQL` dead-letter database; dead letters are disabled without it
    pub database_url: Option<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Coordinator (dispatch and callbacks) configuration
    pub coordinator: CoordinatorConfig,
    /// Worker loop configuration
    pub worker: WorkerConfig,
}

/// Redis configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key (empty by default)
    pub key_prefix: String,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Metrics server port (Prometheus scraping)
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address workers post completions to
    pub callback_url: String,
    /// Streams used when a trigger names none
    pub default_streams: Vec<StreamName>,
    /// Request lifetime in seconds
    pub request_ttl: u64,
    /// Retention sweep interval in seconds
    pub sweep_interval: u64,
    /// Delete a request once every stream reported
    pub retire_on_completion: bool,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stream this worker consumes
    pub stream: StreamName,
    /// Consumer group
    pub group: GroupName,
    /// This consumer's name
    pub consumer: ConsumerName,
    /// Identity completions are reported under
    pub identity: WorkerIdentity,
    /// Longest wait for new messages, in milliseconds
    pub block_timeout_ms: u64,
    /// Messages read per iteration
    pub batch_size: usize,
    /// Idle time before another consumer's message is reclaimed, in seconds
    pub reclaim_min_idle: u64,
    /// Deliveries before a message is treated as poison
    pub max_deliveries: u32,
    /// What happens to poison messages
    pub poison_policy: PoisonPolicy,
    /// External scan command (program and arguments, whitespace separated)
    pub scan_command: Option<String>,
    /// Scan time limit in seconds; 0 for none
    pub scan_timeout: u64,
    /// Directory scratch workspaces are created under
    pub workspace_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from any variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but unparsable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let stream = vars
            .get("STREAM_NAME")
            .unwrap_or_else(|| "worker-kics".to_string());
        let consumer = vars
            .get("CONSUMER_NAME")
            .or_else(|| vars.get("HOSTNAME"))
            .unwrap_or_else(|| format!("{stream}-{}", std::process::id()));
        let identity = vars.get("WORKER_IDENTITY").unwrap_or_else(|| stream.clone());

        Ok(Self {
            redis: RedisConfig {
                url: vars
                    .get("REDIS_URL")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
                key_prefix: vars.get("REDIS_KEY_PREFIX").unwrap_or_default(),
            },
            database_url: vars.get("DATABASE_URL"),
            server: ServerConfig {
                host: vars.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: vars.parse("PORT", 8000)?,
                metrics_port: vars.parse("METRICS_PORT", 9090)?,
                shutdown_timeout: vars.parse("SHUTDOWN_TIMEOUT_SECS", 30)?,
            },
            coordinator: CoordinatorConfig {
                callback_url: vars
                    .get("CALLBACK_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:8000/callbacks".to_string()),
                default_streams: vars
                    .get("DEFAULT_STREAMS")
                    .map(|s| parse_streams(&s))
                    .unwrap_or_default(),
                request_ttl: vars.parse("REQUEST_TTL_SECS", 24 * 60 * 60)?,
                sweep_interval: vars.parse("SWEEP_INTERVAL_SECS", 60)?,
                retire_on_completion: vars.flag("RETIRE_ON_COMPLETION")?,
            },
            worker: WorkerConfig {
                stream: StreamName::new(stream),
                group: vars
                    .get("CONSUMER_GROUP")
                    .map_or_else(GroupName::workers, GroupName::new),
                consumer: ConsumerName::new(consumer),
                identity: WorkerIdentity::new(identity),
                block_timeout_ms: vars.parse("BLOCK_TIMEOUT_MS", 5000)?,
                batch_size: vars.parse("BATCH_SIZE", 1)?,
                reclaim_min_idle: vars.parse("RECLAIM_MIN_IDLE_SECS", 60)?,
                max_deliveries: vars.parse("MAX_DELIVERIES", 5)?,
                poison_policy: vars.parse("POISON_POLICY", PoisonPolicy::DeadLetter)?,
                scan_command: vars.get("SCAN_COMMAND"),
                scan_timeout: vars.parse("SCAN_TIMEOUT_SECS", 0)?,
                workspace_dir: vars.get("WORKSPACE_DIR").map(PathBuf::from),
            },
        })
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Address the metrics endpoint binds to.
    #[must_use]
    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.metrics_port)
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

impl CoordinatorConfig {
    /// Dispatcher settings.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.callback_url.clone())
            .with_request_ttl(Duration::from_secs(self.request_ttl))
    }

    /// Retention sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

impl WorkerConfig {
    /// Worker loop settings.
    #[must_use]
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::builder()
            .block_timeout(Duration::from_millis(self.block_timeout_ms))
            .batch_size(self.batch_size)
            .reclaim_min_idle(Duration::from_secs(self.reclaim_min_idle))
            .max_deliveries(self.max_deliveries)
            .poison_policy(self.poison_policy)
            .build()
    }

    /// Scanner running `SCAN_COMMAND`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no scan command is configured.
    pub fn scanner(&self) -> Result<CommandScanner, ConfigError> {
        let scanner = self
            .scan_command
            .as_deref()
            .and_then(CommandScanner::from_command_line)
            .ok_or(ConfigError::Missing("SCAN_COMMAND"))?;
        Ok(match self.scan_timeout {
            0 => scanner,
            secs => scanner.with_timeout(Duration::from_secs(secs)),
        })
    }
}

/// Comma-separated stream names, blanks dropped.
fn parse_streams(raw: &str) -> Vec<StreamName> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(StreamName::new)
        .collect()
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, var: &'static str) -> Result<bool, ConfigError> {
        match self.get(var).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected true or false".to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.coordinator.request_ttl, 86_400);
        assert!(!config.coordinator.retire_on_completion);
        assert!(config.coordinator.default_streams.is_empty());
        assert_eq!(config.worker.group, GroupName::workers());
        assert_eq!(config.worker.identity.as_str(), "worker-kics");
        assert_eq!(config.worker.poison_policy, PoisonPolicy::DeadLetter);

        let poll = config.worker.poll_config();
        assert_eq!(poll.block_timeout, Duration::from_secs(5));
        assert_eq!(poll.max_deliveries, 5);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("PORT", "9000"),
            ("DEFAULT_STREAMS", "worker-kics, worker-blackduck,,"),
            ("RETIRE_ON_COMPLETION", "yes"),
            ("STREAM_NAME", "worker-blackduck"),
            ("CONSUMER_NAME", "pod-7"),
            ("WORKER_IDENTITY", "blackduck-worker"),
            ("MAX_DELIVERIES", "3"),
            ("POISON_POLICY", "keep_retrying"),
            ("BLOCK_TIMEOUT_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.coordinator.default_streams,
            vec![StreamName::new("worker-kics"), StreamName::new("worker-blackduck")]
        );
        assert!(config.coordinator.retire_on_completion);
        assert_eq!(config.worker.consumer.as_str(), "pod-7");
        assert_eq!(config.worker.identity.as_str(), "blackduck-worker");

        let poll = config.worker.poll_config();
        assert_eq!(poll.max_deliveries, 3);
        assert_eq!(poll.poison_policy, PoisonPolicy::KeepRetrying);
        assert_eq!(poll.block_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));

        let err = load(&[("POISON_POLICY", "shrug")]).unwrap_err();
        assert!(err.to_string().contains("POISON_POLICY"));

        let err = load(&[("RETIRE_ON_COMPLETION", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "RETIRE_ON_COMPLETION", .. }));
    }

    #[test]
    fn worker_needs_a_scan_command() {
        let config = load(&[]).unwrap();
        assert_eq!(
            config.worker.scanner().unwrap_err(),
            ConfigError::Missing("SCAN_COMMAND")
        );

        let config = load(&[("SCAN_COMMAND", "kics scan"), ("SCAN_TIMEOUT_SECS", "600")]).unwrap();
        assert!(config.worker.scanner().is_ok());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("PORT", "  "), ("DATABASE_URL", "")]).unwrap();
        assert_eq!(config.server.port, 8000);
        assert!(config.database_url.is_none());
    }
}
