//! Configuration for the state server.
//!
//! Values come from an optional JSON file named by `LODESTAR_CONFIG_FILE`,
//! then individual `LODESTAR_*` environment variables override them. Every
//! field has a default, so an empty file (or none at all) plus a database URL
//! and one encryption key is a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lodestar_core::Error;

use crate::Result;
use crate::convergence::{ConvergenceConfig, CrashRestartPolicy};
use crate::hub::DEFAULT_SUBSCRIBER_BUFFER;
use crate::store::RetryPolicy;

/// Environment variable naming the JSON config file.
pub const CONFIG_FILE_ENV: &str = "LODESTAR_CONFIG_FILE";

/// Serde adapter storing a [`Duration`] as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as seconds.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Deserializes from seconds.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error for anything but an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Which record store backs the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Relational store at `database_url`.
    #[default]
    Sql,
    /// Legacy key-value store.
    Kv,
}

impl BackendKind {
    /// Returns the config spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Kv => "kv",
        }
    }
}

/// Configuration for the state server.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Record store backend.
    pub backend: BackendKind,

    /// Connection URL for the SQL backend (`sqlite:`, `postgres://`,
    /// `mysql://`). Must be unset for the key-value backend.
    pub database_url: Option<String>,

    /// SQL connection pool size.
    pub max_open_connections: u32,

    /// Deadline for one store operation, deadlock retries included.
    #[serde(with = "duration_secs")]
    pub store_operation_timeout: Duration,

    /// Pause between convergence cycles.
    #[serde(with = "duration_secs")]
    pub convergence_interval: Duration,

    /// Whether this instance runs the convergence loop while leader.
    pub convergence_enabled: bool,

    /// Concurrent store calls a convergence cycle may make.
    pub convergence_workers: usize,

    /// Age after which pending tasks are re-dispatched and completed tasks
    /// have their callback retried.
    #[serde(with = "duration_secs")]
    pub kick_task_duration: Duration,

    /// Age after which a pending task is failed.
    #[serde(with = "duration_secs")]
    pub expire_pending_task_duration: Duration,

    /// Age after which a completed task is deleted.
    #[serde(with = "duration_secs")]
    pub expire_completed_task_duration: Duration,

    /// Age after which an unclaimed instance is offered for placement again.
    #[serde(with = "duration_secs")]
    pub stale_unclaimed_duration: Duration,

    /// Restart schedule for crashed instances.
    pub crash_policy: CrashRestartPolicy,

    /// Workers delivering task completion callbacks.
    pub task_callback_workers: usize,

    /// Callbacks queued before submission waits.
    pub task_callback_queue_capacity: usize,

    /// Name of the leadership lock.
    pub lock_key: String,

    /// Identity recorded in the lock. Defaults to a random id per process.
    pub instance_id: Option<String>,

    /// Lease length of the leadership lock.
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,

    /// Pause between lock acquisition attempts and renewals.
    #[serde(with = "duration_secs")]
    pub lock_retry_interval: Duration,

    /// Encryption keys as `label:phrase`.
    pub encryption_keys: Vec<String>,

    /// Label of the key new blobs are encrypted with.
    pub active_key_label: String,

    /// Events buffered per hub subscriber before it is dropped.
    pub hub_subscriber_buffer: usize,

    /// Base URL of the auctioneer. Work is recorded in memory when unset.
    pub auctioneer_url: Option<String>,

    /// Cell ids treated as present.
    pub static_cells: Vec<String>,

    /// Port for the health and trigger endpoints.
    pub listen_port: u16,
}

impl std::fmt::Debug for StateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key_labels: Vec<&str> = self
            .encryption_keys
            .iter()
            .map(|spec| spec.split_once(':').map_or("<malformed>", |(label, _)| label))
            .collect();
        f.debug_struct("StateConfig")
            .field("backend", &self.backend)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_open_connections", &self.max_open_connections)
            .field("store_operation_timeout", &self.store_operation_timeout)
            .field("convergence_interval", &self.convergence_interval)
            .field("convergence_enabled", &self.convergence_enabled)
            .field("convergence_workers", &self.convergence_workers)
            .field("kick_task_duration", &self.kick_task_duration)
            .field(
                "expire_pending_task_duration",
                &self.expire_pending_task_duration,
            )
            .field(
                "expire_completed_task_duration",
                &self.expire_completed_task_duration,
            )
            .field("stale_unclaimed_duration", &self.stale_unclaimed_duration)
            .field("crash_policy", &self.crash_policy)
            .field("task_callback_workers", &self.task_callback_workers)
            .field(
                "task_callback_queue_capacity",
                &self.task_callback_queue_capacity,
            )
            .field("lock_key", &self.lock_key)
            .field("instance_id", &self.instance_id)
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_retry_interval", &self.lock_retry_interval)
            .field("encryption_keys", &key_labels)
            .field("active_key_label", &self.active_key_label)
            .field("hub_subscriber_buffer", &self.hub_subscriber_buffer)
            .field("auctioneer_url", &self.auctioneer_url)
            .field("static_cells", &self.static_cells)
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sql,
            database_url: None,
            max_open_connections: 20,
            store_operation_timeout: Duration::from_secs(30),
            convergence_interval: Duration::from_secs(30),
            convergence_enabled: true,
            convergence_workers: 20,
            kick_task_duration: Duration::from_secs(30),
            expire_pending_task_duration: Duration::from_secs(30 * 60),
            expire_completed_task_duration: Duration::from_secs(2 * 60),
            stale_unclaimed_duration: Duration::from_secs(30),
            crash_policy: CrashRestartPolicy::default(),
            task_callback_workers: 1000,
            task_callback_queue_capacity: 1000,
            lock_key: "lodestar".to_string(),
            instance_id: None,
            lock_ttl: Duration::from_secs(15),
            lock_retry_interval: Duration::from_secs(5),
            encryption_keys: Vec::new(),
            active_key_label: String::new(),
            hub_subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            auctioneer_url: None,
            static_cells: Vec::new(),
            listen_port: 8889,
        }
    }
}

impl StateConfig {
    /// Loads the JSON file named by `LODESTAR_CONFIG_FILE`, if set, then
    /// applies `LODESTAR_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or parsed,
    /// or an override does not parse.
    pub fn load() -> Result<Self> {
        let mut config = match env_string(&|name| std::env::var(name).ok(), CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or parsed.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("{CONFIG_FILE_ENV} failed to read {path}: {e}")))?;
        Self::from_json(&raw)
            .map_err(|e| Error::configuration(format!("{CONFIG_FILE_ENV} {path}: {e}")))
    }

    /// Parses a JSON config document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the document does not parse.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::configuration(format!("invalid config: {e}")))
    }

    /// Applies `LODESTAR_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the variable that failed to
    /// parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = &lookup;

        if let Some(backend) = env_string(env, "LODESTAR_BACKEND") {
            self.backend = parse_backend("LODESTAR_BACKEND", &backend)?;
        }
        if let Some(url) = env_string(env, "LODESTAR_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(max) = env_u32(env, "LODESTAR_MAX_OPEN_CONNECTIONS")? {
            self.max_open_connections = max;
        }
        if let Some(secs) = env_u64(env, "LODESTAR_STORE_OPERATION_TIMEOUT_SECS")? {
            self.store_operation_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_u64(env, "LODESTAR_CONVERGENCE_INTERVAL_SECS")? {
            self.convergence_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_bool(env, "LODESTAR_CONVERGENCE_ENABLED")? {
            self.convergence_enabled = enabled;
        }
        if let Some(workers) = env_usize(env, "LODESTAR_CONVERGENCE_WORKERS")? {
            self.convergence_workers = workers;
        }
        if let Some(secs) = env_u64(env, "LODESTAR_KICK_TASK_DURATION_SECS")? {
            self.kick_task_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_EXPIRE_PENDING_TASK_DURATION_SECS")? {
            self.expire_pending_task_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_EXPIRE_COMPLETED_TASK_DURATION_SECS")? {
            self.expire_completed_task_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_STALE_UNCLAIMED_DURATION_SECS")? {
            self.stale_unclaimed_duration = Duration::from_secs(secs);
        }

        // Crash restart policy
        if let Some(count) = env_u32(env, "LODESTAR_CRASH_IMMEDIATE_RESTARTS")? {
            self.crash_policy.immediate_restarts = count;
        }
        if let Some(secs) = env_u64(env, "LODESTAR_CRASH_BASE_BACKOFF_SECS")? {
            self.crash_policy.base_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_CRASH_MAX_BACKOFF_SECS")? {
            self.crash_policy.max_backoff = Duration::from_secs(secs);
        }
        if let Some(count) = env_u32(env, "LODESTAR_CRASH_MAX_RESTART_ATTEMPTS")? {
            self.crash_policy.max_restart_attempts = count;
        }

        if let Some(workers) = env_usize(env, "LODESTAR_TASK_CALLBACK_WORKERS")? {
            self.task_callback_workers = workers;
        }
        if let Some(capacity) = env_usize(env, "LODESTAR_TASK_CALLBACK_QUEUE_CAPACITY")? {
            self.task_callback_queue_capacity = capacity;
        }

        if let Some(key) = env_string(env, "LODESTAR_LOCK_KEY") {
            self.lock_key = key;
        }
        if let Some(id) = env_string(env, "LODESTAR_INSTANCE_ID") {
            self.instance_id = Some(id);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_LOCK_TTL_SECS")? {
            self.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64(env, "LODESTAR_LOCK_RETRY_INTERVAL_SECS")? {
            self.lock_retry_interval = Duration::from_secs(secs);
        }

        if let Some(keys) = env_string(env, "LODESTAR_ENCRYPTION_KEYS") {
            self.encryption_keys = split_list(&keys);
        }
        if let Some(label) = env_string(env, "LODESTAR_ACTIVE_KEY_LABEL") {
            self.active_key_label = label;
        }

        if let Some(buffer) = env_usize(env, "LODESTAR_HUB_SUBSCRIBER_BUFFER")? {
            self.hub_subscriber_buffer = buffer;
        }
        if let Some(url) = env_string(env, "LODESTAR_AUCTIONEER_URL") {
            self.auctioneer_url = Some(url);
        }
        if let Some(cells) = env_string(env, "LODESTAR_STATIC_CELLS") {
            self.static_cells = split_list(&cells);
        }
        if let Some(port) = env_u16(env, "LODESTAR_LISTEN_PORT")? {
            self.listen_port = port;
        }

        Ok(())
    }

    /// Checks the configuration for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match (self.backend, self.database_url.as_deref()) {
            (BackendKind::Sql, None) => {
                return Err(Error::configuration(
                    "LODESTAR_DATABASE_URL is required when LODESTAR_BACKEND=sql",
                ));
            }
            (BackendKind::Kv, Some(_)) => {
                return Err(Error::configuration(
                    "LODESTAR_DATABASE_URL cannot be set with LODESTAR_BACKEND=kv; configure exactly one backend",
                ));
            }
            _ => {}
        }

        if self.active_key_label.trim().is_empty() {
            return Err(Error::configuration(
                "LODESTAR_ACTIVE_KEY_LABEL must be set",
            ));
        }
        let active_present = self.encryption_keys.iter().any(|spec| {
            spec.split_once(':')
                .is_some_and(|(label, _)| label.trim() == self.active_key_label)
        });
        if !active_present {
            return Err(Error::configuration(format!(
                "LODESTAR_ACTIVE_KEY_LABEL {} is not among LODESTAR_ENCRYPTION_KEYS",
                self.active_key_label
            )));
        }

        for (name, value) in [
            ("LODESTAR_STORE_OPERATION_TIMEOUT_SECS", self.store_operation_timeout),
            ("LODESTAR_CONVERGENCE_INTERVAL_SECS", self.convergence_interval),
            ("LODESTAR_KICK_TASK_DURATION_SECS", self.kick_task_duration),
            (
                "LODESTAR_EXPIRE_PENDING_TASK_DURATION_SECS",
                self.expire_pending_task_duration,
            ),
            (
                "LODESTAR_EXPIRE_COMPLETED_TASK_DURATION_SECS",
                self.expire_completed_task_duration,
            ),
            ("LODESTAR_STALE_UNCLAIMED_DURATION_SECS", self.stale_unclaimed_duration),
            ("LODESTAR_LOCK_TTL_SECS", self.lock_ttl),
            ("LODESTAR_LOCK_RETRY_INTERVAL_SECS", self.lock_retry_interval),
        ] {
            if value.is_zero() {
                return Err(Error::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.lock_retry_interval >= self.lock_ttl {
            return Err(Error::configuration(
                "LODESTAR_LOCK_RETRY_INTERVAL_SECS must be shorter than LODESTAR_LOCK_TTL_SECS",
            ));
        }

        for (name, value) in [
            ("LODESTAR_MAX_OPEN_CONNECTIONS", self.max_open_connections as usize),
            ("LODESTAR_CONVERGENCE_WORKERS", self.convergence_workers),
            ("LODESTAR_TASK_CALLBACK_WORKERS", self.task_callback_workers),
            (
                "LODESTAR_TASK_CALLBACK_QUEUE_CAPACITY",
                self.task_callback_queue_capacity,
            ),
            ("LODESTAR_HUB_SUBSCRIBER_BUFFER", self.hub_subscriber_buffer),
        ] {
            if value == 0 {
                return Err(Error::configuration(format!("{name} must be at least 1")));
            }
        }

        Ok(())
    }

    /// Returns the convergence settings.
    #[must_use]
    pub fn convergence(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            interval: self.convergence_interval,
            workers: self.convergence_workers,
            kick_task_duration: self.kick_task_duration,
            expire_pending_task_duration: self.expire_pending_task_duration,
            expire_completed_task_duration: self.expire_completed_task_duration,
            stale_unclaimed_duration: self.stale_unclaimed_duration,
            crash_policy: self.crash_policy,
        }
    }

    /// Returns the store retry policy with the configured deadline.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            operation_timeout: self.store_operation_timeout,
            ..RetryPolicy::default()
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_backend(name: &str, value: &str) -> Result<BackendKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sql" => Ok(BackendKind::Sql),
        "kv" => Ok(BackendKind::Kv),
        _ => Err(Error::configuration(format!(
            "{name} must be one of: sql, kv (got {value})"
        ))),
    }
}

fn env_string(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u16: {e}")))
}

fn env_u32(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
}

fn env_u64(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
}

fn env_usize(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn valid() -> StateConfig {
        StateConfig {
            database_url: Some("sqlite::memory:".to_string()),
            encryption_keys: vec!["primary:correct horse".to_string()],
            active_key_label: "primary".to_string(),
            ..StateConfig::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = StateConfig::default();
        assert_eq!(config.backend, BackendKind::Sql);
        assert_eq!(config.convergence_interval, Duration::from_secs(30));
        assert_eq!(config.expire_pending_task_duration, Duration::from_secs(1800));
        assert_eq!(config.expire_completed_task_duration, Duration::from_secs(120));
        assert_eq!(config.crash_policy, CrashRestartPolicy::default());
        assert_eq!(config.hub_subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
    }

    #[test]
    fn json_fields_override_defaults() -> Result<()> {
        let config = StateConfig::from_json(
            r#"{
                "backend": "kv",
                "convergence_interval": 5,
                "crash_policy": { "immediate_restarts": 1, "base_backoff": 10 },
                "static_cells": ["cell-a", "cell-b"]
            }"#,
        )?;
        assert_eq!(config.backend, BackendKind::Kv);
        assert_eq!(config.convergence_interval, Duration::from_secs(5));
        assert_eq!(config.crash_policy.immediate_restarts, 1);
        assert_eq!(config.crash_policy.base_backoff, Duration::from_secs(10));
        assert_eq!(config.crash_policy.max_restart_attempts, 200);
        assert_eq!(config.static_cells, vec!["cell-a", "cell-b"]);
        assert_eq!(config.lock_key, "lodestar");
        Ok(())
    }

    #[test]
    fn env_overrides_apply() -> Result<()> {
        let mut config = StateConfig::default();
        config.apply_env(vars(&[
            ("LODESTAR_BACKEND", "KV"),
            ("LODESTAR_CONVERGENCE_WORKERS", "4"),
            ("LODESTAR_CONVERGENCE_ENABLED", "no"),
            ("LODESTAR_ENCRYPTION_KEYS", "old:one, new:two"),
            ("LODESTAR_ACTIVE_KEY_LABEL", "new"),
            ("LODESTAR_STATIC_CELLS", "cell-a,,cell-b"),
            ("LODESTAR_AUCTIONEER_URL", "  "),
        ]))?;

        assert_eq!(config.backend, BackendKind::Kv);
        assert_eq!(config.convergence_workers, 4);
        assert!(!config.convergence_enabled);
        assert_eq!(config.encryption_keys, vec!["old:one", "new:two"]);
        assert_eq!(config.static_cells, vec!["cell-a", "cell-b"]);
        assert_eq!(config.auctioneer_url, None);
        config.validate()
    }

    #[test]
    fn unparseable_override_names_the_variable() {
        let mut config = StateConfig::default();
        let err = config
            .apply_env(vars(&[("LODESTAR_CONVERGENCE_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("LODESTAR_CONVERGENCE_WORKERS"));
    }

    #[test]
    fn validate_requires_exactly_one_backend() {
        let mut config = valid();
        config.database_url = None;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.backend = BackendKind::Kv;
        assert!(config.validate().is_err());
        config.database_url = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_the_active_key() {
        let mut config = valid();
        config.active_key_label = "missing".to_string();
        assert!(config.validate().is_err());

        config.active_key_label = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals_and_pools() {
        let mut config = valid();
        config.convergence_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.task_callback_workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.lock_retry_interval = config.lock_ttl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let rendered = format!("{:?}", valid());
        assert!(rendered.contains("primary"));
        assert!(!rendered.contains("correct horse"));
        assert!(!rendered.contains("sqlite::memory:"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("TEST", "TRUE").expect("bool"));
        assert!(parse_bool("TEST", "1").expect("bool"));
        assert!(!parse_bool("TEST", "no").expect("bool"));
        assert!(parse_bool("TEST", "maybe").is_err());
    }
}
