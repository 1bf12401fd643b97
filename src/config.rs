//! Atelier configuration.
//!
//! Values arrive already resolved, either from [`AtelierConfig::default`] or
//! from the key/value map handed to an interpreter process through `init`.

use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const LAUNCH_CMD: &str = "atelier.interpreter.launch.cmd";
pub const CONNECT_TIMEOUT: &str = "atelier.interpreter.connect.timeout";
pub const RESULT_CACHE: &str = "atelier.interpreter.result.cache";
pub const LIFECYCLE_MANAGER: &str = "atelier.lifecycle.manager";
pub const LIFECYCLE_CHECK_INTERVAL: &str = "atelier.lifecycle.check.interval";
pub const LIFECYCLE_THRESHOLD: &str = "atelier.lifecycle.threshold";
pub const OUTPUT_LIMIT: &str = "atelier.interpreter.output.limit";
pub const PARALLEL_MAX: &str = "atelier.scheduler.parallel.max";
pub const SHUTDOWN_GRACE: &str = "atelier.interpreter.shutdown.grace";
pub const RECOVERY_STORAGE: &str = "atelier.recovery.storage";
pub const RECOVERY_DIR: &str = "atelier.recovery.dir";

/// Which lifecycle manager an interpreter process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    /// Never shuts the process down on its own.
    Null,
    /// Shuts the process down after an idle threshold.
    Timeout,
}

/// Where process registrations are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Null,
    Sqlite,
}

/// Runtime config shared by the controller and interpreter processes.
#[derive(Debug, Clone)]
pub struct AtelierConfig {
    /// Command (program followed by arguments) used to launch an interpreter process
    pub launch_command: Vec<String>,
    /// How long a launched process has to register before the launch fails
    pub connect_timeout: Duration,
    /// How long a terminal job stays attachable for recovery
    pub result_cache: Duration,
    pub lifecycle: LifecycleKind,
    pub lifecycle_check_interval: Duration,
    pub lifecycle_threshold: Duration,
    /// Maximum bytes buffered per paragraph output
    pub output_limit: usize,
    /// Default width for interpreters that run jobs in parallel
    pub parallel_max: usize,
    /// Grace period between a shutdown request and forced termination
    pub shutdown_grace: Duration,
    pub recovery: RecoveryKind,
    pub recovery_dir: PathBuf,
}

impl Default for AtelierConfig {
    fn default() -> Self {
        Self {
            launch_command: default_launch_command(),
            connect_timeout: Duration::from_millis(60_000),
            result_cache: Duration::from_secs(0),
            lifecycle: LifecycleKind::Null,
            lifecycle_check_interval: Duration::from_millis(60_000),
            lifecycle_threshold: Duration::from_millis(3_600_000),
            output_limit: 100 * 1024,
            parallel_max: 10,
            shutdown_grace: Duration::from_millis(2_000),
            recovery: RecoveryKind::Sqlite,
            recovery_dir: default_recovery_dir(),
        }
    }
}

impl AtelierConfig {
    /// Build a config from `init` properties, falling back to defaults for
    /// anything not present. Unknown keys are ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(cmd) = properties.get(LAUNCH_CMD) {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(AtelierError::Config(format!("{} is empty", LAUNCH_CMD)));
            }
            config.launch_command = parts;
        }
        if let Some(ms) = parse_u64(properties, CONNECT_TIMEOUT)? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(properties, RESULT_CACHE)? {
            config.result_cache = Duration::from_secs(secs);
        }
        if let Some(kind) = properties.get(LIFECYCLE_MANAGER) {
            config.lifecycle = match kind.as_str() {
                "null" => LifecycleKind::Null,
                "timeout" => LifecycleKind::Timeout,
                other => {
                    return Err(AtelierError::Config(format!(
                        "unknown lifecycle manager '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(ms) = parse_u64(properties, LIFECYCLE_CHECK_INTERVAL)? {
            config.lifecycle_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(properties, LIFECYCLE_THRESHOLD)? {
            config.lifecycle_threshold = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_u64(properties, OUTPUT_LIMIT)? {
            config.output_limit = limit as usize;
        }
        if let Some(max) = parse_u64(properties, PARALLEL_MAX)? {
            config.parallel_max = (max as usize).max(1);
        }
        if let Some(ms) = parse_u64(properties, SHUTDOWN_GRACE)? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(kind) = properties.get(RECOVERY_STORAGE) {
            config.recovery = match kind.as_str() {
                "null" => RecoveryKind::Null,
                "sqlite" => RecoveryKind::Sqlite,
                other => {
                    return Err(AtelierError::Config(format!(
                        "unknown recovery storage '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(dir) = properties.get(RECOVERY_DIR) {
            config.recovery_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Flatten back into `init` properties for a launched process.
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(LAUNCH_CMD.to_string(), self.launch_command.join(" "));
        props.insert(
            CONNECT_TIMEOUT.to_string(),
            self.connect_timeout.as_millis().to_string(),
        );
        props.insert(RESULT_CACHE.to_string(), self.result_cache.as_secs().to_string());
        props.insert(
            LIFECYCLE_MANAGER.to_string(),
            match self.lifecycle {
                LifecycleKind::Null => "null",
                LifecycleKind::Timeout => "timeout",
            }
            .to_string(),
        );
        props.insert(
            LIFECYCLE_CHECK_INTERVAL.to_string(),
            self.lifecycle_check_interval.as_millis().to_string(),
        );
        props.insert(
            LIFECYCLE_THRESHOLD.to_string(),
            self.lifecycle_threshold.as_millis().to_string(),
        );
        props.insert(OUTPUT_LIMIT.to_string(), self.output_limit.to_string());
        props.insert(PARALLEL_MAX.to_string(), self.parallel_max.to_string());
        props.insert(
            SHUTDOWN_GRACE.to_string(),
            self.shutdown_grace.as_millis().to_string(),
        );
        props
    }
}

fn parse_u64(properties: &HashMap<String, String>, key: &str) -> Result<Option<u64>> {
    match properties.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| AtelierError::Config(format!("invalid value for {}: '{}' ({})", key, raw, e))),
    }
}

fn default_launch_command() -> Vec<String> {
    let program = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "atelier".to_string());
    vec![program, "interpreter".to_string()]
}

/// `~/.atelier`, or `/tmp/atelier-<user>` when no home directory is known.
pub fn default_recovery_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".atelier"),
        None => PathBuf::from("/tmp").join(format!("atelier-{}", whoami())),
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AtelierConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(60));
        assert_eq!(cfg.result_cache, Duration::ZERO);
        assert_eq!(cfg.lifecycle, LifecycleKind::Null);
        assert_eq!(cfg.output_limit, 102_400);
        assert_eq!(cfg.recovery, RecoveryKind::Sqlite);
        assert_eq!(cfg.launch_command.last().map(String::as_str), Some("interpreter"));
    }

    #[test]
    fn properties_override_defaults() {
        let mut props = HashMap::new();
        props.insert(LIFECYCLE_MANAGER.to_string(), "timeout".to_string());
        props.insert(LIFECYCLE_THRESHOLD.to_string(), "1000".to_string());
        props.insert(LIFECYCLE_CHECK_INTERVAL.to_string(), "200".to_string());
        props.insert(RESULT_CACHE.to_string(), "5".to_string());
        props.insert(LAUNCH_CMD.to_string(), "/usr/bin/atelier interpreter".to_string());
        props.insert("some.other.key".to_string(), "ignored".to_string());

        let cfg = AtelierConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.lifecycle, LifecycleKind::Timeout);
        assert_eq!(cfg.lifecycle_threshold, Duration::from_millis(1000));
        assert_eq!(cfg.lifecycle_check_interval, Duration::from_millis(200));
        assert_eq!(cfg.result_cache, Duration::from_secs(5));
        assert_eq!(cfg.launch_command, vec!["/usr/bin/atelier", "interpreter"]);
    }

    #[test]
    fn rejects_bad_numbers_and_kinds() {
        let mut props = HashMap::new();
        props.insert(CONNECT_TIMEOUT.to_string(), "soon".to_string());
        assert!(matches!(
            AtelierConfig::from_properties(&props),
            Err(AtelierError::Config(_))
        ));

        let mut props = HashMap::new();
        props.insert(LIFECYCLE_MANAGER.to_string(), "eager".to_string());
        assert!(AtelierConfig::from_properties(&props).is_err());
    }

    #[test]
    fn round_trips_through_properties() {
        let mut cfg = AtelierConfig::default();
        cfg.lifecycle = LifecycleKind::Timeout;
        cfg.output_limit = 42;
        let back = AtelierConfig::from_properties(&cfg.to_properties()).unwrap();
        assert_eq!(back.lifecycle, LifecycleKind::Timeout);
        assert_eq!(back.output_limit, 42);
        assert_eq!(back.shutdown_grace, cfg.shutdown_grace);
    }
}
