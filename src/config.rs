//! Runtime configuration

use std::env;
use std::time::Duration;

/// Nesting limit for function calls within one evaluation
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// What happens when a `type` or `server` name is declared twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeclarePolicy {
    /// Fail with a declaration error
    #[default]
    Reject,
    /// Last declaration wins
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Threads running actor turns
    pub workers: usize,
    /// Threads running offloaded blocking calls
    pub offload_workers: usize,
    /// Deadline after which an offload reports an error to its requester
    pub offload_timeout: Duration,
    pub redeclare: RedeclarePolicy,
    /// Deeper calls fail the turn with a recursion error
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            offload_workers: 4,
            offload_timeout: Duration::from_secs(30),
            redeclare: RedeclarePolicy::Reject,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `PARLEY_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`] but reading variables through `lookup`.
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            workers: lookup("PARLEY_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workers),
            offload_workers: lookup("PARLEY_OFFLOAD_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.offload_workers),
            offload_timeout: lookup("PARLEY_OFFLOAD_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.offload_timeout),
            redeclare: match lookup("PARLEY_ALLOW_REDECLARE").as_deref() {
                Some("1" | "true" | "yes") => RedeclarePolicy::Overwrite,
                _ => defaults.redeclare,
            },
            max_call_depth: lookup("PARLEY_MAX_CALL_DEPTH")
                .and_then(|v| v.parse().ok())
                .filter(|&depth: &usize| depth > 0)
                .unwrap_or(defaults.max_call_depth),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_offload_workers(mut self, workers: usize) -> Self {
        self.offload_workers = workers.max(1);
        self
    }

    pub fn with_offload_timeout(mut self, timeout: Duration) -> Self {
        self.offload_timeout = timeout;
        self
    }

    pub fn with_redeclare(mut self, policy: RedeclarePolicy) -> Self {
        self.redeclare = policy;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.offload_workers, 4);
        assert_eq!(config.offload_timeout, Duration::from_secs(30));
        assert_eq!(config.redeclare, RedeclarePolicy::Reject);
        assert_eq!(config.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PARLEY_WORKERS", "3"),
            ("PARLEY_OFFLOAD_TIMEOUT_MS", "250"),
            ("PARLEY_ALLOW_REDECLARE", "true"),
            ("PARLEY_MAX_CALL_DEPTH", "64"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.workers, 3);
        assert_eq!(config.offload_workers, 4);
        assert_eq!(config.offload_timeout, Duration::from_millis(250));
        assert_eq!(config.redeclare, RedeclarePolicy::Overwrite);
        assert_eq!(config.max_call_depth, 64);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let config = RuntimeConfig::from_lookup(|k| {
            (k == "PARLEY_OFFLOAD_WORKERS").then(|| "many".to_string())
        });
        assert_eq!(config.offload_workers, 4);
    }

    #[test]
    fn test_builders_clamp_to_one() {
        let config = RuntimeConfig::default().with_workers(0).with_offload_workers(0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.offload_workers, 1);
    }
}
