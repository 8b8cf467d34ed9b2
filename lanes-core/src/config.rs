/// Engine configuration shared by the backend and embedders.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::coordinator::LockPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// How long `apply` may wait for a busy board. 0 fails fast with `Busy`.
    #[serde(default)]
    pub lock_wait_ms: u64,
    /// Deadline for a bulk update; exceeding it counts as a transient failure.
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,
    /// Deadline for loading a board into its session.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_persist_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 0,
            persist_timeout_ms: default_persist_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::from_millis(self.lock_wait_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{ "lockWaitMs": 250 }"#).unwrap();
        assert_eq!(config.lock_wait_ms, 250);
        assert_eq!(config.persist_timeout_ms, 5_000);
        assert_eq!(config.lock_policy(), LockPolicy::WaitUpTo(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_wait_fails_fast() {
        assert_eq!(EngineConfig::default().lock_policy(), LockPolicy::FailFast);
    }
}
