//! Bridge configuration
//!
//! Loaded from code, JSON or `TETHER_*` environment variables. Durations
//! are plain milliseconds so the JSON form stays flat.

use crate::error::BridgeResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_gc::ReaperConfig;

/// Tuning for a [`HandleBridge`](crate::HandleBridge)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Slots reserved in each table before the first growth (default: 1000)
    pub initial_capacity: usize,
    /// Reaper sleep between passes (default: 100ms)
    pub reaper_interval_ms: u64,
    /// Idle notification budget after each pass (default: 100ms)
    pub idle_budget_ms: u64,
    /// Idle notification budget after each step (default: 1ms)
    pub step_budget_ms: u64,
    /// Idle ticks between retries of entries the engine refused (default: 10)
    pub abandoned_retry_ticks: u64,
    /// Ask the engine for the state of weak entries on every idle tick
    pub poll_native_state: bool,
    /// Run the reaper on a background thread (default: true)
    pub background_reclaim: bool,
    /// Name of the reaper thread
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1000,
            reaper_interval_ms: 100,
            idle_budget_ms: 100,
            step_budget_ms: 1,
            abandoned_retry_ticks: 10,
            poll_native_state: false,
            background_reclaim: true,
            thread_name: "tether-reaper".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Defaults overridden by any `TETHER_*` variables that are set
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        read_var(&var, "TETHER_INITIAL_CAPACITY", &mut self.initial_capacity);
        read_var(&var, "TETHER_REAPER_INTERVAL_MS", &mut self.reaper_interval_ms);
        read_var(&var, "TETHER_IDLE_BUDGET_MS", &mut self.idle_budget_ms);
        read_var(&var, "TETHER_STEP_BUDGET_MS", &mut self.step_budget_ms);
        read_var(&var, "TETHER_ABANDONED_RETRY_TICKS", &mut self.abandoned_retry_ticks);
        read_var(&var, "TETHER_POLL_NATIVE_STATE", &mut self.poll_native_state);
        read_var(&var, "TETHER_BACKGROUND_RECLAIM", &mut self.background_reclaim);
        if let Some(name) = var("TETHER_THREAD_NAME") {
            self.thread_name = name;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.initial_capacity = self.initial_capacity.max(1);
        self.reaper_interval_ms = self.reaper_interval_ms.max(1);
        self.abandoned_retry_ticks = self.abandoned_retry_ticks.max(1);
        if self.thread_name.is_empty() {
            self.thread_name = Self::default().thread_name;
        }
        self
    }

    /// Set the initial slot capacity of each table
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity.max(1);
        self
    }

    /// Set the reaper sleep between passes
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    /// Set the idle notification budget after each pass
    pub fn idle_budget_ms(mut self, budget: u64) -> Self {
        self.idle_budget_ms = budget;
        self
    }

    /// Set the idle notification budget after each step
    pub fn step_budget_ms(mut self, budget: u64) -> Self {
        self.step_budget_ms = budget;
        self
    }

    /// Set how many idle ticks pass between retries of refused entries
    pub fn abandoned_retry_ticks(mut self, ticks: u64) -> Self {
        self.abandoned_retry_ticks = ticks.max(1);
        self
    }

    /// Poll the engine for reclaimed entries on each idle tick
    pub fn poll_native_state(mut self, enabled: bool) -> Self {
        self.poll_native_state = enabled;
        self
    }

    /// Run the reaper on a background thread
    pub fn background_reclaim(mut self, enabled: bool) -> Self {
        self.background_reclaim = enabled;
        self
    }

    /// Set the reaper thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Reaper settings derived from this configuration
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_millis(self.reaper_interval_ms),
            idle_budget_ms: self.idle_budget_ms,
            step_budget_ms: self.step_budget_ms,
            thread_name: self.thread_name.clone(),
        }
    }
}

fn read_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    let Some(raw) = var(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.initial_capacity, 1000);
        assert_eq!(config.reaper_interval_ms, 100);
        assert!(config.background_reclaim);
        assert!(!config.poll_native_state);
    }

    #[test]
    fn test_builder_clamps() {
        let config = BridgeConfig::new()
            .initial_capacity(0)
            .abandoned_retry_ticks(0)
            .reaper_interval(Duration::ZERO);
        assert_eq!(config.initial_capacity, 1);
        assert_eq!(config.abandoned_retry_ticks, 1);
        assert_eq!(config.reaper_interval_ms, 1);
    }

    #[test]
    fn test_from_json_partial() {
        let config = BridgeConfig::from_json(r#"{"idle_budget_ms": 5, "thread_name": ""}"#).unwrap();
        assert_eq!(config.idle_budget_ms, 5);
        assert_eq!(config.step_budget_ms, 1);
        assert_eq!(config.thread_name, "tether-reaper");
        assert!(BridgeConfig::from_json("{").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TETHER_INITIAL_CAPACITY", "64"),
            ("TETHER_BACKGROUND_RECLAIM", "false"),
            ("TETHER_IDLE_BUDGET_MS", "soon"),
        ]
        .into_iter()
        .collect();
        let config = BridgeConfig::default()
            .with_env_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.initial_capacity, 64);
        assert!(!config.background_reclaim);
        assert_eq!(config.idle_budget_ms, 100);
    }

    #[test]
    fn test_reaper_config() {
        let reaper = BridgeConfig::new()
            .reaper_interval(Duration::from_millis(20))
            .reaper_config();
        assert_eq!(reaper.interval, Duration::from_millis(20));
        assert_eq!(reaper.thread_name, "tether-reaper");
    }
}
