//! Engine configuration.
//!
//! Supplied by the host application (JSON across FFI, a file for the console
//! binary). Every field has a default so partial documents are accepted.

use crate::audio::{DataFlow, DeviceId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the "all devices" selection behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMode {
    /// Pure AND/MIN reduction over the members
    Reducing,

    /// Own state, two-way sync with members, seeds hot-plugged devices
    #[default]
    Synchronizing,
}

/// Timing of the registry watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Quiet period after a hot-plug callback before re-enumerating
    pub debounce_ms: u64,

    /// Re-enumerate at least this often to cover missed callbacks
    pub fallback_interval_ms: u64,

    /// Delay before retrying a rejected hot-plug registration
    pub subscription_retry_ms: u64,
}

impl RegistryConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn subscription_retry(&self) -> Duration {
        Duration::from_millis(self.subscription_retry_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            fallback_interval_ms: 60_000,
            subscription_retry_ms: 5_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// tracing filter directive, e.g. "info" or "mute_manager_rs=debug"
    pub log_level: Option<String>,

    pub aggregate_mode: AggregateMode,

    /// Last persisted capture selection
    pub capture_device: Option<DeviceId>,

    /// Last persisted render selection
    pub render_device: Option<DeviceId>,

    pub registry: RegistryConfig,

    /// Sampling interval for hardware volume notifications
    pub sample_interval_ms: u64,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Initial selection for a flow; "all devices" when nothing was persisted.
    pub fn selected_device(&self, flow: DataFlow) -> DeviceId {
        let selected = match flow {
            DataFlow::Capture => &self.capture_device,
            DataFlow::Render => &self.render_device,
        };
        selected
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(DeviceId::all)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            aggregate_mode: AggregateMode::default(),
            capture_device: None,
            render_device: None,
            registry: RegistryConfig::default(),
            sample_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registry.debounce(), Duration::from_millis(100));
        assert_eq!(config.registry.fallback_interval(), Duration::from_secs(60));
        assert_eq!(config.sample_interval(), Duration::from_millis(100));
        assert_eq!(config.aggregate_mode, AggregateMode::Synchronizing);
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json(
            r#"{ "capture_device": "mic-1", "registry": { "debounce_ms": 250 }, "aggregate_mode": "reducing" }"#,
        )
        .unwrap();

        assert_eq!(config.selected_device(DataFlow::Capture), DeviceId::new("mic-1"));
        assert_eq!(config.selected_device(DataFlow::Render), DeviceId::all());
        assert_eq!(config.registry.debounce_ms, 250);
        assert_eq!(config.registry.fallback_interval_ms, 60_000);
        assert_eq!(config.aggregate_mode, AggregateMode::Reducing);
    }

    #[test]
    fn test_empty_selection_means_all() {
        let config = EngineConfig {
            render_device: Some(DeviceId::empty()),
            ..EngineConfig::default()
        };
        assert!(config.selected_device(DataFlow::Render).is_all());
    }
}
