//! Application state and lifecycle management.
//!
//! [`AppState`] owns one registry and one [`ComplexController`] per data flow
//! and is the single entry point for front-ends (console, FFI). Front-ends
//! issue [`Command`]s and read back [`FlowStatus`] / [`DeviceSummary`]
//! snapshots.

use crate::audio::{
    default_backend, AudioError, DataFlow, DeviceId, EndpointBackend, EndpointHandle,
};
use crate::config::EngineConfig;
use crate::controller::{ComplexController, SyncStats, VolumeControl};
use crate::registry::DeviceRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Request addressed to the controller of one data flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Mute,
    Unmute,
    ToggleMute,
    SetVolume(f32),
    Select(DeviceId),
    Refresh,
}

/// One entry of a device list, "all devices" first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub name: String,
    pub is_selected: bool,
    pub is_active: bool,
    pub is_connected: bool,
    pub is_muted: Option<bool>,
    pub volume: Option<f32>,
}

/// State of the controller of one data flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub flow: DataFlow,
    pub selected_device: DeviceId,
    pub active_device: DeviceId,
    pub is_connected: bool,
    pub is_muted: Option<bool>,
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStats>,
}

struct FlowEngine {
    registry: DeviceRegistry,
    controller: ComplexController,
}

impl FlowEngine {
    fn new(backend: &Arc<dyn EndpointBackend>, flow: DataFlow, config: &EngineConfig) -> Self {
        let registry = DeviceRegistry::new(backend.clone(), flow, config.registry.clone());
        let controller = ComplexController::new(
            registry.clone(),
            config.aggregate_mode,
            config.sample_interval(),
        );
        controller.set_device_id(config.selected_device(flow));
        Self {
            registry,
            controller,
        }
    }
}

/// Main application state.
pub struct AppState {
    config: EngineConfig,
    capture: FlowEngine,
    render: FlowEngine,
}

impl AppState {
    /// Build both controller graphs and start watching for hot-plug events.
    pub fn new(backend: Arc<dyn EndpointBackend>, config: EngineConfig) -> Result<Self, AudioError> {
        let capture = FlowEngine::new(&backend, DataFlow::Capture, &config);
        let render = FlowEngine::new(&backend, DataFlow::Render, &config);

        capture.registry.start_watching()?;
        render.registry.start_watching()?;

        info!(
            capture_devices = capture.registry.live_set().len() - 1,
            render_devices = render.registry.live_set().len() - 1,
            "Audio engine started"
        );

        Ok(Self {
            config,
            capture,
            render,
        })
    }

    /// Same as [`AppState::new`] with the host's native backend.
    pub fn with_default_backend(config: EngineConfig) -> Result<Self, AudioError> {
        Self::new(default_backend()?, config)
    }

    fn engine(&self, flow: DataFlow) -> &FlowEngine {
        match flow {
            DataFlow::Capture => &self.capture,
            DataFlow::Render => &self.render,
        }
    }

    pub fn controller(&self, flow: DataFlow) -> &ComplexController {
        &self.engine(flow).controller
    }

    pub fn registry(&self, flow: DataFlow) -> &DeviceRegistry {
        &self.engine(flow).registry
    }

    /// Hardware handle of a live endpoint, for raw stream access.
    pub fn handle_for(&self, flow: DataFlow, device_id: &DeviceId) -> Option<Arc<dyn EndpointHandle>> {
        self.registry(flow).handle_for(device_id)
    }

    pub fn devices(&self, flow: DataFlow) -> Vec<DeviceSummary> {
        let engine = self.engine(flow);
        let selected = engine.controller.device_id();
        let active = engine.controller.active_device_id();

        engine
            .registry
            .live_set()
            .into_iter()
            .map(|descriptor| {
                let control = if descriptor.id.is_all() {
                    Some(engine.controller.aggregate())
                } else {
                    engine.controller.member(&descriptor.id)
                };
                DeviceSummary {
                    is_selected: descriptor.id == selected,
                    is_active: descriptor.id == active,
                    is_connected: control.as_ref().is_some_and(|c| c.is_connected()),
                    is_muted: control.as_ref().and_then(|c| c.mute()),
                    volume: control.as_ref().and_then(|c| c.volume()),
                    id: descriptor.id,
                    name: descriptor.name,
                }
            })
            .collect()
    }

    pub fn status(&self, flow: DataFlow) -> FlowStatus {
        let controller = self.controller(flow);
        FlowStatus {
            flow,
            selected_device: controller.device_id(),
            active_device: controller.active_device_id(),
            is_connected: controller.is_connected(),
            is_muted: controller.mute(),
            volume: controller.volume(),
            sync: controller.sync_stats(),
        }
    }

    /// Apply a command and report the resulting state.
    pub fn handle(&self, flow: DataFlow, command: Command) -> FlowStatus {
        let engine = self.engine(flow);
        info!(?flow, ?command, "Command");

        match command {
            Command::Mute => engine.controller.set_mute(Some(true)),
            Command::Unmute => engine.controller.set_mute(Some(false)),
            Command::ToggleMute => {
                engine.controller.toggle_mute();
            }
            Command::SetVolume(volume) => {
                if !(0.0..=1.0).contains(&volume) {
                    warn!(?flow, volume, "Volume out of range, clamping");
                }
                engine.controller.set_volume(Some(volume));
            }
            Command::Select(device_id) => engine.controller.set_device_id(device_id),
            Command::Refresh => {
                engine.registry.refresh();
            }
        }

        self.status(flow)
    }

    /// Configuration with the current selections, for the host to persist.
    pub fn current_config(&self) -> EngineConfig {
        EngineConfig {
            capture_device: Some(self.capture.controller.device_id()),
            render_device: Some(self.render.controller.device_id()),
            ..self.config.clone()
        }
    }

    /// Stop the hot-plug watchers. Controllers stay usable.
    pub fn shutdown(&self) {
        self.capture.registry.stop_watching();
        self.render.registry.stop_watching();
        info!("Audio engine stopped");
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown();
    }
}
