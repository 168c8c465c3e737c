//! Mute/volume controllers.
//!
//! Every controller exposes the same [`VolumeControl`] capability so the
//! façade can route to a single endpoint or to an aggregate without caring
//! which one it holds. Values are `Option`s: `None` means "no hardware"
//! (unbound, no members) and writing `None` is a no-op.

pub mod aggregate;
pub mod complex;
pub mod latch;
pub mod members;
pub mod single;
pub mod sync;

pub use aggregate::{reduce_mute, reduce_volume, AggregateController};
pub use complex::ComplexController;
pub use latch::{LatchGuard, UpdateLatch};
pub use members::{MemberSet, MembershipChange};
pub use single::SingleDeviceController;
pub use sync::{SyncStats, SynchronizingAggregateController};

use crate::audio::DeviceId;
use crate::events::Subscription;
use std::sync::Arc;

/// Property change of a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    MuteChanged(Option<bool>),
    VolumeChanged(Option<f32>),
    ConnectedChanged(bool),
    DeviceChanged(DeviceId),
}

pub type ControlListener = Box<dyn Fn(&ControlEvent) + Send + Sync>;

/// Shared handle to any controller.
pub type SharedControl = Arc<dyn VolumeControl>;

/// Common capability of single-device and aggregate controllers.
pub trait VolumeControl: Send + Sync {
    fn device_id(&self) -> DeviceId;

    fn mute(&self) -> Option<bool>;

    fn set_mute(&self, muted: Option<bool>);

    /// Master volume scalar (0.0 to 1.0).
    fn volume(&self) -> Option<f32>;

    /// Values outside 0.0..=1.0 are clamped, NaN is ignored.
    fn set_volume(&self, volume: Option<f32>);

    fn is_connected(&self) -> bool;

    fn subscribe(&self, listener: ControlListener) -> Subscription;
}

/// Clamp a requested volume, rejecting NaN.
pub(crate) fn normalize_volume(volume: Option<f32>) -> Option<f32> {
    volume
        .filter(|v| !v.is_nan())
        .map(|v| v.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_volume() {
        assert_eq!(normalize_volume(Some(0.5)), Some(0.5));
        assert_eq!(normalize_volume(Some(1.7)), Some(1.0));
        assert_eq!(normalize_volume(Some(-0.2)), Some(0.0));
        assert_eq!(normalize_volume(Some(f32::NAN)), None);
        assert_eq!(normalize_volume(None), None);
    }
}
