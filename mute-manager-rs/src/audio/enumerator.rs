//! Device enumeration using Windows MMDevice API.
//!
//! Provides COM initialization and the WASAPI implementation of
//! [`EndpointBackend`].

use super::backend::{DeviceEventSink, EndpointBackend, EndpointHandle};
use super::device::{AudioError, DataFlow, DeviceDescriptor, DeviceId};
use super::notifications::DeviceNotificationClient;
use super::volume::VolumeController;
use crate::events::Subscription;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Devices::Properties::DEVPKEY_Device_FriendlyName;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::{
    eCapture, eRender, EDataFlow, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator,
    DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

/// COM initialization guard that uninitializes COM on drop.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Join the multithreaded apartment on the current thread.
    ///
    /// A thread already living in an STA keeps it; COM stays usable there and
    /// this guard then leaves it alone on drop.
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            let hr = CoInitializeEx(None, COINIT_MULTITHREADED);
            if hr == RPC_E_CHANGED_MODE {
                return Ok(Self { initialized: false });
            }
            hr.ok()
                .map_err(|e| AudioError::ComInitFailed(e.to_string()))?;
        }
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

thread_local! {
    static THREAD_COM: RefCell<Option<ComGuard>> = const { RefCell::new(None) };
}

/// Make sure COM is initialized on the calling thread for as long as it lives.
///
/// Registry watchers, sampler threads and FFI callers all reach WASAPI from
/// threads we do not otherwise control.
pub fn ensure_com() -> Result<(), AudioError> {
    THREAD_COM.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(ComGuard::new()?);
        }
        Ok(())
    })
}

pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(crate) fn to_edataflow(flow: DataFlow) -> EDataFlow {
    match flow {
        DataFlow::Capture => eCapture,
        DataFlow::Render => eRender,
    }
}

/// WASAPI endpoint backend.
pub struct WasapiBackend {
    enumerator: IMMDeviceEnumerator,
}

// SAFETY: MMDeviceEnumerator is registered with ThreadingModel=Both and every
// thread touching it joins the MTA through `ensure_com` first.
unsafe impl Send for WasapiBackend {}
unsafe impl Sync for WasapiBackend {}

impl WasapiBackend {
    /// Create the backend, initializing COM on the calling thread.
    pub fn new() -> Result<Self, AudioError> {
        ensure_com()?;
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;

            Ok(Self { enumerator })
        }
    }

    /// Convert an IMMDevice to a descriptor.
    fn describe(&self, device: &IMMDevice) -> Result<DeviceDescriptor, AudioError> {
        let id = device_id_of(device)?;

        let name = unsafe {
            device
                .OpenPropertyStore(STGM(0)) // STGM_READ
                .ok()
                .and_then(|props| self.get_device_name(&props))
                .unwrap_or_else(|| "Unknown".to_string())
        };

        Ok(DeviceDescriptor::new(id, name))
    }

    /// Get the friendly name of a device from its property store.
    fn get_device_name(&self, props: &IPropertyStore) -> Option<String> {
        unsafe {
            // Convert DEVPROPKEY to PROPERTYKEY
            let key = PROPERTYKEY {
                fmtid: DEVPKEY_Device_FriendlyName.fmtid,
                pid: DEVPKEY_Device_FriendlyName.pid,
            };

            let prop = props.GetValue(&key).ok()?;
            let s = prop.to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
    }
}

/// Read and free the endpoint id string of a device.
pub(crate) fn device_id_of(device: &IMMDevice) -> Result<String, AudioError> {
    unsafe {
        let id = device
            .GetId()
            .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;
        let id_string = id
            .to_string()
            .map_err(|e| AudioError::StringConversion(e.to_string()));
        CoTaskMemFree(Some(id.0 as *const _));
        id_string
    }
}

impl EndpointBackend for WasapiBackend {
    fn enumerate(&self, flow: DataFlow) -> Result<Vec<DeviceDescriptor>, AudioError> {
        ensure_com()?;
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(to_edataflow(flow), DEVICE_STATE_ACTIVE)
                .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;

            let count = collection
                .GetCount()
                .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;

            let mut devices = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = collection
                    .Item(i)
                    .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;

                match self.describe(&device) {
                    Ok(descriptor) => devices.push(descriptor),
                    Err(e) => warn!(error = %e, index = i, "Skipping endpoint that could not be described"),
                }
            }

            debug!(?flow, count = devices.len(), "Enumerated endpoints");
            Ok(devices)
        }
    }

    fn subscribe(&self, flow: DataFlow, sink: DeviceEventSink) -> Result<Subscription, AudioError> {
        ensure_com()?;
        let registration = DeviceNotificationClient::new(flow, sink)
            .register(&self.enumerator)
            .map_err(|e| AudioError::SubscriptionFailed(e.to_string()))?;

        debug!(?flow, "Registered endpoint notification client");
        Ok(Subscription::new(move || registration.unregister()))
    }

    fn open(&self, device_id: &DeviceId) -> Result<Arc<dyn EndpointHandle>, AudioError> {
        ensure_com()?;
        let device_id_wide = to_wide(device_id.as_str());
        let device = unsafe {
            self.enumerator
                .GetDevice(PCWSTR::from_raw(device_id_wide.as_ptr()))
                .map_err(|_| AudioError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?
        };

        let controller = VolumeController::new(device_id.clone(), &device)?;
        Ok(Arc::new(controller))
    }
}
