//! Platform and device discovery.
//!
//! Selection is by exact string match on the platform vendor and then on
//! the accelerator device name. When a driver reports duplicates, the last
//! match in enumeration order is selected.

use tracing::{debug, info};

use crate::error::{HostError, Result};
use crate::runtime::{ComputeRuntime, RuntimeStatus};

/// A platform/device pair chosen for the run.
pub struct ResolvedDevice<R: ComputeRuntime> {
    pub platform: R::Platform,
    pub device: R::Device,
    pub vendor: String,
    pub device_name: String,
}

impl<R: ComputeRuntime> std::fmt::Debug for ResolvedDevice<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDevice")
            .field("vendor", &self.vendor)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Find the accelerator named `device_name` under the platform whose vendor
/// is exactly `vendor`. Only queries the runtime; nothing is allocated.
///
/// # Errors
///
/// - [`HostError::PlatformNotFound`] when no platform vendor matches.
/// - [`HostError::DeviceNotFound`] when no accelerator under that platform
///   carries the requested name.
/// - [`HostError::RuntimeQuery`] when the runtime rejects a query.
pub fn resolve_device<R: ComputeRuntime>(
    runtime: &R,
    vendor: &str,
    device_name: &str,
) -> Result<ResolvedDevice<R>> {
    let platforms = match runtime.platforms() {
        Ok(platforms) => platforms,
        // ICD loaders report an empty platform list as an error code.
        Err(RuntimeStatus::PLATFORM_NOT_FOUND_KHR) => Vec::new(),
        Err(status) => return Err(HostError::RuntimeQuery { query: "platform ids", status }),
    };
    info!("found {} platform(s)", platforms.len());

    let mut selected = None;
    for (index, platform) in platforms.into_iter().enumerate() {
        let platform_vendor = runtime
            .platform_vendor(&platform)
            .map_err(|status| HostError::RuntimeQuery { query: "platform vendor", status })?;
        debug!("platform {index}: vendor '{platform_vendor}'");
        if platform_vendor == vendor {
            info!("selected platform {index} from {platform_vendor}");
            selected = Some(platform);
        }
    }
    let platform =
        selected.ok_or_else(|| HostError::PlatformNotFound { vendor: vendor.to_string() })?;

    let devices = match runtime.accelerator_devices(&platform) {
        Ok(devices) => devices,
        Err(RuntimeStatus::DEVICE_NOT_FOUND) => Vec::new(),
        Err(status) => return Err(HostError::RuntimeQuery { query: "device ids", status }),
    };
    info!("found {} accelerator device(s)", devices.len());

    let mut chosen = None;
    for (index, device) in devices.into_iter().enumerate() {
        let name = runtime
            .device_name(&device)
            .map_err(|status| HostError::RuntimeQuery { query: "device name", status })?;
        debug!("device {index}: '{name}'");
        if name == device_name {
            chosen = Some(device);
        }
    }
    let device = chosen.ok_or_else(|| HostError::DeviceNotFound {
        vendor: vendor.to_string(),
        device: device_name.to_string(),
    })?;
    info!("selected {device_name} as the target device");

    Ok(ResolvedDevice {
        platform,
        device,
        vendor: vendor.to_string(),
        device_name: device_name.to_string(),
    })
}
