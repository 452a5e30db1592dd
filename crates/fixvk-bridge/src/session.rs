//! Instance, surface, adapter and logical device for one bridge session.

use tracing::{debug, info, warn};

use fixvk_core::FixvkConfig;
use fixvk_protocol::descriptors::{AdapterFeatures, AdapterInfo, DeviceDesc, InstanceDesc};
use fixvk_protocol::types::AdapterKind;
use fixvk_protocol::{Driver, GpuHandle, WindowTarget};

use crate::error::{BridgeError, Result};
use crate::rollback::with_rollback;

const APPLICATION_NAME: &str = "fixvk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Resizing,
    ShuttingDown,
}

/// Prefer a discrete GPU, else the first adapter that can render and present.
pub fn select_adapter(adapters: &[AdapterInfo]) -> Option<&AdapterInfo> {
    let mut usable = adapters.iter().filter(|a| a.queue_family.is_some());
    let first = usable.clone().next();
    usable
        .find(|a| a.kind == AdapterKind::Discrete)
        .or(first)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSession {
    pub instance: GpuHandle,
    pub validation_enabled: bool,
    pub surface: GpuHandle,
    pub adapter: Option<AdapterInfo>,
    pub device: GpuHandle,
    pub queue: GpuHandle,
    pub queue_family: u32,
    /// Features actually enabled on the device
    pub features: AdapterFeatures,
    pub command_pool: GpuHandle,
}

impl DeviceSession {
    /// Bring up instance → surface → adapter → device. Nothing survives a failure.
    pub fn create<D: Driver>(
        driver: &mut D,
        window: &WindowTarget,
        config: &FixvkConfig,
    ) -> Result<Self> {
        with_rollback(driver, |driver, partial| {
            let instance_info = driver
                .create_instance(&InstanceDesc {
                    application_name: APPLICATION_NAME.to_string(),
                    enable_validation: config.renderer.enable_validation,
                    display: Some(window.display),
                })
                .map_err(|e| BridgeError::init("create instance", e))?;
            let instance = partial.track(instance_info.instance);
            if config.renderer.enable_validation && !instance_info.validation_enabled {
                warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }

            let surface = partial.track(
                driver
                    .create_surface(instance, window)
                    .map_err(|e| BridgeError::init("create surface", e))?,
            );

            let adapters = driver
                .enumerate_adapters(instance, Some(surface))
                .map_err(|e| BridgeError::init("enumerate adapters", e))?;
            let adapter = select_adapter(&adapters).cloned().ok_or_else(|| {
                BridgeError::InitializationFailure(format!(
                    "none of {} adapters can render and present to this window",
                    adapters.len()
                ))
            })?;
            let queue_family = adapter.queue_family.unwrap_or_default();

            let features = AdapterFeatures {
                sampler_anisotropy: config.renderer.enable_anisotropy
                    && adapter.features.sampler_anisotropy,
                fill_mode_non_solid: adapter.features.fill_mode_non_solid,
            };
            let device_info = driver
                .create_device(&DeviceDesc {
                    adapter: adapter.adapter,
                    queue_family,
                    enable_validation: instance_info.validation_enabled,
                    features,
                })
                .map_err(|e| BridgeError::init("create device", e))?;
            partial.track(device_info.device);

            info!(
                adapter = %adapter.name,
                kind = ?adapter.kind,
                queue_family,
                validation = instance_info.validation_enabled,
                anisotropy = features.sampler_anisotropy,
                "device session created"
            );
            Ok(Self {
                instance,
                validation_enabled: instance_info.validation_enabled,
                surface,
                adapter: Some(adapter),
                device: device_info.device,
                queue: device_info.queue,
                queue_family,
                features,
                command_pool: GpuHandle::null(),
            })
        })
    }

    pub fn create_command_pool<D: Driver>(&mut self, driver: &mut D) -> Result<()> {
        self.command_pool = driver
            .create_command_pool(self.queue_family)
            .map_err(|e| BridgeError::init("command pool", e))?;
        debug!(pool = ?self.command_pool, "created command pool");
        Ok(())
    }

    /// Anisotropy limit of the device, when the feature is enabled.
    pub fn anisotropy_limit(&self) -> Option<f32> {
        if !self.features.sampler_anisotropy {
            return None;
        }
        self.adapter.as_ref().map(|a| a.max_sampler_anisotropy)
    }

    pub fn is_created(&self) -> bool {
        !self.device.is_null()
    }

    pub fn destroy_command_pool<D: Driver>(&mut self, driver: &mut D) {
        if let Some(pool) = std::mem::take(&mut self.command_pool).non_null() {
            driver.destroy(pool);
        }
    }

    /// Destroy device → surface → instance.
    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        self.destroy_command_pool(driver);
        let session = std::mem::take(self);
        for handle in [session.device, session.surface, session.instance] {
            if let Some(handle) = handle.non_null() {
                driver.destroy(handle);
            }
        }
    }
}
