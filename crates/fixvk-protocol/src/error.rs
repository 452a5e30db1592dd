use ash::vk;

use crate::handle::GpuHandle;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(String),

    #[error("invalid handle: {0:?}")]
    InvalidHandle(GpuHandle),

    #[error("timeout")]
    Timeout,

    #[error("surface out of date")]
    OutOfDate,

    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("Vulkan error: {0:?}")]
    Vk(vk::Result),
}

impl DriverError {
    /// Convert back to a Vulkan result code.
    pub fn to_vk_result(&self) -> vk::Result {
        match self {
            DriverError::LoaderUnavailable(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            DriverError::InvalidHandle(_) => vk::Result::ERROR_UNKNOWN,
            DriverError::Timeout => vk::Result::TIMEOUT,
            DriverError::OutOfDate => vk::Result::ERROR_OUT_OF_DATE_KHR,
            DriverError::DeviceLost => vk::Result::ERROR_DEVICE_LOST,
            DriverError::OutOfDeviceMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            DriverError::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            DriverError::Unsupported(_) => vk::Result::ERROR_FEATURE_NOT_PRESENT,
            DriverError::Validation(_) => vk::Result::ERROR_UNKNOWN,
            DriverError::Vk(result) => *result,
        }
    }
}

impl From<vk::Result> for DriverError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT => DriverError::Timeout,
            vk::Result::ERROR_OUT_OF_DATE_KHR => DriverError::OutOfDate,
            vk::Result::ERROR_DEVICE_LOST => DriverError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DriverError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DriverError::OutOfHostMemory,
            other => DriverError::Vk(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert_eq!(DriverError::from(vk::Result::TIMEOUT), DriverError::Timeout);
        assert_eq!(
            DriverError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            DriverError::OutOfDate
        );
        assert_eq!(
            DriverError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            DriverError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
        assert_eq!(
            DriverError::OutOfDeviceMemory.to_vk_result(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        );
    }
}
