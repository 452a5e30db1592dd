use fixvk_protocol::DriverError;

use crate::legacy::LegacyFormat;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Session could not be brought up; nothing is left running
    InitializationFailure,
    /// One buffer, image or pipeline failed; the call is skipped
    ResourceCreationFailure,
    /// The caller broke the call-order contract
    InvalidCallOrder,
    /// The device is unusable until a fresh Initialize
    DeviceLost,
    /// The swap surface is stale and will be rebuilt
    SurfaceOutOfDate,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("initialization failed: {0}")]
    InitializationFailure(String),

    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(LegacyFormat),

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),

    #[error("pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("invalid call order: {0}")]
    InvalidCallOrder(&'static str),

    #[error("BeginScene called inside a scene")]
    AlreadyInScene,

    #[error("EndScene called outside a scene")]
    NotInScene,

    #[error("device lost")]
    DeviceLost,

    #[error("swap surface out of date")]
    SurfaceOutOfDate,

    #[error("invalid {kind} id {id:#x}")]
    InvalidResource { kind: &'static str, id: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BridgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::InitializationFailure(_) => ErrorClass::InitializationFailure,
            BridgeError::UnsupportedFormat(_)
            | BridgeError::OutOfDeviceMemory
            | BridgeError::ResourceCreationFailed(_)
            | BridgeError::PipelineCreationFailed(_) => ErrorClass::ResourceCreationFailure,
            BridgeError::InvalidCallOrder(_)
            | BridgeError::AlreadyInScene
            | BridgeError::NotInScene
            | BridgeError::InvalidResource { .. }
            | BridgeError::InvalidArgument(_) => ErrorClass::InvalidCallOrder,
            BridgeError::DeviceLost => ErrorClass::DeviceLost,
            BridgeError::SurfaceOutOfDate => ErrorClass::SurfaceOutOfDate,
        }
    }

    /// Session-level failures that the host has to react to.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::InitializationFailure(_) | BridgeError::DeviceLost
        )
    }

    /// Wrap a driver failure that happened while bringing the session up.
    pub(crate) fn init(what: &str, err: DriverError) -> Self {
        match err {
            DriverError::DeviceLost => BridgeError::DeviceLost,
            other => BridgeError::InitializationFailure(format!("{what}: {other}")),
        }
    }
}

impl From<DriverError> for BridgeError {
    fn from(err: DriverError) -> Self {
        match err {
            // A bounded fence wait that runs out means the GPU stopped making progress
            DriverError::DeviceLost | DriverError::Timeout => BridgeError::DeviceLost,
            DriverError::OutOfDate => BridgeError::SurfaceOutOfDate,
            DriverError::OutOfDeviceMemory | DriverError::OutOfHostMemory => {
                BridgeError::OutOfDeviceMemory
            }
            other => BridgeError::ResourceCreationFailed(other.to_string()),
        }
    }
}
