//! Direct3D 8 style fixed-function rendering on top of Vulkan.
//!
//! [`Bridge`] takes the legacy call sequence (resources, state setters,
//! scenes and draws) and turns it into driver calls through any
//! [`fixvk_protocol::Driver`]: the real Vulkan driver in production, the
//! headless one in tests.

pub mod bridge;
pub mod error;
pub mod format;
pub mod frame;
pub mod legacy;
pub mod pipeline;
mod rollback;
pub mod session;
pub mod shaders;
pub mod shared;
pub mod state;
pub mod swap;
pub mod translator;

pub use bridge::Bridge;
pub use error::{BridgeError, ErrorClass, Result};
pub use frame::{FramePhase, FrameStats};
pub use legacy::{
    ClearFlags, D3dColor, D3dRect, Fvf, IndexData, LegacyFormat, LegacyViewport, Matrix4,
    PrimitiveType, RenderState, TransformKind, Usage,
};
pub use pipeline::PipelineStats;
pub use session::SessionState;
pub use shared::SharedBridge;
pub use translator::{BufferId, ImageId};
