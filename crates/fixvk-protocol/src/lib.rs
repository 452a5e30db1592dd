//! Vocabulary shared by the bridge and its drivers.
//!
//! Everything the bridge asks of the GPU goes through [`driver::Driver`] using
//! the plain-data descriptors and [`commands::RecordedCommand`] defined here.

pub mod commands;
pub mod descriptors;
pub mod driver;
pub mod error;
pub mod handle;
pub mod types;

pub use commands::RecordedCommand;
pub use driver::{Driver, WindowTarget};
pub use error::{DriverError, DriverResult};
pub use handle::{GpuHandle, HandleAllocator, ResourceType};
