//! Drivers behind the [`fixvk_protocol::Driver`] seam.
//!
//! [`VulkanDriver`] talks to the system Vulkan loader through `ash`.
//! [`HeadlessDriver`] simulates a GPU in memory and records every call.

pub mod headless;
pub mod vulkan;

pub use headless::{DriverCall, HeadlessAdapter, HeadlessDriver, PresentRecord, Submission};
pub use vulkan::VulkanDriver;
