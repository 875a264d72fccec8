//! Vulkan backend.
//!
//! [`VulkanDevice`] implements [`crate::device::RawDevice`] on top of `ash`
//! and adds what only a real GPU has: memory allocation and swapchains.

mod device;
pub mod instance;
pub mod memory;
pub mod swapchain;

pub use device::{VulkanDevice, VulkanDeviceBuilder};
pub use memory::{GpuAllocator, GpuBuffer};
pub use swapchain::{AcquiredImage, Swapchain, SwapchainDesc};
