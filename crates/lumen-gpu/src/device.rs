//! The native device seam.
//!
//! [`RawDevice`] is the narrow slice of a GPU API the submission core talks
//! to. The Vulkan backend forwards to `ash`; the headless backend simulates
//! fences and binary semaphores in process.

use ash::vk;

use crate::error::Result;
use crate::family::QueueFamily;
use crate::handle::ObjectHandle;
use crate::vulkan::VulkanDevice;

/// Which implementation sits behind a [`RawDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Vulkan,
    Headless,
}

/// One native submit descriptor (`VkSubmitInfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// One native present call (`VkPresentInfoKHR`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePresent<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub swapchains: &'a [vk::SwapchainKHR],
    /// One image index per swapchain.
    pub image_indices: &'a [u32],
}

/// Native operations required by the submission core.
///
/// Handles passed in must have been created by the same device.
pub trait RawDevice: Send + Sync {
    /// Backend tag.
    fn backend(&self) -> Backend;

    /// Capability query for Vulkan-only functionality such as swapchains.
    fn as_vulkan(&self) -> Option<&VulkanDevice> {
        None
    }

    /// Queue families exposed by the device.
    fn queue_families(&self) -> Vec<QueueFamily>;

    /// Fetch a queue handle.
    fn queue(&self, family: u32, index: u32) -> vk::Queue;

    /// Create an unsignaled fence.
    fn create_fence(&self) -> Result<vk::Fence>;

    /// Destroy a fence.
    fn destroy_fence(&self, fence: vk::Fence);

    /// Create a binary semaphore.
    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    /// Destroy a semaphore.
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submit work to a queue, optionally signaling `fence` when all of it completes.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[NativeSubmit<'_>],
        fence: vk::Fence,
    ) -> Result<()>;

    /// Block until the fence signals or the timeout elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    /// Reset a fence to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Queue a present. Returns `true` when the swapchain is suboptimal.
    fn queue_present(&self, queue: vk::Queue, present: &NativePresent<'_>) -> Result<bool>;

    /// Destroy a GPU object and release any memory bound to it.
    fn destroy_object(&self, handle: ObjectHandle);

    /// Block until the device is idle.
    fn wait_idle(&self) -> Result<()>;
}
