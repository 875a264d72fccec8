//! Swapchain management.

use crate::command::SwapchainImage;
use crate::error::{GpuError, Result};
use crate::sync::SemaphorePool;
use crate::vulkan::VulkanDevice;
use ash::vk;

/// An image handed out by [`Swapchain::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub target: SwapchainImage,
    /// Pool semaphore signaled when the image is ready to be written.
    pub semaphore: vk::Semaphore,
    pub suboptimal: bool,
}

/// Swapchain surface parameters chosen by the caller.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, optionally replacing `old`.
    ///
    /// # Safety
    /// The surface must belong to the device's instance and `old` must not be in use.
    pub unsafe fn new(
        device: &VulkanDevice,
        desc: &SwapchainDesc,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let capabilities = &desc.capabilities;
        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let loader = device.swapchain_loader();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        let images = unsafe { loader.get_swapchain_images(swapchain)? };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            match unsafe { device.device().create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for view in image_views {
                            device.device().destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            "Created swapchain: {} images, {}x{}, {:?}",
            images.len(),
            desc.extent.width,
            desc.extent.height,
            desc.present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: desc.format.format,
            extent: desc.extent,
        })
    }

    /// Acquire the next image, signaling a semaphore taken from `semaphores`.
    ///
    /// Record the result with `CommandEncoder::acquire_image(target, semaphore, true)`
    /// so the semaphore is recycled with the submission that waits on it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next_image(
        &self,
        device: &VulkanDevice,
        semaphores: &SemaphorePool,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let semaphore = semaphores.create()?;
        let result = unsafe {
            device.swapchain_loader().acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage {
                target: SwapchainImage::new(self.swapchain, index),
                semaphore,
                suboptimal,
            }),
            // No signal operation was queued, so the semaphore is still clean.
            Err(e @ (vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR)) => {
                semaphores.release(semaphore);
                Err(GpuError::PresentFailed(e.to_string()))
            }
            Err(e) => {
                semaphores.release(semaphore);
                Err(e.into())
            }
        }
    }

    /// The image reference for an index.
    #[must_use]
    pub fn image(&self, index: u32) -> SwapchainImage {
        SwapchainImage::new(self.swapchain, index)
    }

    /// Destroy the swapchain and its views.
    ///
    /// # Safety
    /// The device must be idle with respect to this swapchain.
    pub unsafe fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            for &view in &self.image_views {
                device.device().destroy_image_view(view, None);
            }
            device.swapchain_loader().destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired_width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired_height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}
