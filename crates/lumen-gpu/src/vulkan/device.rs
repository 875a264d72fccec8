//! The `ash` backed device.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::instance::{create_instance, select_physical_device};
use super::memory::GpuAllocator;
use crate::device::{Backend, NativePresent, NativeSubmit, RawDevice};
use crate::error::{GpuError, Result};
use crate::family::{QueueCapabilities, QueueFamily};
use crate::handle::{ObjectHandle, ObjectKind};

/// A logical Vulkan device with one queue per family.
pub struct VulkanDevice {
    // Keeps the loaded library alive.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    families: Vec<QueueFamily>,
    allocator: Mutex<GpuAllocator>,
    name: String,
}

impl VulkanDevice {
    /// Start building a device.
    pub fn builder() -> VulkanDeviceBuilder {
        VulkanDeviceBuilder::new()
    }

    /// The logical device, for recording command buffers and creating objects.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The instance the device was created from.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The selected adapter.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// `VK_KHR_swapchain` entry points.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Memory allocator for buffers and images.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Name of the selected physical device.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RawDevice for VulkanDevice {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    fn as_vulkan(&self) -> Option<&VulkanDevice> {
        Some(self)
    }

    fn queue_families(&self) -> Vec<QueueFamily> {
        self.families.clone()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[NativeSubmit<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        let infos: Vec<vk::SubmitInfo<'_>> = submits
            .iter()
            .map(|submit| {
                vk::SubmitInfo::default()
                    .wait_semaphores(submit.wait_semaphores)
                    .wait_dst_stage_mask(submit.wait_stages)
                    .command_buffers(submit.command_buffers)
                    .signal_semaphores(submit.signal_semaphores)
            })
            .collect();
        unsafe { self.device.queue_submit(queue, &infos, fence)? };
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn queue_present(&self, queue: vk::Queue, present: &NativePresent<'_>) -> Result<bool> {
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(present.wait_semaphores)
            .swapchains(present.swapchains)
            .image_indices(present.image_indices);
        Ok(unsafe { self.swapchain_loader.queue_present(queue, &info)? })
    }

    fn destroy_object(&self, handle: ObjectHandle) {
        let device = &self.device;
        unsafe {
            match handle.kind() {
                ObjectKind::Buffer => match self.allocator.lock().free(handle) {
                    Ok(true) => {}
                    Ok(false) => device.destroy_buffer(handle.as_vk(), None),
                    Err(e) => tracing::error!("Failed to free {:?}: {}", handle, e),
                },
                ObjectKind::Image => device.destroy_image(handle.as_vk(), None),
                ObjectKind::ImageView => device.destroy_image_view(handle.as_vk(), None),
                ObjectKind::Sampler => device.destroy_sampler(handle.as_vk(), None),
                ObjectKind::Pipeline => device.destroy_pipeline(handle.as_vk(), None),
                ObjectKind::PipelineLayout => device.destroy_pipeline_layout(handle.as_vk(), None),
                ObjectKind::Framebuffer => device.destroy_framebuffer(handle.as_vk(), None),
                ObjectKind::RenderPass => device.destroy_render_pass(handle.as_vk(), None),
                ObjectKind::Semaphore => device.destroy_semaphore(handle.as_vk(), None),
                // Pool-allocated; they go back with their pool.
                ObjectKind::DescriptorSet | ObjectKind::CommandBuffer => {
                    tracing::trace!("{:?} is released with its pool", handle);
                }
            }
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("Device idle wait failed during teardown: {}", e);
            }
            // Memory must go before the device does.
            self.allocator.lock().shutdown();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a [`VulkanDevice`].
pub struct VulkanDeviceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl VulkanDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Create the instance, pick a GPU and open a device on it.
    pub fn build(self) -> Result<VulkanDevice> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation)? };

        match unsafe { Self::open(&instance) } {
            Ok(parts) => Ok(parts.finish(entry, instance)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn open(instance: &ash::Instance) -> Result<OpenedDevice> {
        let physical_device = unsafe { select_physical_device(instance)? };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let families = unsafe { query_families(instance, physical_device) };
        if !families
            .iter()
            .any(|family| family.capabilities.contains(QueueCapabilities::GRAPHICS))
        {
            return Err(GpuError::NoSuitableDevice);
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let has_swapchain = extensions.iter().any(|ext| {
            ext.extension_name_as_c_str()
                .is_ok_and(|ext| ext == ash::khr::swapchain::NAME)
        });
        if !has_swapchain {
            return Err(GpuError::ExtensionNotSupported(
                ash::khr::swapchain::NAME.to_string_lossy().into_owned(),
            ));
        }

        let priority = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.index)
                    .queue_priorities(&priority)
            })
            .collect();
        let extension_names = [ash::khr::swapchain::NAME.as_ptr()];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names);

        let device = Arc::new(unsafe { instance.create_device(physical_device, &device_info, None)? });
        let allocator = match unsafe { GpuAllocator::new(instance, device.clone(), physical_device) } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        tracing::info!("Selected GPU: {} ({} queue families)", name, families.len());

        Ok(OpenedDevice {
            physical_device,
            device,
            swapchain_loader,
            families,
            allocator,
            name,
        })
    }
}

struct OpenedDevice {
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    families: Vec<QueueFamily>,
    allocator: GpuAllocator,
    name: String,
}

impl OpenedDevice {
    fn finish(self, entry: ash::Entry, instance: ash::Instance) -> VulkanDevice {
        VulkanDevice {
            entry,
            instance,
            physical_device: self.physical_device,
            device: self.device,
            swapchain_loader: self.swapchain_loader,
            families: self.families,
            allocator: Mutex::new(self.allocator),
            name: self.name,
        }
    }
}

/// Describe every queue family of the physical device.
///
/// Presentation support depends on a surface, which is not known here;
/// graphics families are treated as present-capable.
unsafe fn query_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Vec<QueueFamily> {
    let properties = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    properties
        .iter()
        .zip(0u32..)
        .filter(|(family, _)| family.queue_count > 0)
        .map(|(family, index)| {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            QueueFamily {
                index,
                capabilities: QueueCapabilities::from_vk(family.queue_flags, graphics),
                queue_count: family.queue_count,
            }
        })
        .collect()
}
