//! GPU memory management.
//!
//! Allocations are owned by the allocator and keyed by the object they back,
//! so destroying an object through [`crate::device::RawDevice::destroy_object`]
//! also returns its memory.

use crate::error::{GpuError, Result};
use crate::handle::{ObjectHandle, ObjectKind};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use std::sync::Arc;

/// A buffer created by [`GpuAllocator::create_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    allocations: HashMap<ObjectHandle, Allocation>,
}

fn allocation_error(e: gpu_allocator::AllocationError) -> GpuError {
    GpuError::AllocationFailed(e.to_string())
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(allocation_error)?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            allocations: HashMap::new(),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))
    }

    /// Create a buffer with bound memory.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error)
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        self.allocations.insert(buffer.into(), allocation);
        if let Err(e) = bound {
            self.free(buffer.into())?;
            return Err(e.into());
        }

        tracing::trace!("Created buffer {:?} '{}' ({} bytes)", buffer, name, size);
        Ok(GpuBuffer { buffer, size })
    }

    /// Copy typed data into a host-visible buffer.
    pub fn write<T: Pod>(&mut self, buffer: vk::Buffer, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let allocation = self
            .allocations
            .get_mut(&ObjectHandle::from(buffer))
            .ok_or_else(|| GpuError::InvalidState(format!("{buffer:?} has no allocation")))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState(format!("{buffer:?} is not host visible")))?;

        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("write offset overflows".to_string()))?;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= mapped.len())
            .ok_or_else(|| GpuError::InvalidState("data range too large for buffer".to_string()))?;
        mapped[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Whether the allocator backs the object.
    #[must_use]
    pub fn owns(&self, handle: ObjectHandle) -> bool {
        self.allocations.contains_key(&handle)
    }

    /// Destroy an allocated buffer and free its memory.
    ///
    /// Returns `false` when the object is not owned by this allocator.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<bool> {
        let Some(allocation) = self.allocations.remove(&handle) else {
            return Ok(false);
        };
        let freed = self.inner().and_then(|allocator| allocator.free(allocation).map_err(allocation_error));

        unsafe {
            match handle.kind() {
                ObjectKind::Buffer => self.device.destroy_buffer(handle.as_vk(), None),
                kind => tracing::warn!("Allocation recorded for unexpected {:?}", kind),
            }
        }
        freed.map(|()| true)
    }

    /// Free every remaining allocation and drop the allocator.
    ///
    /// Must be called before the device is destroyed.
    pub fn shutdown(&mut self) {
        let leaked: Vec<ObjectHandle> = self.allocations.keys().copied().collect();
        if !leaked.is_empty() {
            tracing::warn!("Freeing {} leaked GPU allocations", leaked.len());
        }
        for handle in leaked {
            if let Err(e) = self.free(handle) {
                tracing::error!("Failed to free {:?}: {}", handle, e);
            }
        }
        self.allocator.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
