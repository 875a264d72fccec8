//! Command submission and synchronization core of Lumen.
//!
//! This crate provides:
//! - Conversion of recorded command lists into ordered, semaphore-chained batches
//! - Tracking of GPU objects referenced by unfinished work
//! - Fence and semaphore pools with reuse only after GPU completion
//! - Deferred destruction of objects that are still in flight
//! - Presentation chained per swapchain image to the work that rendered it
//! - A Vulkan backend (`ash`, `gpu-allocator`) and an in-process headless backend

pub mod command;
pub mod deferred;
pub mod device;
pub mod error;
pub mod family;
pub mod handle;
pub mod headless;
pub mod inflight;
pub mod log;
pub mod queue;
pub mod submit;
pub mod submitter;
pub mod sync;
pub mod vulkan;

pub use command::{BindGroup, Command, CommandEncoder, CommandList, SwapchainImage};
pub use deferred::DeferredDeleter;
pub use device::{Backend, NativePresent, NativeSubmit, RawDevice};
pub use error::{GpuError, Result};
pub use family::{QueueCapabilities, QueueFamily, QueueSet};
pub use handle::{ObjectHandle, ObjectKind, ObjectSet};
pub use headless::HeadlessDevice;
pub use inflight::{InflightEvent, InflightTracker, SubscriptionId};
pub use log::LogSink;
pub use queue::{GpuQueue, GpuQueueBuilder, QueueConfig};
pub use submit::{SubmissionContext, SubmissionContextBuilder, Submit, SubmitKind};
pub use submitter::{PresentInfo, PresentOutcome, SubmissionToken, SubmitMode, Submitter};
pub use sync::{FencePool, SemaphorePool};
pub use vulkan::{AcquiredImage, GpuAllocator, Swapchain, VulkanDevice, VulkanDeviceBuilder};
