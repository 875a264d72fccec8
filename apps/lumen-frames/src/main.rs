//! Lumen frame runner
//!
//! Drives frames through the submission core on the headless device and
//! reports pool and throttle statistics. With `--vulkan` it instead opens a
//! real device and runs one buffer copy through a queue built on it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lumen-frames -- [--vulkan]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `LUMEN_FRAMES`: Number of frames to run (default: 120)
//! - `LUMEN_FRAMES_IN_FLIGHT`: Frames-in-flight limit (default: 2)
//! - `LUMEN_SUBMIT_MODE`: `sync` or `async` (default: async)

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use ash::vk;
use gpu_allocator::MemoryLocation;
use lumen_gpu::{CommandEncoder, GpuQueue, ObjectHandle, SubmitKind, SubmitMode, VulkanDevice};
use lumen_test::{FrameHarness, HarnessConfig};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 120;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().any(|arg| arg == "--vulkan") {
        return check_vulkan();
    }

    let frames = env_or("LUMEN_FRAMES", DEFAULT_FRAMES)?;
    let frames_in_flight = env_or("LUMEN_FRAMES_IN_FLIGHT", 2usize)?;
    let mode = match std::env::var("LUMEN_SUBMIT_MODE").as_deref() {
        Ok("sync") => SubmitMode::Synchronous,
        Ok("async") | Err(_) => SubmitMode::Asynchronous,
        Ok(other) => bail!("LUMEN_SUBMIT_MODE must be `sync` or `async`, got `{other}`"),
    };

    let mut harness = FrameHarness::new(HarnessConfig {
        mode,
        frames_in_flight,
        ..HarnessConfig::default()
    })
    .context("failed to create frame harness")?;

    info!("Running {} frames ({:?}, {} in flight)", frames, mode, frames_in_flight);
    harness.run(frames).context("frame loop failed")?;

    let fences = harness.queue().fences().allocated();
    let semaphores = harness.queue().semaphores().allocated();
    let stats = harness.finish().context("failed to drain the queue")?;

    info!(
        "Done: {} frames, {} presents, {} recreations, peak deferred {}",
        stats.frames, stats.presents, stats.recreations, stats.peak_deferred
    );
    info!("Pools: {} fences, {} semaphores allocated", fences, semaphores);
    Ok(())
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} is not a valid number: `{value}`")),
        Err(_) => Ok(default),
    }
}

fn check_vulkan() -> anyhow::Result<()> {
    let device = Arc::new(
        VulkanDevice::builder()
            .app_name("Lumen Frames")
            .build()
            .context("failed to open a Vulkan device")?,
    );
    info!("Opened {}", device.name());

    let queue = GpuQueue::builder(device).build()?;
    for family in queue.submitter().queues().families() {
        info!(
            "Family {}: {:?} x{}",
            family.index, family.capabilities, family.queue_count
        );
    }

    let result = copy_round_trip(&queue);
    queue.wait_idle()?;
    queue.shutdown()?;
    result
}

/// Upload a few words, copy them within the buffer on the GPU and destroy the
/// buffer through the queue once the copy is done.
fn copy_round_trip(queue: &GpuQueue) -> anyhow::Result<()> {
    let vulkan = queue
        .device()
        .as_vulkan()
        .context("queue is not backed by a Vulkan device")?;
    let family = queue
        .submitter()
        .queues()
        .queue_for(SubmitKind::Transfer.required_capabilities())?
        .family;

    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { vulkan.device().create_command_pool(&pool_info, None)? };

    let result = submit_copy(queue, vulkan, pool);
    queue.wait_idle()?;
    unsafe { vulkan.device().destroy_command_pool(pool, None) };
    let bytes = result?;
    info!("Copied {} bytes on queue family {}", bytes, family);
    Ok(())
}

fn submit_copy(queue: &GpuQueue, vulkan: &VulkanDevice, pool: vk::CommandPool) -> anyhow::Result<u64> {
    let device = vulkan.device();
    let words: [u32; 4] = [1, 2, 3, 4];
    let half = std::mem::size_of_val(&words) as u64;

    let upload = vulkan.allocator().lock().create_buffer(
        half * 2,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::CpuToGpu,
        "frame-upload",
    )?;
    let written = vulkan.allocator().lock().write(upload.buffer, 0, &words);
    if let Err(e) = written {
        queue.safe_destroy(upload.buffer);
        return Err(e.into());
    }

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let region = vk::BufferCopy::default().dst_offset(half).size(half);
    let recorded = unsafe {
        device.allocate_command_buffers(&alloc_info).and_then(|buffers| {
            let cmd = buffers[0];
            device.begin_command_buffer(cmd, &begin_info)?;
            device.cmd_copy_buffer(cmd, upload.buffer, upload.buffer, &[region]);
            device.end_command_buffer(cmd)?;
            Ok(cmd)
        })
    };
    let cmd = match recorded {
        Ok(cmd) => cmd,
        Err(e) => {
            queue.safe_destroy(upload.buffer);
            return Err(e.into());
        }
    };

    let mut encoder = CommandEncoder::new(cmd);
    encoder.copy_buffer_to_buffer(upload.buffer, upload.buffer);
    let token = queue.submit(&[encoder.finish()]);

    // Freed now or when the copy's fence signals.
    if !queue.safe_destroy(upload.buffer) {
        debug!("Upload buffer deferred until the copy completes");
    }
    token?.wait()?;

    if vulkan.allocator().lock().owns(ObjectHandle::from(upload.buffer)) {
        bail!("upload buffer still allocated after its copy completed");
    }
    Ok(half)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gpu::HeadlessDevice;

    #[test]
    fn copy_needs_a_vulkan_backed_queue() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = GpuQueue::builder(device.clone()).build().unwrap();

        let err = copy_round_trip(&queue).unwrap_err();
        assert!(err.to_string().contains("not backed by a Vulkan device"));
        assert!(device.submits().is_empty());
        queue.shutdown().unwrap();
    }

    #[test]
    fn env_or_falls_back_to_the_default() {
        assert_eq!(env_or("LUMEN_FRAMES_UNSET_FOR_TEST", 7u64).unwrap(), 7);
    }
}
