//! Headless frame loop.
//!
//! Each frame acquires a swapchain image, records a compute list that fills a
//! transient buffer and a render list that draws from it into the image,
//! submits both, hands the transient buffer to deferred destruction and
//! presents. Nothing blocks on the GPU between frames except the
//! frames-in-flight throttle.

use std::sync::Arc;

use ash::vk;
use lumen_gpu::{
    AcquiredImage, BindGroup, CommandEncoder, CommandList, GpuQueue, HeadlessDevice, PresentInfo,
    SemaphorePool, SubmissionToken, SubmitMode, SwapchainImage,
};

use crate::{Result, TestError};

/// Frame loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    pub mode: SubmitMode,
    pub frames_in_flight: usize,
    pub swapchain_images: u32,
    /// Leave fences unsignaled until the test completes them.
    pub manual_completion: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: SubmitMode::Asynchronous,
            frames_in_flight: 2,
            swapchain_images: 3,
            manual_completion: false,
        }
    }
}

/// A swapchain whose images come back in round-robin order.
pub struct HeadlessSwapchain {
    handle: vk::SwapchainKHR,
    image_count: u32,
    next: u32,
}

impl HeadlessSwapchain {
    pub fn new(device: &HeadlessDevice, image_count: u32) -> Self {
        Self {
            handle: device.create_handle(),
            image_count,
            next: 0,
        }
    }

    #[must_use]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[must_use]
    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    /// Hand out the next image and signal a pool semaphore for it.
    pub fn acquire(
        &mut self,
        device: &HeadlessDevice,
        semaphores: &SemaphorePool,
    ) -> lumen_gpu::Result<AcquiredImage> {
        let semaphore = semaphores.create()?;
        if let Err(e) = device.signal_semaphore(semaphore) {
            semaphores.discard(semaphore);
            return Err(e);
        }

        let target = SwapchainImage::new(self.handle, self.next);
        self.next = (self.next + 1) % self.image_count;
        Ok(AcquiredImage {
            target,
            semaphore,
            suboptimal: false,
        })
    }
}

/// What happened during one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub target: SwapchainImage,
    pub token: SubmissionToken,
    /// The per-frame buffer handed to deferred destruction.
    pub transient: vk::Buffer,
    pub destroyed_immediately: bool,
    pub suboptimal: bool,
    /// The present was rejected and the swapchain recreated.
    pub recreated: bool,
}

/// Totals over the harness' lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub presents: u64,
    pub recreations: u64,
    pub peak_deferred: usize,
}

/// Drives frames through a [`GpuQueue`] on a headless device.
pub struct FrameHarness {
    device: Arc<HeadlessDevice>,
    queue: GpuQueue,
    swapchain: HeadlessSwapchain,
    config: HarnessConfig,
    staging: vk::Buffer,
    descriptor_set: vk::DescriptorSet,
    compute_pipeline: vk::Pipeline,
    graphics_pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    /// One framebuffer and view per swapchain image.
    framebuffers: Vec<(vk::Framebuffer, vk::ImageView)>,
    stats: RunStats,
}

impl FrameHarness {
    /// Create a harness with its own headless device.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        if config.swapchain_images == 0 {
            return Err(TestError::InvalidConfig("swapchain needs at least one image".into()));
        }
        if config.frames_in_flight == 0 {
            return Err(TestError::InvalidConfig("frames in flight must be at least 1".into()));
        }

        let device = Arc::new(HeadlessDevice::new());
        device.set_manual_completion(config.manual_completion);
        let queue = GpuQueue::builder(device.clone())
            .mode(config.mode)
            .max_frames_in_flight(config.frames_in_flight)
            .build()?;
        let swapchain = HeadlessSwapchain::new(&device, config.swapchain_images);
        let framebuffers = Self::create_framebuffers(&device, config.swapchain_images);

        tracing::debug!("Frame harness ready: {:?}", config);

        Ok(Self {
            staging: device.create_handle(),
            descriptor_set: device.create_handle(),
            compute_pipeline: device.create_handle(),
            graphics_pipeline: device.create_handle(),
            layout: device.create_handle(),
            render_pass: device.create_handle(),
            device,
            queue,
            swapchain,
            config,
            framebuffers,
            stats: RunStats::default(),
        })
    }

    fn create_framebuffers(device: &HeadlessDevice, count: u32) -> Vec<(vk::Framebuffer, vk::ImageView)> {
        (0..count)
            .map(|_| (device.create_handle(), device.create_handle()))
            .collect()
    }

    #[must_use]
    pub fn device(&self) -> &Arc<HeadlessDevice> {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &GpuQueue {
        &self.queue
    }

    #[must_use]
    pub fn swapchain(&self) -> &HeadlessSwapchain {
        &self.swapchain
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn record(&self, acquired: AcquiredImage, transient: vk::Buffer) -> [CommandList; 2] {
        let target = acquired.target;
        let (framebuffer, view) = self.framebuffers[target.index as usize];

        let mut compute = CommandEncoder::new(self.device.create_handle());
        compute
            .copy_buffer_to_buffer(self.staging, transient)
            .compute_pass(|pass| {
                pass.set_pipeline(self.compute_pipeline, self.layout)
                    .set_bind_group(BindGroup {
                        set: self.descriptor_set,
                        resources: vec![transient.into()],
                    })
                    .dispatch(16, 16, 1);
            });

        let mut render = CommandEncoder::new(self.device.create_handle());
        render
            .acquire_image(target, acquired.semaphore, true)
            .render_pass(self.render_pass, framebuffer, &[view], |pass| {
                pass.set_pipeline(self.graphics_pipeline, self.layout)
                    .set_vertex_buffer(transient)
                    .draw(3, 1);
            })
            .present(target, None);

        [compute.finish(), render.finish()]
    }

    /// Run one frame.
    pub fn render_frame(&mut self) -> Result<FrameReport> {
        let acquired = self
            .swapchain
            .acquire(&self.device, self.queue.semaphores())?;
        let target = acquired.target;
        let transient: vk::Buffer = self.device.create_handle();

        let lists = self.record(acquired, transient);
        let token = self.queue.submit(&lists)?;
        let destroyed_immediately = self.queue.safe_destroy(transient);

        let (suboptimal, recreated) = match self.queue.present(&PresentInfo::single(target)) {
            Ok(outcome) => (outcome.suboptimal, false),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Present of image {} failed ({}), recreating swapchain", target.index, e);
                self.recreate_swapchain()?;
                (false, true)
            }
            Err(e) => return Err(e.into()),
        };

        self.stats.frames += 1;
        if !recreated {
            self.stats.presents += 1;
        }
        self.stats.peak_deferred = self.stats.peak_deferred.max(self.queue.deferred_count());

        Ok(FrameReport {
            target,
            token,
            transient,
            destroyed_immediately,
            suboptimal,
            recreated,
        })
    }

    /// Run several frames.
    pub fn run(&mut self, frames: u64) -> Result<RunStats> {
        for _ in 0..frames {
            self.render_frame()?;
        }
        Ok(self.stats)
    }

    /// Replace the swapchain after the device went idle.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        let old = self.swapchain.handle();
        self.queue.retire_swapchain(old)?;

        for (framebuffer, view) in std::mem::take(&mut self.framebuffers) {
            self.queue.safe_destroy(framebuffer);
            self.queue.safe_destroy(view);
        }
        self.swapchain = HeadlessSwapchain::new(&self.device, self.config.swapchain_images);
        self.framebuffers = Self::create_framebuffers(&self.device, self.config.swapchain_images);
        self.stats.recreations += 1;

        tracing::debug!("Swapchain {:?} replaced by {:?}", old, self.swapchain.handle());
        Ok(())
    }

    /// Drain all work and tear the queue down.
    pub fn finish(self) -> Result<RunStats> {
        self.queue.wait_idle()?;
        self.queue.shutdown()?;
        Ok(self.stats)
    }
}
