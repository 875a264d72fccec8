//! The queue facade clients submit through.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;

use crate::command::CommandList;
use crate::deferred::DeferredDeleter;
use crate::device::RawDevice;
use crate::error::Result;
use crate::handle::ObjectHandle;
use crate::inflight::InflightTracker;
use crate::log::LogSink;
use crate::submit::SubmissionContextBuilder;
use crate::submitter::{PresentInfo, PresentOutcome, SubmissionToken, SubmitMode, Submitter};
use crate::sync::{FencePool, SemaphorePool};

/// Submission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub mode: SubmitMode,
    /// Asynchronous submissions allowed to be outstanding at once.
    pub max_frames_in_flight: usize,
    /// Fence wait timeout in nanoseconds. Expiry is treated as a GPU hang.
    pub fence_timeout_ns: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: SubmitMode::Synchronous,
            max_frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
        }
    }
}

/// Builder for a [`GpuQueue`].
pub struct GpuQueueBuilder {
    device: Arc<dyn RawDevice>,
    config: QueueConfig,
    log: LogSink,
}

impl GpuQueueBuilder {
    /// Start from the default configuration.
    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        Self {
            device,
            config: QueueConfig::default(),
            log: LogSink::ambient(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how submissions complete.
    #[must_use]
    pub fn mode(mut self, mode: SubmitMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the number of asynchronous submissions allowed in flight.
    #[must_use]
    pub fn max_frames_in_flight(mut self, frames: usize) -> Self {
        self.config.max_frames_in_flight = frames.max(1);
        self
    }

    /// Set the fence wait timeout.
    #[must_use]
    pub fn fence_timeout(mut self, timeout: Duration) -> Self {
        self.config.fence_timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self
    }

    /// Route the queue's logs to an injected sink.
    #[must_use]
    pub fn log_sink(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Build the queue.
    pub fn build(self) -> Result<GpuQueue> {
        let Self {
            device,
            mut config,
            log,
        } = self;
        config.max_frames_in_flight = config.max_frames_in_flight.max(1);

        let fences = Arc::new(FencePool::new(device.clone()));
        let semaphores = Arc::new(SemaphorePool::new(device.clone()));
        let tracker = Arc::new(InflightTracker::new());
        let submitter = Submitter::new(
            device.clone(),
            fences.clone(),
            semaphores.clone(),
            tracker.clone(),
            config.mode,
            config.fence_timeout_ns,
            log.clone(),
        )?;
        let deleter = DeferredDeleter::new(device.clone(), tracker.clone());

        log.scope(|| {
            tracing::info!(
                "GPU queue ready: {:?} backend, {:?} submission, {} frames in flight",
                device.backend(),
                config.mode,
                config.max_frames_in_flight
            );
        });

        Ok(GpuQueue {
            device,
            fences,
            semaphores,
            tracker,
            deleter,
            submitter,
            config,
            inflight: Mutex::new(VecDeque::new()),
            log,
        })
    }
}

/// Submission, presentation and safe destruction for one device.
pub struct GpuQueue {
    device: Arc<dyn RawDevice>,
    fences: Arc<FencePool>,
    semaphores: Arc<SemaphorePool>,
    tracker: Arc<InflightTracker>,
    deleter: DeferredDeleter,
    submitter: Submitter,
    config: QueueConfig,
    /// Tokens of asynchronous submissions not known to be complete.
    inflight: Mutex<VecDeque<SubmissionToken>>,
    log: LogSink,
}

impl GpuQueue {
    /// Start building a queue for `device`.
    pub fn builder(device: Arc<dyn RawDevice>) -> GpuQueueBuilder {
        GpuQueueBuilder::new(device)
    }

    /// Submit command lists in order.
    ///
    /// With asynchronous submission this blocks only when
    /// `max_frames_in_flight` submissions are already outstanding.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, lists: &[CommandList]) -> Result<SubmissionToken> {
        self.throttle()?;
        let context = self
            .log
            .scope(|| SubmissionContextBuilder::new(&self.semaphores).build(lists))?;
        let token = self.submitter.submit(context)?;
        if !token.is_complete() {
            self.inflight.lock().push_back(token.clone());
        }
        Ok(token)
    }

    /// Join the oldest submissions until there is room for one more.
    fn throttle(&self) -> Result<()> {
        let mut inflight = self.inflight.lock();
        inflight.retain(|token| !token.is_complete());
        while inflight.len() >= self.config.max_frames_in_flight {
            if let Some(oldest) = inflight.pop_front() {
                self.log
                    .scope(|| tracing::trace!("Throttling on submission {}", oldest.serial()));
                oldest.wait()?;
            }
        }
        Ok(())
    }

    /// Present swapchain images after the work that rendered them.
    pub fn present(&self, info: &PresentInfo) -> Result<PresentOutcome> {
        self.submitter.present(info)
    }

    /// Whether an unfinished submission references the object.
    #[must_use]
    pub fn is_inflight(&self, handle: impl Into<ObjectHandle>) -> bool {
        self.tracker.is_inflight(handle)
    }

    /// Destroy the object as soon as no unfinished submission references it.
    ///
    /// Returns `true` when it was destroyed immediately.
    pub fn safe_destroy(&self, handle: impl Into<ObjectHandle>) -> bool {
        let handle = handle.into();
        self.log.scope(|| self.deleter.safe_destroy(handle))
    }

    /// Number of objects waiting for their submissions to finish.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deleter.pending_count()
    }

    /// Number of asynchronous submissions not yet joined or observed complete.
    #[must_use]
    pub fn inflight_submissions(&self) -> usize {
        let mut inflight = self.inflight.lock();
        inflight.retain(|token| !token.is_complete());
        inflight.len()
    }

    /// Idle the device, then join every outstanding submission.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()?;
        let tokens: Vec<SubmissionToken> = self.inflight.lock().drain(..).collect();
        for token in tokens {
            token.wait()?;
        }
        Ok(())
    }

    /// Idle the device and drop the present state of a swapchain about to be recreated.
    pub fn retire_swapchain(&self, swapchain: vk::SwapchainKHR) -> Result<()> {
        self.wait_idle()?;
        self.submitter.retire_swapchain(swapchain);
        Ok(())
    }

    /// Drain all work and release every primitive. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.submitter.is_shut_down() {
            return Ok(());
        }
        self.submitter.shutdown()?;
        self.inflight.lock().clear();
        self.log.scope(|| self.deleter.flush());
        Ok(())
    }

    /// The device this queue submits to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Configuration the queue was built with.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Fence pool; `outstanding()` counts fences of unfinished submissions.
    #[must_use]
    pub fn fences(&self) -> &FencePool {
        &self.fences
    }

    /// Pool that acquire semaphores should come from.
    #[must_use]
    pub fn semaphores(&self) -> &SemaphorePool {
        &self.semaphores
    }

    /// Objects referenced by unfinished submissions.
    #[must_use]
    pub fn tracker(&self) -> &InflightTracker {
        &self.tracker
    }

    /// The submitter, for queue selection and present state.
    #[must_use]
    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }
}

impl Drop for GpuQueue {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            self.log.scope(|| tracing::error!("GPU queue shutdown failed: {}", e));
        }
    }
}
