//! Issuing batches to hardware queues and presenting swapchain images.
//!
//! The [`Submitter`] owns the queues and the per-swapchain-image present
//! state. A render submission that finishes image N leaves the semaphore it
//! signals pending for N; the next present of N waits on it. Completion of a
//! submission is observed through one fence, either on the calling thread or
//! on a background fence-waiter thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ash::vk;
use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};

use crate::command::SwapchainImage;
use crate::device::{NativePresent, NativeSubmit, RawDevice};
use crate::error::{GpuError, Result};
use crate::family::{QueueCapabilities, QueueSet, QueueSlot};
use crate::inflight::InflightTracker;
use crate::log::LogSink;
use crate::submit::{PresentSignal, SubmissionContext, CHAIN_WAIT_STAGE};
use crate::sync::{FencePool, SemaphorePool};

/// How a submit call observes completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubmitMode {
    /// Block the caller until the submission's fence signals.
    #[default]
    Synchronous,
    /// Return immediately; a background thread waits on the fence.
    Asynchronous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenStatus {
    Pending,
    Complete,
    Failed(String),
}

struct TokenState {
    serial: u64,
    status: Mutex<TokenStatus>,
    done: Condvar,
}

/// Completion handle of one submit call.
#[derive(Clone)]
pub struct SubmissionToken {
    state: Arc<TokenState>,
}

impl SubmissionToken {
    fn new(serial: u64, status: TokenStatus) -> Self {
        Self {
            state: Arc::new(TokenState {
                serial,
                status: Mutex::new(status),
                done: Condvar::new(),
            }),
        }
    }

    fn finish(&self, status: TokenStatus) {
        *self.state.status.lock() = status;
        self.state.done.notify_all();
    }

    /// Submission serial, increasing with every submit call.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.state.serial
    }

    /// Whether the submission finished and its primitives were recycled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.state.status.lock() != TokenStatus::Pending
    }

    /// Block until the submission finished.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.state.status.lock();
        while *status == TokenStatus::Pending {
            self.state.done.wait(&mut status);
        }
        match &*status {
            TokenStatus::Failed(reason) => Err(GpuError::FenceWaitFailed(reason.clone())),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for SubmissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionToken")
            .field("serial", &self.state.serial)
            .field("status", &*self.state.status.lock())
            .finish()
    }
}

/// A present request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentInfo {
    /// Images to present, at most one per swapchain.
    pub targets: Vec<SwapchainImage>,
    /// Extra semaphores the present waits on.
    pub wait_semaphores: Vec<vk::Semaphore>,
}

impl PresentInfo {
    /// Present a single image.
    #[must_use]
    pub fn single(target: SwapchainImage) -> Self {
        Self {
            targets: vec![target],
            wait_semaphores: Vec::new(),
        }
    }
}

/// Result of a successful present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentOutcome {
    /// The swapchain no longer matches the surface exactly and should be recreated.
    pub suboptimal: bool,
}

#[derive(Default)]
struct PresentState {
    /// Semaphore of the latest submission that finished each image.
    pending: HashMap<SwapchainImage, PresentSignal>,
    /// Pool semaphores consumed by a present, reusable once the image comes back.
    retired: HashMap<SwapchainImage, Vec<vk::Semaphore>>,
}

struct Shared {
    device: Arc<dyn RawDevice>,
    fences: Arc<FencePool>,
    semaphores: Arc<SemaphorePool>,
    tracker: Arc<InflightTracker>,
    fence_timeout_ns: u64,
}

/// Work to do once a submission's fence signals.
struct Retirement {
    fence: vk::Fence,
    recycle: Vec<vk::Semaphore>,
    token: SubmissionToken,
}

impl Shared {
    /// Wait for the fence, then clear the record and recycle the primitives.
    fn retire(&self, retirement: Retirement) -> Result<()> {
        let Retirement {
            fence,
            recycle,
            token,
        } = retirement;

        let waited = {
            let _span = tracing::trace_span!("fence_wait", serial = token.serial()).entered();
            self.device.wait_for_fence(fence, self.fence_timeout_ns)
        };
        if let Err(e) = waited {
            let reason = format!("submission {} did not complete: {e}", token.serial());
            tracing::error!("{}", reason);
            // The record stays, so nothing it protects is ever destroyed.
            token.finish(TokenStatus::Failed(reason.clone()));
            return Err(GpuError::FenceWaitFailed(reason));
        }

        self.tracker.clear(fence);
        if let Err(e) = self.device.reset_fence(fence) {
            tracing::warn!("Failed to reset fence {:?}: {}", fence, e);
            self.fences.discard(fence);
        } else {
            self.fences.release(fence);
        }
        for semaphore in recycle {
            self.semaphores.release(semaphore);
        }

        tracing::trace!("Submission {} retired", token.serial());
        token.finish(TokenStatus::Complete);
        Ok(())
    }
}

enum WaiterRequest {
    Retire(Retirement),
    Shutdown,
}

/// Background thread retiring submissions in order.
struct FenceWaiter {
    sender: Sender<WaiterRequest>,
    thread: Option<JoinHandle<()>>,
}

impl FenceWaiter {
    fn spawn(shared: Arc<Shared>, log: LogSink) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<WaiterRequest>();
        let thread = thread::Builder::new()
            .name("lumen-fence-waiter".into())
            .spawn(move || log.scope(|| Self::run(&shared, &receiver)))
            .map_err(|e| GpuError::Other(format!("failed to spawn fence waiter: {e}")))?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    fn run(shared: &Shared, receiver: &Receiver<WaiterRequest>) {
        tracing::debug!("Fence waiter started");
        loop {
            match receiver.recv() {
                Ok(WaiterRequest::Retire(retirement)) => {
                    // Failures are reported through the token.
                    let _ = shared.retire(retirement);
                }
                Ok(WaiterRequest::Shutdown) | Err(_) => break,
            }
        }
        tracing::debug!("Fence waiter stopped");
    }

    fn send(&self, retirement: Retirement) -> Result<()> {
        self.sender
            .send(WaiterRequest::Retire(retirement))
            .map_err(|_| GpuError::InvalidState("fence waiter is not running".into()))
    }

    /// Retire everything queued so far, then stop the thread.
    fn stop(&mut self) {
        let _ = self.sender.send(WaiterRequest::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Fence waiter thread panicked");
            }
        }
    }
}

/// Issues submission contexts to hardware queues and presents images.
pub struct Submitter {
    shared: Arc<Shared>,
    queues: QueueSet,
    mode: SubmitMode,
    present: Mutex<PresentState>,
    waiter: Mutex<Option<FenceWaiter>>,
    log: LogSink,
    next_serial: AtomicU64,
    shut_down: Mutex<bool>,
}

/// Consecutive batches sharing a queue go into one native call.
struct QueueGroup {
    slot: QueueSlot,
    batches: std::ops::Range<usize>,
}

impl Submitter {
    /// Create a submitter over the device's queues.
    pub fn new(
        device: Arc<dyn RawDevice>,
        fences: Arc<FencePool>,
        semaphores: Arc<SemaphorePool>,
        tracker: Arc<InflightTracker>,
        mode: SubmitMode,
        fence_timeout_ns: u64,
        log: LogSink,
    ) -> Result<Self> {
        log.scope(|| {
            let queues = QueueSet::new(device.as_ref())?;
            let shared = Arc::new(Shared {
                device,
                fences,
                semaphores,
                tracker,
                fence_timeout_ns,
            });
            let waiter = match mode {
                SubmitMode::Asynchronous => Some(FenceWaiter::spawn(shared.clone(), log.clone())?),
                SubmitMode::Synchronous => None,
            };
            tracing::debug!("Submitter ready ({:?})", mode);

            Ok(Self {
                shared,
                queues,
                mode,
                present: Mutex::new(PresentState::default()),
                waiter: Mutex::new(waiter),
                log: log.clone(),
                next_serial: AtomicU64::new(1),
                shut_down: Mutex::new(false),
            })
        })
    }

    /// How submit calls observe completion.
    #[must_use]
    pub fn mode(&self) -> SubmitMode {
        self.mode
    }

    /// Queues selected per capability.
    #[must_use]
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Whether `shutdown` already ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.lock()
    }

    /// Number of images with a present signal nobody consumed yet.
    #[must_use]
    pub fn pending_present_count(&self) -> usize {
        self.present.lock().pending.len()
    }

    /// The semaphore the next present of `target` will wait on.
    #[must_use]
    pub fn pending_present(&self, target: SwapchainImage) -> Option<vk::Semaphore> {
        self.present
            .lock()
            .pending
            .get(&target)
            .map(|signal| signal.semaphore)
    }

    /// Issue a submission context.
    ///
    /// In synchronous mode the returned token is already complete.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, context: SubmissionContext) -> Result<SubmissionToken> {
        self.log.scope(|| {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let _span = tracing::trace_span!("submit", serial).entered();

            if self.is_shut_down() {
                self.discard_context(&context);
                return Err(GpuError::InvalidState("submitter is shut down".into()));
            }
            if context.is_empty() {
                return Ok(SubmissionToken::new(serial, TokenStatus::Complete));
            }

            let retirement = self.issue(context, serial)?;
            let token = retirement.token.clone();
            match self.mode {
                SubmitMode::Synchronous => self.shared.retire(retirement)?,
                SubmitMode::Asynchronous => {
                    let waiter = self.waiter.lock();
                    match waiter.as_ref() {
                        Some(waiter) => waiter.send(retirement)?,
                        None => self.shared.retire(retirement)?,
                    }
                }
            }
            Ok(token)
        })
    }

    /// Resolve queues, wire present state and call the device.
    fn issue(&self, mut context: SubmissionContext, serial: u64) -> Result<Retirement> {
        let slots = match context
            .batches()
            .iter()
            .map(|batch| self.queues.queue_for(batch.kind().required_capabilities()))
            .collect::<Result<Vec<_>>>()
        {
            Ok(slots) => slots,
            Err(e) => {
                self.discard_context(&context);
                return Err(e);
            }
        };

        // Held until the record of this submission is final, so a concurrent
        // present cannot consume a semaphore this submission replaces.
        let mut present = self.present.lock();

        let mut recycle: Vec<vk::Semaphore> = context.recycle().to_vec();
        let mut stale: Vec<SwapchainImage> = Vec::new();
        // Present signals of earlier batches of this context, by image.
        let mut earlier: HashMap<SwapchainImage, PresentSignal> = HashMap::new();
        for batch in context.batches_mut() {
            let Some(target) = batch.target() else {
                continue;
            };
            let first = !earlier.contains_key(&target);
            let previous = match earlier.get(&target) {
                Some(signal) => Some(*signal),
                None => present.pending.get(&target).copied(),
            };
            if let Some(previous) = previous {
                tracing::debug!(
                    "Image {} of {:?} resubmitted before present, consuming {:?}",
                    target.index,
                    target.swapchain,
                    previous.semaphore
                );
                batch.add_wait(previous.semaphore, CHAIN_WAIT_STAGE);
                if previous.pooled {
                    recycle.push(previous.semaphore);
                }
                if first {
                    stale.push(target);
                }
            }
            if first {
                if let Some(retired) = present.retired.get(&target) {
                    recycle.extend(retired.iter().copied());
                }
            }
            if let Some(signal) = batch.present_signal() {
                earlier.insert(target, signal);
            }
        }

        let fence = match self.shared.fences.create() {
            Ok(fence) => fence,
            Err(e) => {
                self.discard_context(&context);
                return Err(e);
            }
        };

        let (batches, objects, _) = context.into_parts();
        let present_signals: Vec<(SwapchainImage, PresentSignal)> = batches
            .iter()
            .filter_map(|batch| Some((batch.target()?, batch.present_signal()?)))
            .collect();
        let owned: HashSet<vk::Semaphore> = batches
            .iter()
            .flat_map(|batch| batch.signals().iter().copied())
            .chain(recycle.iter().copied())
            .filter(|&semaphore| self.shared.semaphores.is_checked_out(semaphore))
            .collect();

        self.shared.tracker.add(fence, objects);

        let waits: Vec<_> = batches.iter().map(|batch| batch.wait_arrays()).collect();
        let natives: Vec<NativeSubmit<'_>> = batches
            .iter()
            .zip(&waits)
            .map(|(batch, (semaphores, stages))| NativeSubmit {
                command_buffers: batch.command_buffers(),
                wait_semaphores: semaphores,
                wait_stages: stages,
                signal_semaphores: batch.signals(),
            })
            .collect();

        let groups = group_by_queue(&slots);
        let last = groups.len() - 1;
        for (i, group) in groups.iter().enumerate() {
            let group_fence = if i == last { fence } else { vk::Fence::null() };
            tracing::trace!(
                "Submitting {} batches to queue family {}",
                group.batches.len(),
                group.slot.family
            );
            let submitted = self.shared.device.queue_submit(
                group.slot.queue,
                &natives[group.batches.clone()],
                group_fence,
            );
            if let Err(e) = submitted {
                tracing::error!("Submission {} rejected: {}", serial, e);
                if i > 0 {
                    // Earlier calls reference the record; wait them out.
                    if let Err(idle) = self.shared.device.wait_idle() {
                        tracing::error!("Device idle wait failed after rejection: {}", idle);
                    }
                }
                self.shared.tracker.clear(fence);
                self.shared.fences.release(fence);
                for &semaphore in &owned {
                    self.shared.semaphores.discard(semaphore);
                }
                for (target, _) in &present_signals {
                    present.retired.remove(target);
                    if stale.contains(target)
                        && present.pending.get(target).is_some_and(|signal| signal.pooled)
                    {
                        present.pending.remove(target);
                    }
                }
                return Err(GpuError::SubmissionFailed(e.to_string()));
            }
        }

        for (target, signal) in present_signals {
            present.retired.remove(&target);
            present.pending.insert(target, signal);
        }

        Ok(Retirement {
            fence,
            recycle,
            token: SubmissionToken::new(serial, TokenStatus::Pending),
        })
    }

    /// Return the context's pool semaphores after it was refused before any native call.
    fn discard_context(&self, context: &SubmissionContext) {
        let pool = &self.shared.semaphores;
        let pooled_signals = context
            .batches()
            .iter()
            .flat_map(|batch| batch.signals().iter().copied());
        // Acquire semaphores may carry a pending signal, so nothing is reused.
        for semaphore in pooled_signals.chain(context.recycle().iter().copied()) {
            if pool.is_checked_out(semaphore) {
                pool.discard(semaphore);
            }
        }
    }

    /// Present swapchain images, waiting on the work that finished them.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&self, info: &PresentInfo) -> Result<PresentOutcome> {
        self.log.scope(|| {
            let _span = tracing::trace_span!("present", targets = info.targets.len()).entered();
            if self.is_shut_down() {
                return Err(GpuError::InvalidState("submitter is shut down".into()));
            }
            if info.targets.is_empty() {
                return Ok(PresentOutcome::default());
            }
            let mut seen = HashSet::with_capacity(info.targets.len());
            if let Some(target) = info.targets.iter().find(|target| !seen.insert(target.swapchain)) {
                return Err(GpuError::InvalidState(format!(
                    "swapchain {:?} appears more than once in one present",
                    target.swapchain
                )));
            }

            let slot = self.queues.queue_for(QueueCapabilities::PRESENT)?;
            let mut present = self.present.lock();

            let mut waits = info.wait_semaphores.clone();
            for target in &info.targets {
                if let Some(signal) = present.pending.get(target) {
                    waits.push(signal.semaphore);
                }
            }
            let swapchains: Vec<vk::SwapchainKHR> =
                info.targets.iter().map(|target| target.swapchain).collect();
            let indices: Vec<u32> = info.targets.iter().map(|target| target.index).collect();

            let result = self.shared.device.queue_present(
                slot.queue,
                &NativePresent {
                    wait_semaphores: &waits,
                    swapchains: &swapchains,
                    image_indices: &indices,
                },
            );

            let outcome = match result {
                Ok(suboptimal) => Ok(PresentOutcome { suboptimal }),
                Err(GpuError::Vulkan(
                    code @ (vk::Result::ERROR_OUT_OF_DATE_KHR
                    | vk::Result::ERROR_SURFACE_LOST_KHR
                    | vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT),
                )) => {
                    tracing::warn!("Present rejected: {}", code);
                    Err(GpuError::PresentFailed(code.to_string()))
                }
                // Nothing was enqueued, so the pending signals stay.
                Err(e) => return Err(e),
            };

            for target in &info.targets {
                if let Some(signal) = present.pending.remove(target) {
                    if signal.pooled {
                        present.retired.entry(*target).or_default().push(signal.semaphore);
                    }
                }
            }
            outcome
        })
    }

    /// Forget the present state of a swapchain that is being recreated.
    ///
    /// The caller must have idled the device first.
    pub fn retire_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.log.scope(|| {
            let mut present = self.present.lock();
            let pool = &self.shared.semaphores;

            let retired: Vec<SwapchainImage> = present
                .retired
                .keys()
                .filter(|image| image.swapchain == swapchain)
                .copied()
                .collect();
            for image in retired {
                for semaphore in present.retired.remove(&image).unwrap_or_default() {
                    pool.release(semaphore);
                }
            }

            // Signaled but never waited: unusable for a new signal.
            let pending: Vec<SwapchainImage> = present
                .pending
                .keys()
                .filter(|image| image.swapchain == swapchain)
                .copied()
                .collect();
            for image in pending {
                if let Some(signal) = present.pending.remove(&image) {
                    if signal.pooled {
                        pool.discard(signal.semaphore);
                    }
                }
            }
            tracing::debug!("Retired present state of swapchain {:?}", swapchain);
        });
    }

    /// Drain outstanding work and destroy every pooled primitive.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        self.log.scope(|| {
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return Ok(());
            }

            self.shared.device.wait_idle()?;
            if let Some(mut waiter) = self.waiter.lock().take() {
                waiter.stop();
            }
            *shut_down = true;

            self.shared.tracker.clear_all();
            {
                let mut present = self.present.lock();
                let pool = &self.shared.semaphores;
                for (_, semaphores) in present.retired.drain() {
                    for semaphore in semaphores {
                        pool.release(semaphore);
                    }
                }
                for (_, signal) in present.pending.drain() {
                    if signal.pooled {
                        pool.release(signal.semaphore);
                    }
                }
            }
            self.shared.fences.destroy_all();
            self.shared.semaphores.destroy_all();
            tracing::debug!("Submitter shut down");
            Ok(())
        })
    }
}

fn group_by_queue(slots: &[QueueSlot]) -> Vec<QueueGroup> {
    let mut groups: Vec<QueueGroup> = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        match groups.last_mut() {
            Some(group) if group.slot == *slot => group.batches.end = i + 1,
            _ => groups.push(QueueGroup {
                slot: *slot,
                batches: i..i + 1,
            }),
        }
    }
    groups
}

impl Drop for Submitter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            self.log.scope(|| tracing::error!("Submitter shutdown failed: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandEncoder, CommandList};
    use crate::family::QueueFamily;
    use crate::headless::HeadlessDevice;
    use crate::submit::SubmissionContextBuilder;
    use ash::vk::Handle;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        fences: Arc<FencePool>,
        semaphores: Arc<SemaphorePool>,
        tracker: Arc<InflightTracker>,
        submitter: Submitter,
    }

    impl Fixture {
        fn new(mode: SubmitMode) -> Self {
            Self::with_device(Arc::new(HeadlessDevice::new()), mode)
        }

        fn with_device(device: Arc<HeadlessDevice>, mode: SubmitMode) -> Self {
            let fences = Arc::new(FencePool::new(device.clone()));
            let semaphores = Arc::new(SemaphorePool::new(device.clone()));
            let tracker = Arc::new(InflightTracker::new());
            let submitter = Submitter::new(
                device.clone(),
                fences.clone(),
                semaphores.clone(),
                tracker.clone(),
                mode,
                u64::MAX,
                LogSink::ambient(),
            )
            .unwrap();
            Self {
                device,
                fences,
                semaphores,
                tracker,
                submitter,
            }
        }

        fn submit(&self, lists: &[CommandList]) -> Result<SubmissionToken> {
            let context = SubmissionContextBuilder::new(&self.semaphores).build(lists)?;
            self.submitter.submit(context)
        }

        /// A list rendering into `target`, waiting on a fresh acquire semaphore.
        fn frame(&self, target: SwapchainImage) -> CommandList {
            let acquire = self.acquire();
            let mut encoder = CommandEncoder::new(self.device.create_handle());
            encoder
                .acquire_image(target, acquire, true)
                .render_pass(
                    self.device.create_handle(),
                    self.device.create_handle(),
                    &[],
                    |pass| {
                        pass.draw(3, 1);
                    },
                )
                .present(target, None);
            encoder.finish()
        }

        /// Simulate a swapchain acquire signaling a pool semaphore.
        fn acquire(&self) -> vk::Semaphore {
            let semaphore = self.semaphores.create().unwrap();
            let signal = [semaphore];
            self.device
                .queue_submit(
                    self.device.queue(0, 0),
                    &[NativeSubmit {
                        signal_semaphores: &signal,
                        ..Default::default()
                    }],
                    vk::Fence::null(),
                )
                .unwrap();
            semaphore
        }
    }

    fn image(index: u32) -> SwapchainImage {
        SwapchainImage::new(vk::SwapchainKHR::from_raw(0xABC), index)
    }

    fn compute(raw: vk::CommandBuffer, buffer: vk::Buffer) -> CommandList {
        let mut encoder = CommandEncoder::new(raw);
        encoder
            .compute_pass(|pass| {
                pass.dispatch(1, 1, 1);
            })
            .copy_buffer_to_buffer(buffer, buffer);
        encoder.finish()
    }

    #[test]
    fn synchronous_submit_recycles_everything() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        let buffer: vk::Buffer = fx.device.create_handle();
        let token = fx
            .submit(&[compute(fx.device.create_handle(), buffer)])
            .unwrap();

        assert!(token.is_complete());
        assert!(!fx.tracker.is_inflight(buffer));
        assert_eq!(fx.fences.outstanding(), 0);
        assert_eq!(fx.semaphores.outstanding(), 0);
    }

    #[test]
    fn empty_context_completes_immediately() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        let token = fx.submitter.submit(SubmissionContext::default()).unwrap();

        assert!(token.is_complete());
        assert!(fx.device.submits().is_empty());
    }

    #[test]
    fn serials_increase() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        let a = fx.submit(&[compute(fx.device.create_handle(), fx.device.create_handle())]);
        let b = fx.submit(&[compute(fx.device.create_handle(), fx.device.create_handle())]);

        assert!(a.unwrap().serial() < b.unwrap().serial());
    }

    #[test]
    fn asynchronous_submit_keeps_objects_inflight_until_the_fence() {
        let fx = Fixture::new(SubmitMode::Asynchronous);
        fx.device.set_manual_completion(true);
        let buffer: vk::Buffer = fx.device.create_handle();

        let token = fx
            .submit(&[compute(fx.device.create_handle(), buffer)])
            .unwrap();
        assert!(!token.is_complete());
        assert!(fx.tracker.is_inflight(buffer));
        assert_eq!(fx.fences.outstanding(), 1);

        fx.device.complete_all();
        token.wait().unwrap();
        assert!(!fx.tracker.is_inflight(buffer));
        assert_eq!(fx.fences.outstanding(), 0);
    }

    #[test]
    fn present_waits_on_the_render_signal_once() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(2))]).unwrap();

        let signal = fx.submitter.pending_present(image(2)).unwrap();
        let render = fx.device.submits().last().cloned().unwrap();
        assert!(render.signals.contains(&signal));

        fx.submitter.present(&PresentInfo::single(image(2))).unwrap();
        fx.submitter.present(&PresentInfo::single(image(2))).unwrap();

        let presents = fx.device.presents();
        assert_eq!(presents[0].waits, vec![signal]);
        assert!(presents[1].waits.is_empty());
        assert_eq!(fx.submitter.pending_present_count(), 0);
    }

    #[test]
    fn present_rejects_a_swapchain_listed_twice() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(0))]).unwrap();
        let signal = fx.submitter.pending_present(image(0)).unwrap();

        let info = PresentInfo {
            targets: vec![image(0), image(0)],
            wait_semaphores: Vec::new(),
        };
        let err = fx.submitter.present(&info).unwrap_err();

        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(fx.device.presents().is_empty());
        assert_eq!(fx.submitter.pending_present(image(0)), Some(signal));
        assert!(fx.device.is_semaphore_signaled(signal));

        fx.submitter.present(&PresentInfo::single(image(0))).unwrap();
        assert_eq!(fx.device.presents()[0].waits, vec![signal]);
    }

    #[test]
    fn present_semaphores_return_when_the_image_is_rendered_again() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(0))]).unwrap();
        let signal = fx.submitter.pending_present(image(0)).unwrap();
        fx.submitter.present(&PresentInfo::single(image(0))).unwrap();
        assert!(fx.semaphores.is_checked_out(signal));

        fx.submit(&[fx.frame(image(0))]).unwrap();
        assert!(!fx.semaphores.is_checked_out(signal));
        fx.submitter.present(&PresentInfo::single(image(0))).unwrap();

        // One present signal plus one acquire: nothing grows frame over frame.
        for _ in 0..4 {
            fx.submit(&[fx.frame(image(0))]).unwrap();
            fx.submitter.present(&PresentInfo::single(image(0))).unwrap();
        }
        assert!(fx.semaphores.allocated() <= 4);
    }

    #[test]
    fn resubmitting_an_image_consumes_the_stale_signal() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(1))]).unwrap();
        let stale = fx.submitter.pending_present(image(1)).unwrap();

        fx.submit(&[fx.frame(image(1))]).unwrap();
        let second = fx.device.submits().last().cloned().unwrap();
        assert!(second.waits.iter().any(|&(s, _)| s == stale));
        assert!(!fx.semaphores.is_checked_out(stale));

        let fresh = fx.submitter.pending_present(image(1)).unwrap();
        fx.submitter.present(&PresentInfo::single(image(1))).unwrap();
        assert_eq!(fx.device.presents()[0].waits, vec![fresh]);
    }

    #[test]
    fn batches_on_one_queue_share_a_native_call() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        let mut render = CommandEncoder::new(fx.device.create_handle());
        render.render_pass(fx.device.create_handle(), fx.device.create_handle(), &[], |pass| {
            pass.draw(3, 1);
        });
        fx.submit(&[compute(fx.device.create_handle(), fx.device.create_handle()), render.finish()])
            .unwrap();

        let submits = fx.device.submits();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].fence, None);
        assert!(submits[1].fence.is_some());
    }

    #[test]
    fn batches_on_different_queues_are_split_and_fenced_last() {
        let device = Arc::new(HeadlessDevice::with_families(vec![
            QueueFamily {
                index: 0,
                capabilities: QueueCapabilities::GRAPHICS
                    | QueueCapabilities::TRANSFER
                    | QueueCapabilities::PRESENT,
                queue_count: 1,
            },
            QueueFamily {
                index: 1,
                capabilities: QueueCapabilities::COMPUTE,
                queue_count: 1,
            },
        ]));
        let fx = Fixture::with_device(device, SubmitMode::Synchronous);
        let mut encoder = CommandEncoder::new(fx.device.create_handle());
        encoder.compute_pass(|pass| {
            pass.dispatch(4, 4, 1);
        });
        let compute_only = encoder.finish();
        let frame = fx.frame(image(0));
        let before = fx.device.submits().len();

        fx.submit(&[compute_only, frame]).unwrap();

        let submits = &fx.device.submits()[before..];
        assert_eq!(submits[0].queue, fx.device.queue(1, 0));
        assert_eq!(submits[0].fence, None);
        assert_eq!(submits[1].queue, fx.device.queue(0, 0));
        assert!(submits[1].fence.is_some());
    }

    #[test]
    fn rejection_after_an_earlier_queue_call_idles_the_device() {
        let device = Arc::new(HeadlessDevice::with_families(vec![
            QueueFamily {
                index: 0,
                capabilities: QueueCapabilities::GRAPHICS
                    | QueueCapabilities::TRANSFER
                    | QueueCapabilities::PRESENT,
                queue_count: 1,
            },
            QueueFamily {
                index: 1,
                capabilities: QueueCapabilities::COMPUTE,
                queue_count: 1,
            },
        ]));
        let fx = Fixture::with_device(device, SubmitMode::Synchronous);
        let mut encoder = CommandEncoder::new(fx.device.create_handle());
        encoder.compute_pass(|pass| {
            pass.dispatch(4, 4, 1);
        });
        let compute_only = encoder.finish();
        let frame = fx.frame(image(0));
        let before = fx.device.submits().len();
        fx.device.fail_submit_after(1, vk::Result::ERROR_DEVICE_LOST);

        let err = fx.submit(&[compute_only, frame]).unwrap_err();

        assert!(matches!(err, GpuError::SubmissionFailed(_)));
        assert_eq!(fx.device.submits().len(), before + 1);
        assert_eq!(fx.device.idle_wait_count(), 1);
        assert_eq!(fx.tracker.record_count(), 0);
        assert_eq!(fx.fences.outstanding(), 0);
        assert_eq!(fx.submitter.pending_present(image(0)), None);
    }

    #[test]
    fn single_queue_rejection_skips_the_idle_wait() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let err = fx
            .submit(&[compute(fx.device.create_handle(), fx.device.create_handle())])
            .unwrap_err();

        assert!(matches!(err, GpuError::SubmissionFailed(_)));
        assert_eq!(fx.device.idle_wait_count(), 0);
    }

    #[test]
    fn rejected_submission_rolls_back() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        let buffer: vk::Buffer = fx.device.create_handle();
        fx.device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let err = fx
            .submit(&[compute(fx.device.create_handle(), buffer)])
            .unwrap_err();

        assert!(matches!(err, GpuError::SubmissionFailed(_)));
        assert!(!fx.tracker.is_inflight(buffer));
        assert_eq!(fx.tracker.record_count(), 0);
        assert_eq!(fx.fences.outstanding(), 0);
    }

    #[test]
    fn hung_fence_fails_the_submission() {
        let device = Arc::new(HeadlessDevice::new());
        device.set_manual_completion(true);
        let fences = Arc::new(FencePool::new(device.clone()));
        let semaphores = Arc::new(SemaphorePool::new(device.clone()));
        let tracker = Arc::new(InflightTracker::new());
        let submitter = Submitter::new(
            device.clone(),
            fences,
            semaphores.clone(),
            tracker.clone(),
            SubmitMode::Synchronous,
            1_000_000,
            LogSink::ambient(),
        )
        .unwrap();
        let buffer: vk::Buffer = device.create_handle();

        let context = SubmissionContextBuilder::new(&semaphores)
            .build(&[compute(device.create_handle(), buffer)])
            .unwrap();
        let err = submitter.submit(context).unwrap_err();

        assert!(matches!(err, GpuError::FenceWaitFailed(_)));
        assert!(tracker.is_inflight(buffer));
    }

    #[test]
    fn out_of_date_present_is_recoverable() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(0))]).unwrap();
        fx.device.fail_next_present(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let err = fx.submitter.present(&PresentInfo::single(image(0))).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(fx.submitter.pending_present_count(), 0);

        fx.device.wait_idle().unwrap();
        fx.submitter.retire_swapchain(image(0).swapchain);
        assert_eq!(fx.semaphores.outstanding(), 0);
    }

    #[test]
    fn other_present_errors_keep_the_pending_signal() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(0))]).unwrap();
        fx.device.fail_next_present(vk::Result::ERROR_DEVICE_LOST);

        let err = fx.submitter.present(&PresentInfo::single(image(0))).unwrap_err();
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(fx.submitter.pending_present_count(), 1);
    }

    #[test]
    fn suboptimal_is_reported() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.device.set_suboptimal(true);
        fx.submit(&[fx.frame(image(0))]).unwrap();

        let outcome = fx.submitter.present(&PresentInfo::single(image(0))).unwrap();
        assert!(outcome.suboptimal);
    }

    #[test]
    fn retire_swapchain_discards_unpresented_signals() {
        let fx = Fixture::new(SubmitMode::Synchronous);
        fx.submit(&[fx.frame(image(3))]).unwrap();
        let pending = fx.submitter.pending_present(image(3)).unwrap();

        fx.submitter.retire_swapchain(image(3).swapchain);

        assert_eq!(fx.submitter.pending_present_count(), 0);
        assert!(!fx.semaphores.is_checked_out(pending));
        assert_eq!(fx.semaphores.free_count(), fx.semaphores.allocated());
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let fx = Fixture::new(SubmitMode::Asynchronous);
        fx.device.set_manual_completion(true);
        let token = fx
            .submit(&[compute(fx.device.create_handle(), fx.device.create_handle())])
            .unwrap();

        fx.submitter.shutdown().unwrap();
        fx.submitter.shutdown().unwrap();

        assert!(token.is_complete());
        assert_eq!(fx.tracker.record_count(), 0);
        assert_eq!(fx.device.live_fences(), 0);
        assert_eq!(fx.device.live_semaphores(), 0);
        assert!(matches!(
            fx.submitter.present(&PresentInfo::single(image(0))),
            Err(GpuError::InvalidState(_))
        ));
    }
}
