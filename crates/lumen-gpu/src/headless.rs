//! In-process device without a GPU.
//!
//! [`HeadlessDevice`] behaves like a driver that executes instantly (or when
//! told to, in manual completion mode). It enforces binary semaphore rules,
//! so a submission that waits on a semaphore nobody signaled is rejected the
//! same way validation layers would flag it, and it records every native
//! call for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::device::{Backend, NativePresent, NativeSubmit, RawDevice};
use crate::error::{GpuError, Result};
use crate::family::{QueueCapabilities, QueueFamily};
use crate::handle::ObjectHandle;

/// A native submit descriptor as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signals: Vec<vk::Semaphore>,
    /// Set on the last descriptor of a native call that carried a fence.
    pub fence: Option<vk::Fence>,
}

/// A native present call as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRecord {
    pub queue: vk::Queue,
    pub waits: Vec<vk::Semaphore>,
    pub swapchains: Vec<vk::SwapchainKHR>,
    pub image_indices: Vec<u32>,
}

#[derive(Default)]
struct HeadlessState {
    /// Fence raw handle to signaled state.
    fences: HashMap<u64, bool>,
    /// Semaphore raw handle to signaled state.
    semaphores: HashMap<u64, bool>,
    /// Fences submitted but not yet completed in manual mode.
    pending: VecDeque<vk::Fence>,
    submits: Vec<SubmitRecord>,
    presents: Vec<PresentRecord>,
    destroyed: Vec<ObjectHandle>,
    manual_completion: bool,
    /// Native submit calls to let through, then the failure to report.
    fail_submit: Option<(usize, vk::Result)>,
    fail_next_present: Option<vk::Result>,
    fail_allocation: bool,
    suboptimal: bool,
    idle_waits: usize,
}

impl HeadlessState {
    fn signal_fence(&mut self, fence: vk::Fence) {
        if let Some(signaled) = self.fences.get_mut(&fence.as_raw()) {
            *signaled = true;
        }
    }
}

/// A device that simulates fences and semaphores in process.
pub struct HeadlessDevice {
    families: Vec<QueueFamily>,
    next_handle: AtomicU64,
    state: Mutex<HeadlessState>,
    signaled: Condvar,
}

fn validation_error() -> GpuError {
    GpuError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT)
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// A device with a universal family, a compute family and a transfer family.
    #[must_use]
    pub fn new() -> Self {
        Self::with_families(vec![
            QueueFamily {
                index: 0,
                capabilities: QueueCapabilities::all(),
                queue_count: 1,
            },
            QueueFamily {
                index: 1,
                capabilities: QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                queue_count: 1,
            },
            QueueFamily {
                index: 2,
                capabilities: QueueCapabilities::TRANSFER,
                queue_count: 1,
            },
        ])
    }

    /// A device with custom queue families.
    #[must_use]
    pub fn with_families(families: Vec<QueueFamily>) -> Self {
        Self {
            families,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(HeadlessState::default()),
            signaled: Condvar::new(),
        }
    }

    /// Mint a fresh handle of any type, for resources owned by tests.
    pub fn create_handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// In manual mode fences stay unsignaled until [`Self::complete_next`] or [`Self::complete_all`].
    pub fn set_manual_completion(&self, manual: bool) {
        let mut state = self.state.lock();
        state.manual_completion = manual;
        if !manual {
            while let Some(fence) = state.pending.pop_front() {
                state.signal_fence(fence);
            }
            self.signaled.notify_all();
        }
    }

    /// Complete the oldest outstanding submission.
    pub fn complete_next(&self) -> Option<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.pending.pop_front()?;
        state.signal_fence(fence);
        self.signaled.notify_all();
        Some(fence)
    }

    /// Complete every outstanding submission.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while let Some(fence) = state.pending.pop_front() {
            state.signal_fence(fence);
        }
        self.signaled.notify_all();
    }

    /// Number of submissions that have not completed yet.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Make the next `queue_submit` fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.fail_submit_after(0, result);
    }

    /// Let `calls` native submit calls through, then fail the one after with `result`.
    pub fn fail_submit_after(&self, calls: usize, result: vk::Result) {
        self.state.lock().fail_submit = Some((calls, result));
    }

    /// Make the next `queue_present` fail with `result`.
    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.lock().fail_next_present = Some(result);
    }

    /// Make fence and semaphore allocation fail.
    pub fn fail_primitive_allocation(&self, fail: bool) {
        self.state.lock().fail_allocation = fail;
    }

    /// Signal a semaphore from outside any queue, as a swapchain acquire does.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) -> Result<()> {
        let mut state = self.state.lock();
        match state.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if !*signaled => {
                *signaled = true;
                Ok(())
            }
            _ => Err(validation_error()),
        }
    }

    /// Report every following present as suboptimal.
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal = suboptimal;
    }

    /// Every native submit descriptor so far, in order.
    #[must_use]
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    /// Every native present call so far, in order.
    #[must_use]
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.clone()
    }

    /// Whether `destroy_object` was called for the handle.
    #[must_use]
    pub fn was_destroyed(&self, handle: impl Into<ObjectHandle>) -> bool {
        self.destroy_count(handle) > 0
    }

    /// How many times `destroy_object` was called for the handle.
    #[must_use]
    pub fn destroy_count(&self, handle: impl Into<ObjectHandle>) -> usize {
        let handle = handle.into();
        self.state
            .lock()
            .destroyed
            .iter()
            .filter(|&&h| h == handle)
            .count()
    }

    /// Number of fences alive on the device.
    #[must_use]
    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Number of semaphores alive on the device.
    #[must_use]
    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    /// Whether a semaphore has a signal nobody waited on yet.
    #[must_use]
    pub fn is_semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Number of `wait_idle` calls.
    #[must_use]
    pub fn idle_wait_count(&self) -> usize {
        self.state.lock().idle_waits
    }
}

impl RawDevice for HeadlessDevice {
    fn backend(&self) -> Backend {
        Backend::Headless
    }

    fn queue_families(&self) -> Vec<QueueFamily> {
        self.families.clone()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x1000 + u64::from(family) * 0x10 + u64::from(index))
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        if state.fail_allocation {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let fence: vk::Fence = self.create_handle();
        state.fences.insert(fence.as_raw(), false);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        if state.fail_allocation {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let semaphore: vk::Semaphore = self.create_handle();
        state.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[NativeSubmit<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match state.fail_submit.take() {
            Some((0, result)) => return Err(GpuError::Vulkan(result)),
            Some((calls, result)) => state.fail_submit = Some((calls - 1, result)),
            None => {}
        }

        if fence != vk::Fence::null() && state.fences.get(&fence.as_raw()) != Some(&false) {
            tracing::error!("Submitted with unknown or signaled fence {:?}", fence);
            return Err(validation_error());
        }

        // Simulate on a copy so a rejected submission changes nothing.
        let mut semaphores = state.semaphores.clone();
        for submit in submits {
            if submit.wait_semaphores.len() != submit.wait_stages.len() {
                return Err(validation_error());
            }
            for semaphore in submit.wait_semaphores {
                match semaphores.get_mut(&semaphore.as_raw()) {
                    Some(signaled) if *signaled => *signaled = false,
                    // Semaphores owned by the client are not tracked here.
                    None => {}
                    Some(_) => {
                        tracing::error!("Wait on semaphore {:?} with no pending signal", semaphore);
                        return Err(validation_error());
                    }
                }
            }
            for semaphore in submit.signal_semaphores {
                match semaphores.get_mut(&semaphore.as_raw()) {
                    Some(signaled) if !*signaled => *signaled = true,
                    None => {}
                    Some(_) => {
                        tracing::error!("Signal of already signaled semaphore {:?}", semaphore);
                        return Err(validation_error());
                    }
                }
            }
        }
        state.semaphores = semaphores;

        let last = submits.len().saturating_sub(1);
        for (i, submit) in submits.iter().enumerate() {
            let record = SubmitRecord {
                queue,
                command_buffers: submit.command_buffers.to_vec(),
                waits: submit
                    .wait_semaphores
                    .iter()
                    .copied()
                    .zip(submit.wait_stages.iter().copied())
                    .collect(),
                signals: submit.signal_semaphores.to_vec(),
                fence: (i == last && fence != vk::Fence::null()).then_some(fence),
            };
            state.submits.push(record);
        }

        if fence != vk::Fence::null() {
            if state.manual_completion {
                state.pending.push_back(fence);
            } else {
                state.signal_fence(fence);
                self.signaled.notify_all();
            }
        }
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence.as_raw()) {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => return Err(validation_error()),
            }
            match deadline {
                Some(deadline) => {
                    if self.signaled.wait_until(&mut state, deadline).timed_out()
                        && state.fences.get(&fence.as_raw()) != Some(&true)
                    {
                        return Err(GpuError::Vulkan(vk::Result::TIMEOUT));
                    }
                }
                None => self.signaled.wait(&mut state),
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending.contains(&fence) {
            return Err(validation_error());
        }
        let signaled = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or_else(validation_error)?;
        *signaled = false;
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, present: &NativePresent<'_>) -> Result<bool> {
        let mut state = self.state.lock();
        if present.swapchains.len() != present.image_indices.len() {
            return Err(validation_error());
        }
        let failure = state.fail_next_present.take();

        // Each wait consumes its signal, so a repeated wait finds none left.
        let mut semaphores = state.semaphores.clone();
        for semaphore in present.wait_semaphores {
            match semaphores.get_mut(&semaphore.as_raw()) {
                Some(signaled) if *signaled => *signaled = false,
                None => {}
                Some(_) => {
                    tracing::error!("Present waits on semaphore {:?} with no pending signal", semaphore);
                    return Err(validation_error());
                }
            }
        }
        // Rejections by the presentation engine still execute the waits.
        let executes_waits = failure.map_or(true, |result| {
            matches!(
                result,
                vk::Result::ERROR_OUT_OF_DATE_KHR
                    | vk::Result::ERROR_SURFACE_LOST_KHR
                    | vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT
            )
        });
        if executes_waits {
            state.semaphores = semaphores;
        }
        if let Some(result) = failure {
            return Err(GpuError::Vulkan(result));
        }

        state.presents.push(PresentRecord {
            queue,
            waits: present.wait_semaphores.to_vec(),
            swapchains: present.swapchains.to_vec(),
            image_indices: present.image_indices.to_vec(),
        });
        Ok(state.suboptimal)
    }

    fn destroy_object(&self, handle: ObjectHandle) {
        let mut state = self.state.lock();
        if handle.kind() == crate::handle::ObjectKind::Semaphore {
            state.semaphores.remove(&handle.raw());
        }
        state.destroyed.push(handle);
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        while let Some(fence) = state.pending.pop_front() {
            state.signal_fence(fence);
        }
        state.idle_waits += 1;
        self.signaled.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_need_a_pending_signal() {
        let device = HeadlessDevice::new();
        let queue = device.queue(0, 0);
        let semaphore = device.create_semaphore().unwrap();
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];

        let wait = NativeSubmit {
            wait_semaphores: std::slice::from_ref(&semaphore),
            wait_stages: &stages,
            ..Default::default()
        };
        assert!(device.queue_submit(queue, &[wait], vk::Fence::null()).is_err());

        let signal = NativeSubmit {
            signal_semaphores: std::slice::from_ref(&semaphore),
            ..Default::default()
        };
        device.queue_submit(queue, &[signal, wait], vk::Fence::null()).unwrap();
        assert!(!device.is_semaphore_signaled(semaphore));
    }

    #[test]
    fn rejected_submissions_change_nothing() {
        let device = HeadlessDevice::new();
        let queue = device.queue(0, 0);
        let a = device.create_semaphore().unwrap();
        let b = device.create_semaphore().unwrap();
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];

        let signal_a = NativeSubmit {
            signal_semaphores: std::slice::from_ref(&a),
            ..Default::default()
        };
        let wait_b = NativeSubmit {
            wait_semaphores: std::slice::from_ref(&b),
            wait_stages: &stages,
            ..Default::default()
        };
        assert!(device.queue_submit(queue, &[signal_a, wait_b], vk::Fence::null()).is_err());
        assert!(!device.is_semaphore_signaled(a));
        assert!(device.submits().is_empty());
    }

    #[test]
    fn present_consumes_each_wait_once() {
        let device = HeadlessDevice::new();
        let queue = device.queue(0, 0);
        let semaphore = device.create_semaphore().unwrap();
        device.signal_semaphore(semaphore).unwrap();
        let swapchains = [device.create_handle::<vk::SwapchainKHR>()];

        let twice = [semaphore, semaphore];
        let present = NativePresent {
            wait_semaphores: &twice,
            swapchains: &swapchains,
            image_indices: &[0],
        };
        assert!(device.queue_present(queue, &present).is_err());
        assert!(device.is_semaphore_signaled(semaphore));
        assert!(device.presents().is_empty());

        let present = NativePresent {
            wait_semaphores: std::slice::from_ref(&semaphore),
            ..present
        };
        device.queue_present(queue, &present).unwrap();
        assert!(!device.is_semaphore_signaled(semaphore));
    }

    #[test]
    fn backend_is_headless() {
        let device = HeadlessDevice::new();
        assert_eq!(device.backend(), Backend::Headless);
        assert!(device.as_vulkan().is_none());
    }

    #[test]
    fn manual_completion_holds_fences() {
        let device = HeadlessDevice::new();
        device.set_manual_completion(true);
        let fence = device.create_fence().unwrap();

        device
            .queue_submit(device.queue(0, 0), &[NativeSubmit::default()], fence)
            .unwrap();
        assert!(matches!(
            device.wait_for_fence(fence, 1_000),
            Err(GpuError::Vulkan(vk::Result::TIMEOUT))
        ));

        assert_eq!(device.complete_next(), Some(fence));
        device.wait_for_fence(fence, u64::MAX).unwrap();
        device.reset_fence(fence).unwrap();
        assert!(matches!(
            device.wait_for_fence(fence, 0),
            Err(GpuError::Vulkan(vk::Result::TIMEOUT))
        ));
    }

    #[test]
    fn fence_waits_wake_up_on_completion() {
        let device = std::sync::Arc::new(HeadlessDevice::new());
        device.set_manual_completion(true);
        let fence = device.create_fence().unwrap();
        device
            .queue_submit(device.queue(0, 0), &[NativeSubmit::default()], fence)
            .unwrap();

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_for_fence(fence, u64::MAX))
        };
        device.complete_all();
        waiter.join().unwrap().unwrap();
    }
}
