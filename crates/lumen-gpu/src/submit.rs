//! Turning command lists into ordered submission batches.
//!
//! The builder walks the recorded operations of every command list, decides
//! which kind of queue each list needs, merges consecutive lists of the same
//! kind into one batch and chains the batches with semaphores so they keep
//! their order even when they land on different hardware queues.

use ash::vk;

use crate::command::{Command, CommandList, SwapchainImage};
use crate::error::{GpuError, Result};
use crate::family::QueueCapabilities;
use crate::handle::ObjectSet;
use crate::sync::SemaphorePool;

/// Stages of a present batch that wait for the acquired image.
pub const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Stage at which a batch waits for the batch before it.
pub const CHAIN_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::ALL_COMMANDS;

/// What kind of queue a batch needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitKind {
    Compute,
    Graphics,
    Transfer,
    /// Work that finishes a swapchain image for presentation.
    Present(SwapchainImage),
}

impl SubmitKind {
    /// Queue capabilities the batch requires.
    #[must_use]
    pub fn required_capabilities(self) -> QueueCapabilities {
        match self {
            Self::Compute => QueueCapabilities::COMPUTE,
            Self::Graphics => QueueCapabilities::GRAPHICS,
            Self::Transfer => QueueCapabilities::TRANSFER,
            Self::Present(_) => QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT,
        }
    }

    /// The swapchain image of a present batch.
    #[must_use]
    pub fn target(self) -> Option<SwapchainImage> {
        match self {
            Self::Present(target) => Some(target),
            _ => None,
        }
    }

    /// A native command buffer cannot be split, so a list takes the
    /// strongest kind among its operations.
    fn rank(self) -> u8 {
        match self {
            Self::Transfer => 0,
            Self::Compute => 1,
            Self::Graphics => 2,
            Self::Present(_) => 3,
        }
    }
}

/// A semaphore wait with its destination stage mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// The semaphore a present call must wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentSignal {
    pub semaphore: vk::Semaphore,
    /// Taken from the core's semaphore pool rather than supplied by the client.
    pub pooled: bool,
}

/// One ordered unit of GPU work for a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    kind: SubmitKind,
    command_buffers: Vec<vk::CommandBuffer>,
    waits: Vec<SemaphoreWait>,
    signals: Vec<vk::Semaphore>,
    present_signal: Option<PresentSignal>,
}

impl Submit {
    fn new(kind: SubmitKind) -> Self {
        Self {
            kind,
            command_buffers: Vec::new(),
            waits: Vec::new(),
            signals: Vec::new(),
            present_signal: None,
        }
    }

    /// Queue capability class this batch needs.
    #[must_use]
    pub fn kind(&self) -> SubmitKind {
        self.kind
    }

    /// Command buffers in recording order.
    #[must_use]
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// Semaphores waited on before this batch runs.
    #[must_use]
    pub fn waits(&self) -> &[SemaphoreWait] {
        &self.waits
    }

    /// Semaphores signaled when this batch completes.
    #[must_use]
    pub fn signals(&self) -> &[vk::Semaphore] {
        &self.signals
    }

    /// Target image of a present batch.
    #[must_use]
    pub fn target(&self) -> Option<SwapchainImage> {
        self.kind.target()
    }

    /// Semaphore the present of [`Self::target`] must wait on.
    #[must_use]
    pub fn present_signal(&self) -> Option<PresentSignal> {
        self.present_signal
    }

    pub(crate) fn add_wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.waits.push(SemaphoreWait { semaphore, stage });
    }

    /// Split the waits into the parallel arrays a native submit expects.
    pub(crate) fn wait_arrays(&self) -> (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) {
        self.waits.iter().map(|w| (w.semaphore, w.stage)).unzip()
    }
}

/// The batches of one submit call and every object they reference.
#[derive(Debug, Clone, Default)]
pub struct SubmissionContext {
    batches: Vec<Submit>,
    objects: ObjectSet,
    /// Pool semaphores to recycle once the submission's fence signals.
    recycle: Vec<vk::Semaphore>,
}

impl SubmissionContext {
    /// Batches in submission order.
    #[must_use]
    pub fn batches(&self) -> &[Submit] {
        &self.batches
    }

    pub(crate) fn batches_mut(&mut self) -> &mut [Submit] {
        &mut self.batches
    }

    /// Every object referenced by the batches.
    #[must_use]
    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    /// Pool semaphores that become reusable when the submission completes.
    #[must_use]
    pub fn recycle(&self) -> &[vk::Semaphore] {
        &self.recycle
    }

    /// Whether there is nothing to submit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<Submit>, ObjectSet, Vec<vk::Semaphore>) {
        (self.batches, self.objects, self.recycle)
    }
}

/// What a single command list contributes.
#[derive(Default)]
struct ListClass {
    kind: Option<SubmitKind>,
    acquire: Vec<(vk::Semaphore, bool)>,
    present_signals: Vec<vk::Semaphore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassScope {
    Outside,
    Compute,
    Render,
}

fn unsupported(list: usize, op: usize, command: &Command, reason: &str) -> GpuError {
    GpuError::UnsupportedOperation(format!(
        "`{}` at command list {list}, operation {op}: {reason}",
        command.name()
    ))
}

fn classify(index: usize, list: &CommandList, objects: &mut ObjectSet) -> Result<ListClass> {
    let mut class = ListClass::default();
    let mut scope = PassScope::Outside;
    let mut target: Option<SwapchainImage> = None;

    for (op, command) in list.commands().iter().enumerate() {
        let err = |reason: &str| unsupported(index, op, command, reason);

        let kind = match command {
            Command::BeginComputePass => {
                if scope != PassScope::Outside {
                    return Err(err("nested pass"));
                }
                scope = PassScope::Compute;
                Some(SubmitKind::Compute)
            }
            Command::BeginRenderPass { .. } => {
                if scope != PassScope::Outside {
                    return Err(err("nested pass"));
                }
                scope = PassScope::Render;
                Some(SubmitKind::Graphics)
            }
            Command::EndComputePass => {
                if scope != PassScope::Compute {
                    return Err(err("no open compute pass"));
                }
                scope = PassScope::Outside;
                None
            }
            Command::EndRenderPass => {
                if scope != PassScope::Render {
                    return Err(err("no open render pass"));
                }
                scope = PassScope::Outside;
                None
            }
            Command::SetPipeline { .. } | Command::SetBindGroup(_) => {
                if scope == PassScope::Outside {
                    return Err(err("outside of a pass"));
                }
                None
            }
            Command::SetVertexBuffer(_) | Command::SetIndexBuffer(_) | Command::Draw { .. } => {
                if scope != PassScope::Render {
                    return Err(err("outside of a render pass"));
                }
                None
            }
            Command::Dispatch { .. } => {
                if scope != PassScope::Compute {
                    return Err(err("outside of a compute pass"));
                }
                None
            }
            Command::CopyBufferToBuffer { .. }
            | Command::CopyBufferToImage { .. }
            | Command::CopyImageToBuffer { .. }
            | Command::CopyImageToImage { .. } => {
                if scope != PassScope::Outside {
                    return Err(err("copy inside a pass"));
                }
                Some(SubmitKind::Transfer)
            }
            Command::AcquireImage {
                target: image,
                semaphore,
                pooled,
            } => {
                if target.is_some_and(|t| t != *image) {
                    return Err(err("command list targets two swapchain images"));
                }
                target = Some(*image);
                class.acquire.push((*semaphore, *pooled));
                Some(SubmitKind::Present(*image))
            }
            Command::Present {
                target: image,
                signal,
            } => {
                if target.is_some_and(|t| t != *image) {
                    return Err(err("command list targets two swapchain images"));
                }
                target = Some(*image);
                class.present_signals.extend(*signal);
                Some(SubmitKind::Present(*image))
            }
            Command::Extension { .. } => return Err(err("no submit kind mapping")),
        };

        command.collect_objects(objects);
        if let Some(kind) = kind {
            if class.kind.map_or(true, |current| kind.rank() > current.rank()) {
                class.kind = Some(kind);
            }
        }
    }

    if scope != PassScope::Outside {
        return Err(GpuError::UnsupportedOperation(format!(
            "command list {index} ends with an unclosed {scope:?} pass"
        )));
    }
    Ok(class)
}

/// Builds a [`SubmissionContext`] from command lists.
pub struct SubmissionContextBuilder<'a> {
    semaphores: &'a SemaphorePool,
}

impl<'a> SubmissionContextBuilder<'a> {
    /// Chain and present semaphores are taken from `semaphores`.
    #[must_use]
    pub fn new(semaphores: &'a SemaphorePool) -> Self {
        Self { semaphores }
    }

    /// Classify, merge and chain the command lists.
    ///
    /// On failure every semaphore taken from the pool is returned to it.
    pub fn build(&self, lists: &[CommandList]) -> Result<SubmissionContext> {
        let mut allocated = Vec::new();
        let result = self.build_inner(lists, &mut allocated);
        if result.is_err() {
            for semaphore in allocated {
                self.semaphores.release(semaphore);
            }
        }
        result
    }

    fn build_inner(
        &self,
        lists: &[CommandList],
        allocated: &mut Vec<vk::Semaphore>,
    ) -> Result<SubmissionContext> {
        let mut context = SubmissionContext::default();

        for (index, list) in lists.iter().enumerate() {
            let class = classify(index, list, &mut context.objects)?;
            context.objects.insert(list.raw());

            // Lists without a kind of their own ride along with the open batch.
            let kind = class
                .kind
                .or_else(|| context.batches.last().map(Submit::kind))
                .unwrap_or(SubmitKind::Graphics);
            if context.batches.last().map_or(true, |batch| batch.kind != kind) {
                context.batches.push(Submit::new(kind));
            }
            let open = context.batches.len() - 1;
            let batch = &mut context.batches[open];

            batch.command_buffers.push(list.raw());
            for (semaphore, pooled) in class.acquire {
                batch.add_wait(semaphore, ACQUIRE_WAIT_STAGE);
                if pooled {
                    context.recycle.push(semaphore);
                }
            }
            for semaphore in class.present_signals {
                batch.signals.push(semaphore);
                if batch.present_signal.is_none() {
                    batch.present_signal = Some(PresentSignal {
                        semaphore,
                        pooled: false,
                    });
                }
            }
        }

        for batch in &mut context.batches {
            if matches!(batch.kind, SubmitKind::Present(_)) && batch.present_signal.is_none() {
                let semaphore = self.semaphores.create()?;
                allocated.push(semaphore);
                batch.signals.push(semaphore);
                batch.present_signal = Some(PresentSignal {
                    semaphore,
                    pooled: true,
                });
                context.objects.insert(semaphore);
            }
        }

        for i in 1..context.batches.len() {
            let semaphore = self.semaphores.create()?;
            allocated.push(semaphore);
            context.batches[i - 1].signals.push(semaphore);
            context.batches[i].add_wait(semaphore, CHAIN_WAIT_STAGE);
            context.recycle.push(semaphore);
            context.objects.insert(semaphore);
        }

        tracing::trace!(
            "Built {} batches from {} command lists ({} objects)",
            context.batches.len(),
            lists.len(),
            context.objects.len()
        );

        Ok(context)
    }
}
