//! Recorded command lists.
//!
//! A [`CommandList`] pairs the native command buffer that will be submitted
//! with the logical operations that were recorded into it. The operations
//! are what the submission builder walks to decide batch kinds and to
//! harvest the objects the GPU will touch.

use ash::vk;

use crate::handle::{ObjectHandle, ObjectSet};

/// One image of one swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainImage {
    pub swapchain: vk::SwapchainKHR,
    pub index: u32,
}

impl SwapchainImage {
    /// Create a swapchain image reference.
    #[must_use]
    pub const fn new(swapchain: vk::SwapchainKHR, index: u32) -> Self {
        Self { swapchain, index }
    }
}

/// A descriptor set together with the resources written into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindGroup {
    pub set: vk::DescriptorSet,
    /// Buffers, image views and samplers referenced by the set.
    pub resources: Vec<ObjectHandle>,
}

/// A recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BeginComputePass,
    EndComputePass,
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        attachments: Vec<vk::ImageView>,
    },
    EndRenderPass,
    SetPipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    },
    SetBindGroup(BindGroup),
    SetVertexBuffer(vk::Buffer),
    SetIndexBuffer(vk::Buffer),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBufferToBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
    },
    CopyImageToImage {
        src: vk::Image,
        dst: vk::Image,
    },
    /// The list writes to a freshly acquired swapchain image.
    AcquireImage {
        target: SwapchainImage,
        semaphore: vk::Semaphore,
        /// The semaphore came from the core's pool and is recycled with the submission.
        pooled: bool,
    },
    /// The list finishes the image and hands it to presentation.
    Present {
        target: SwapchainImage,
        /// Semaphore to signal for the present; one is taken from the pool when `None`.
        signal: Option<vk::Semaphore>,
    },
    /// A vendor or experimental command the core knows nothing about.
    Extension { name: String },
}

impl Command {
    /// Short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::BeginComputePass => "begin_compute_pass",
            Self::EndComputePass => "end_compute_pass",
            Self::BeginRenderPass { .. } => "begin_render_pass",
            Self::EndRenderPass => "end_render_pass",
            Self::SetPipeline { .. } => "set_pipeline",
            Self::SetBindGroup(_) => "set_bind_group",
            Self::SetVertexBuffer(_) => "set_vertex_buffer",
            Self::SetIndexBuffer(_) => "set_index_buffer",
            Self::Draw { .. } => "draw",
            Self::Dispatch { .. } => "dispatch",
            Self::CopyBufferToBuffer { .. } => "copy_buffer_to_buffer",
            Self::CopyBufferToImage { .. } => "copy_buffer_to_image",
            Self::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            Self::CopyImageToImage { .. } => "copy_image_to_image",
            Self::AcquireImage { .. } => "acquire_image",
            Self::Present { .. } => "present",
            Self::Extension { name } => name.as_str(),
        }
    }

    /// Add every object this operation touches to `objects`.
    pub fn collect_objects(&self, objects: &mut ObjectSet) {
        match self {
            Self::BeginRenderPass {
                render_pass,
                framebuffer,
                attachments,
            } => {
                objects.insert(*render_pass);
                objects.insert(*framebuffer);
                objects.extend(attachments.iter().copied());
            }
            Self::SetPipeline { pipeline, layout } => {
                objects.insert(*pipeline);
                objects.insert(*layout);
            }
            Self::SetBindGroup(group) => {
                objects.insert(group.set);
                objects.extend(group.resources.iter().copied());
            }
            Self::SetVertexBuffer(buffer) | Self::SetIndexBuffer(buffer) => {
                objects.insert(*buffer);
            }
            Self::CopyBufferToBuffer { src, dst } => {
                objects.insert(*src);
                objects.insert(*dst);
            }
            Self::CopyBufferToImage { src, dst } => {
                objects.insert(*src);
                objects.insert(*dst);
            }
            Self::CopyImageToBuffer { src, dst } => {
                objects.insert(*src);
                objects.insert(*dst);
            }
            Self::CopyImageToImage { src, dst } => {
                objects.insert(*src);
                objects.insert(*dst);
            }
            Self::AcquireImage { semaphore, .. } => {
                objects.insert(*semaphore);
            }
            Self::Present {
                signal: Some(semaphore),
                ..
            } => {
                objects.insert(*semaphore);
            }
            Self::BeginComputePass
            | Self::EndComputePass
            | Self::EndRenderPass
            | Self::Draw { .. }
            | Self::Dispatch { .. }
            | Self::Present { signal: None, .. }
            | Self::Extension { .. } => {}
        }
    }
}

/// A finished command list ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandList {
    raw: vk::CommandBuffer,
    commands: Vec<Command>,
}

impl CommandList {
    /// Wrap an already recorded native command buffer.
    #[must_use]
    pub fn new(raw: vk::CommandBuffer, commands: Vec<Command>) -> Self {
        Self { raw, commands }
    }

    /// The native command buffer.
    #[must_use]
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// The recorded operations, in order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

/// Records operations for one command list.
#[derive(Debug)]
pub struct CommandEncoder {
    raw: vk::CommandBuffer,
    commands: Vec<Command>,
}

impl CommandEncoder {
    /// Start recording into a native command buffer.
    #[must_use]
    pub fn new(raw: vk::CommandBuffer) -> Self {
        Self {
            raw,
            commands: Vec::new(),
        }
    }

    /// Append an arbitrary operation.
    pub fn record(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Record a compute pass.
    pub fn compute_pass(&mut self, f: impl FnOnce(&mut ComputePass<'_>)) -> &mut Self {
        self.commands.push(Command::BeginComputePass);
        f(&mut ComputePass { encoder: self });
        self.commands.push(Command::EndComputePass);
        self
    }

    /// Record a render pass.
    pub fn render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        attachments: &[vk::ImageView],
        f: impl FnOnce(&mut RenderPass<'_>),
    ) -> &mut Self {
        self.commands.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            attachments: attachments.to_vec(),
        });
        f(&mut RenderPass { encoder: self });
        self.commands.push(Command::EndRenderPass);
        self
    }

    /// Copy between buffers.
    pub fn copy_buffer_to_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer) -> &mut Self {
        self.record(Command::CopyBufferToBuffer { src, dst })
    }

    /// Upload a buffer into an image.
    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image) -> &mut Self {
        self.record(Command::CopyBufferToImage { src, dst })
    }

    /// Read an image back into a buffer.
    pub fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer) -> &mut Self {
        self.record(Command::CopyImageToBuffer { src, dst })
    }

    /// Copy between images.
    pub fn copy_image_to_image(&mut self, src: vk::Image, dst: vk::Image) -> &mut Self {
        self.record(Command::CopyImageToImage { src, dst })
    }

    /// Declare that this list writes to an acquired swapchain image.
    pub fn acquire_image(
        &mut self,
        target: SwapchainImage,
        semaphore: vk::Semaphore,
        pooled: bool,
    ) -> &mut Self {
        self.record(Command::AcquireImage {
            target,
            semaphore,
            pooled,
        })
    }

    /// Hand the swapchain image to presentation once this list completes.
    pub fn present(&mut self, target: SwapchainImage, signal: Option<vk::Semaphore>) -> &mut Self {
        self.record(Command::Present { target, signal })
    }

    /// Finish recording.
    #[must_use]
    pub fn finish(self) -> CommandList {
        CommandList::new(self.raw, self.commands)
    }
}

/// Operations valid inside a compute pass.
pub struct ComputePass<'a> {
    encoder: &'a mut CommandEncoder,
}

impl ComputePass<'_> {
    /// Bind a compute pipeline.
    pub fn set_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> &mut Self {
        self.encoder.record(Command::SetPipeline { pipeline, layout });
        self
    }

    /// Bind descriptor sets; the buffers and images they reference are tracked.
    pub fn set_bind_group(&mut self, group: BindGroup) -> &mut Self {
        self.encoder.record(Command::SetBindGroup(group));
        self
    }

    /// Dispatch `x * y * z` workgroups.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        self.encoder.record(Command::Dispatch { x, y, z });
        self
    }
}

/// Operations valid inside a render pass.
pub struct RenderPass<'a> {
    encoder: &'a mut CommandEncoder,
}

impl RenderPass<'_> {
    /// Bind a graphics pipeline.
    pub fn set_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> &mut Self {
        self.encoder.record(Command::SetPipeline { pipeline, layout });
        self
    }

    /// Bind descriptor sets; the buffers and images they reference are tracked.
    pub fn set_bind_group(&mut self, group: BindGroup) -> &mut Self {
        self.encoder.record(Command::SetBindGroup(group));
        self
    }

    /// Bind the vertex buffer.
    pub fn set_vertex_buffer(&mut self, buffer: vk::Buffer) -> &mut Self {
        self.encoder.record(Command::SetVertexBuffer(buffer));
        self
    }

    /// Bind the index buffer.
    pub fn set_index_buffer(&mut self, buffer: vk::Buffer) -> &mut Self {
        self.encoder.record(Command::SetIndexBuffer(buffer));
        self
    }

    /// Non-indexed draw.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> &mut Self {
        self.encoder.record(Command::Draw {
            vertex_count,
            instance_count,
        });
        self
    }
}
