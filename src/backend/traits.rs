//! Core backend abstraction traits
//!
//! These traits define the interface the frame graph consumes: object creation
//! keyed by opaque handles ([`GraphicsBackend`]) and command recording plus queue
//! submission ([`CommandRecorder`]).

use crate::backend::types::*;
use std::time::Duration;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create image view: {0}")]
    ImageViewCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create descriptor set: {0}")]
    DescriptorSetCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("Failed to create synchronization object: {0}")]
    SyncCreationFailed(String),
    #[error("Failed to record commands: {0}")]
    RecordingFailed(String),
    #[error("Failed to submit: {0}")]
    SubmitFailed(String),
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("Timed out waiting for fence")]
    Timeout,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! backend_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Wrap a backend-defined id.
            pub fn from_raw(id: u64) -> Self {
                Self(id)
            }

            /// The backend-defined id.
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

backend_handle!(
    /// Handle to a GPU image
    ImageHandle
);
backend_handle!(
    /// Handle to an image view
    ImageViewHandle
);
backend_handle!(
    /// Handle to a sampler
    SamplerHandle
);
backend_handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
backend_handle!(
    /// Handle to a descriptor set together with its layout
    DescriptorSetHandle
);
backend_handle!(
    /// Handle to a framebuffer together with its render pass
    FramebufferHandle
);
backend_handle!(
    /// Handle to a graphics or compute pipeline
    PipelineHandle
);
backend_handle!(
    /// Handle to a GPU-GPU synchronization primitive
    SemaphoreHandle
);
backend_handle!(
    /// Handle to a GPU-CPU synchronization primitive
    FenceHandle
);

/// Object factory consumed by the frame graph.
///
/// Every object is addressed by a small value handle; the backend owns the
/// native object until the matching `destroy_*` call.
pub trait GraphicsBackend {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    // Images

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle>;

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write data to a host-visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    // Binding and pipeline state

    fn create_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayoutDesc,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle>;

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle>;

    /// Create a graphics pipeline compatible with `framebuffer`
    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
        framebuffer: FramebufferHandle,
    ) -> BackendResult<PipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;

    // Synchronization

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Block until `fence` is signaled or `timeout` elapses
    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> BackendResult<()>;

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    /// Block until all submitted work has finished
    fn wait_idle(&mut self) -> BackendResult<()>;

    // Recording

    /// Create a recorder owning one command buffer for the given queue
    fn create_command_recorder(&mut self, kind: PassKind) -> BackendResult<Box<dyn CommandRecorder>>;

    // Resource cleanup

    fn destroy_image(&mut self, image: ImageHandle);
    fn destroy_image_view(&mut self, view: ImageViewHandle);
    fn destroy_sampler(&mut self, sampler: SamplerHandle);
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle);
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);
    fn destroy_fence(&mut self, fence: FenceHandle);
}

/// Sink for the commands of a single pass.
///
/// A recorder is reused every frame: `begin` resets whatever was recorded before.
pub trait CommandRecorder {
    /// Attach a debug name, usually the owning pass name
    fn set_debug_label(&mut self, _label: &str) {}

    fn begin(&mut self) -> BackendResult<()>;

    fn end(&mut self) -> BackendResult<()>;

    /// Bind `pipeline`. Graphics pipelines also begin rendering into `framebuffer`,
    /// clearing attachments in order when `clear_values` is not empty.
    fn begin_pipeline(
        &mut self,
        pipeline: PipelineHandle,
        framebuffer: Option<FramebufferHandle>,
        clear_values: &[ClearValue],
    );

    fn end_pipeline(&mut self);

    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle);

    fn set_viewports(&mut self, viewports: &[Viewport]);

    fn set_scissors(&mut self, scissors: &[ScissorRect]);

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64);

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    /// Submit the recorded commands to the GPU queue
    fn submit(
        &mut self,
        wait: &[SemaphoreHandle],
        signal: &[SemaphoreHandle],
        fence: Option<FenceHandle>,
    ) -> BackendResult<()>;
}

impl dyn CommandRecorder + '_ {
    /// Push a plain-old-data value at offset 0
    pub fn push_constant<T: bytemuck::Pod>(&mut self, stages: ShaderStageFlags, value: &T) {
        self.push_constants(stages, 0, bytemuck::bytes_of(value));
    }
}
