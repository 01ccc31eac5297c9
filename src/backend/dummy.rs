//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It hands out fresh
//! handles, remembers the descriptors it was given and records every command
//! and submission into a shared log that tests can inspect.

use crate::backend::traits::*;
use crate::backend::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Kind of object tracked by the dummy backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Image,
    ImageView,
    Sampler,
    Buffer,
    DescriptorSet,
    Framebuffer,
    Pipeline,
    Semaphore,
    Fence,
    CommandRecorder,
}

/// A command captured by a [`DummyRecorder`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginPipeline {
        pipeline: PipelineHandle,
        framebuffer: Option<FramebufferHandle>,
        clear_values: usize,
    },
    EndPipeline,
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetHandle,
    },
    SetViewports(Vec<Viewport>),
    SetScissors(Vec<ScissorRect>),
    BindVertexBuffer {
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    PushConstants {
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// One queue submission captured by the dummy backend
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub label: String,
    pub kind: PassKind,
    pub commands: Vec<RecordedCommand>,
    pub wait: Vec<SemaphoreHandle>,
    pub signal: Vec<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Debug, Clone)]
enum DummyObject {
    Image(ImageDescriptor),
    ImageView {
        image: ImageHandle,
        desc: ImageViewDescriptor,
    },
    Sampler,
    Buffer(Vec<u8>),
    DescriptorSet {
        layout: DescriptorSetLayoutDesc,
        writes: Vec<DescriptorWrite>,
    },
    Framebuffer(FramebufferDescriptor),
    GraphicsPipeline {
        desc: GraphicsPipelineDescriptor,
        framebuffer: FramebufferHandle,
    },
    ComputePipeline(ComputePipelineDescriptor),
    Semaphore,
    Fence {
        signaled: bool,
    },
}

impl DummyObject {
    fn kind(&self) -> ObjectKind {
        match self {
            DummyObject::Image(_) => ObjectKind::Image,
            DummyObject::ImageView { .. } => ObjectKind::ImageView,
            DummyObject::Sampler => ObjectKind::Sampler,
            DummyObject::Buffer(_) => ObjectKind::Buffer,
            DummyObject::DescriptorSet { .. } => ObjectKind::DescriptorSet,
            DummyObject::Framebuffer(_) => ObjectKind::Framebuffer,
            DummyObject::GraphicsPipeline { .. } | DummyObject::ComputePipeline(_) => {
                ObjectKind::Pipeline
            }
            DummyObject::Semaphore => ObjectKind::Semaphore,
            DummyObject::Fence { .. } => ObjectKind::Fence,
        }
    }
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    objects: HashMap<u64, DummyObject>,
    created: HashMap<ObjectKind, usize>,
    submissions: Vec<Submission>,
    /// Pending injected failures: kind and how many creations succeed first
    failures: Vec<(ObjectKind, usize)>,
}

impl DummyState {
    fn insert(&mut self, object: DummyObject) -> u64 {
        self.next_id += 1;
        *self.created.entry(object.kind()).or_insert(0) += 1;
        self.objects.insert(self.next_id, object);
        self.next_id
    }

    fn remove(&mut self, id: u64, kind: ObjectKind) {
        match self.objects.get(&id) {
            Some(object) if object.kind() == kind => {
                self.objects.remove(&id);
            }
            _ => log::warn!("DummyBackend: destroying unknown {:?} handle {}", kind, id),
        }
    }

    fn contains(&self, id: u64, kind: ObjectKind) -> bool {
        self.objects.get(&id).is_some_and(|o| o.kind() == kind)
    }

    fn take_failure(&mut self, kind: ObjectKind) -> bool {
        let Some(index) = self.failures.iter().position(|(k, _)| *k == kind) else {
            return false;
        };
        match &mut self.failures[index].1 {
            0 => {
                self.failures.remove(index);
                true
            }
            remaining => {
                *remaining -= 1;
                false
            }
        }
    }
}

/// Dummy GPU backend.
#[derive(Debug, Clone, Default)]
pub struct DummyBackend {
    state: Arc<Mutex<DummyState>>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// All submissions recorded so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Labels of all submissions recorded so far, in submission order.
    pub fn submitted_labels(&self) -> Vec<String> {
        self.state
            .lock()
            .submissions
            .iter()
            .map(|s| s.label.clone())
            .collect()
    }

    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    /// Make the next creation of `kind` fail. Supported for descriptor sets,
    /// framebuffers and pipelines.
    pub fn fail_next(&self, kind: ObjectKind) {
        self.fail_after(kind, 0);
    }

    /// Let `successes` creations of `kind` through, then fail one.
    pub fn fail_after(&self, kind: ObjectKind, successes: usize) {
        self.state.lock().failures.push((kind, successes));
    }

    /// Number of objects of `kind` created over the backend's lifetime.
    pub fn created_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    /// Number of objects of `kind` currently alive.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .count()
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<ImageDescriptor> {
        match self.state.lock().objects.get(&image.0) {
            Some(DummyObject::Image(desc)) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn view_descriptor(&self, view: ImageViewHandle) -> Option<(ImageHandle, ImageViewDescriptor)> {
        match self.state.lock().objects.get(&view.0) {
            Some(DummyObject::ImageView { image, desc }) => Some((*image, desc.clone())),
            _ => None,
        }
    }

    pub fn framebuffer_descriptor(&self, framebuffer: FramebufferHandle) -> Option<FramebufferDescriptor> {
        match self.state.lock().objects.get(&framebuffer.0) {
            Some(DummyObject::Framebuffer(desc)) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn descriptor_set(
        &self,
        set: DescriptorSetHandle,
    ) -> Option<(DescriptorSetLayoutDesc, Vec<DescriptorWrite>)> {
        match self.state.lock().objects.get(&set.0) {
            Some(DummyObject::DescriptorSet { layout, writes }) => {
                Some((layout.clone(), writes.clone()))
            }
            _ => None,
        }
    }

    pub fn graphics_pipeline(
        &self,
        pipeline: PipelineHandle,
    ) -> Option<(GraphicsPipelineDescriptor, FramebufferHandle)> {
        match self.state.lock().objects.get(&pipeline.0) {
            Some(DummyObject::GraphicsPipeline { desc, framebuffer }) => {
                Some((desc.clone(), *framebuffer))
            }
            _ => None,
        }
    }

    pub fn compute_pipeline(&self, pipeline: PipelineHandle) -> Option<ComputePipelineDescriptor> {
        match self.state.lock().objects.get(&pipeline.0) {
            Some(DummyObject::ComputePipeline(desc)) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(&buffer.0) {
            Some(DummyObject::Buffer(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_fence_signaled(&self, fence: FenceHandle) -> bool {
        matches!(
            self.state.lock().objects.get(&fence.0),
            Some(DummyObject::Fence { signaled: true })
        )
    }

    pub fn is_alive(&self, raw: u64) -> bool {
        self.state.lock().objects.contains_key(&raw)
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        log::trace!(
            "DummyBackend: creating image {:?} ({}x{}x{}, {} layers, {} levels)",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.array_layers,
            desc.mip_levels
        );
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::ImageCreationFailed(
                "image extent must be non-zero".into(),
            ));
        }
        Ok(ImageHandle(self.state.lock().insert(DummyObject::Image(desc.clone()))))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        if !state.contains(image.0, ObjectKind::Image) {
            return Err(BackendError::UnknownHandle {
                kind: "image",
                id: image.0,
            });
        }
        log::trace!("DummyBackend: creating {:?} view of image {}", desc.view_type, image.0);
        Ok(ImageViewHandle(state.insert(DummyObject::ImageView {
            image,
            desc: desc.clone(),
        })))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.state.lock().insert(DummyObject::Sampler)))
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let data = vec![0u8; desc.size as usize];
        Ok(BufferHandle(self.state.lock().insert(DummyObject::Buffer(data))))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        match state.objects.get_mut(&buffer.0) {
            Some(DummyObject::Buffer(contents)) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > contents.len() {
                    return Err(BackendError::BufferCreationFailed(format!(
                        "write of {} bytes at {} exceeds buffer size {}",
                        data.len(),
                        offset,
                        contents.len()
                    )));
                }
                contents[start..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(BackendError::UnknownHandle {
                kind: "buffer",
                id: buffer.0,
            }),
        }
    }

    fn create_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayoutDesc,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle> {
        log::trace!(
            "DummyBackend: creating descriptor set with {} bindings",
            layout.bindings.len()
        );
        let mut state = self.state.lock();
        if state.take_failure(ObjectKind::DescriptorSet) {
            return Err(BackendError::DescriptorSetCreationFailed("injected failure".into()));
        }
        Ok(DescriptorSetHandle(state.insert(
            DummyObject::DescriptorSet {
                layout: layout.clone(),
                writes: writes.to_vec(),
            },
        )))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        log::trace!(
            "DummyBackend: creating framebuffer {:?} ({}x{}x{}, {} attachments)",
            desc.label,
            desc.width,
            desc.height,
            desc.layers,
            desc.attachments().len()
        );
        let mut state = self.state.lock();
        if state.take_failure(ObjectKind::Framebuffer) {
            return Err(BackendError::FramebufferCreationFailed("injected failure".into()));
        }
        Ok(FramebufferHandle(state.insert(DummyObject::Framebuffer(desc.clone()))))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
        framebuffer: FramebufferHandle,
    ) -> BackendResult<PipelineHandle> {
        let mut state = self.state.lock();
        if !state.contains(framebuffer.0, ObjectKind::Framebuffer) {
            return Err(BackendError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            });
        }
        if state.take_failure(ObjectKind::Pipeline) {
            return Err(BackendError::PipelineCreationFailed("injected failure".into()));
        }
        log::trace!("DummyBackend: creating graphics pipeline {:?}", desc.label);
        Ok(PipelineHandle(state.insert(DummyObject::GraphicsPipeline {
            desc: desc.clone(),
            framebuffer,
        })))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        log::trace!("DummyBackend: creating compute pipeline {:?}", desc.label);
        let mut state = self.state.lock();
        if state.take_failure(ObjectKind::Pipeline) {
            return Err(BackendError::PipelineCreationFailed("injected failure".into()));
        }
        Ok(PipelineHandle(state.insert(DummyObject::ComputePipeline(desc.clone()))))
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        Ok(SemaphoreHandle(self.state.lock().insert(DummyObject::Semaphore)))
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        Ok(FenceHandle(
            self.state.lock().insert(DummyObject::Fence { signaled }),
        ))
    }

    fn wait_fence(&mut self, fence: FenceHandle, _timeout: Duration) -> BackendResult<()> {
        // Submissions complete immediately, so an unsignaled fence can never signal.
        match self.state.lock().objects.get(&fence.0) {
            Some(DummyObject::Fence { signaled: true }) => Ok(()),
            Some(DummyObject::Fence { signaled: false }) => Err(BackendError::Timeout),
            _ => Err(BackendError::UnknownHandle {
                kind: "fence",
                id: fence.0,
            }),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        match self.state.lock().objects.get_mut(&fence.0) {
            Some(DummyObject::Fence { signaled }) => {
                *signaled = false;
                Ok(())
            }
            _ => Err(BackendError::UnknownHandle {
                kind: "fence",
                id: fence.0,
            }),
        }
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn create_command_recorder(&mut self, kind: PassKind) -> BackendResult<Box<dyn CommandRecorder>> {
        *self
            .state
            .lock()
            .created
            .entry(ObjectKind::CommandRecorder)
            .or_insert(0) += 1;
        Ok(Box::new(DummyRecorder {
            state: Arc::clone(&self.state),
            kind,
            label: String::new(),
            commands: Vec::new(),
            recording: false,
        }))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.state.lock().remove(image.0, ObjectKind::Image);
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        self.state.lock().remove(view.0, ObjectKind::ImageView);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.state.lock().remove(sampler.0, ObjectKind::Sampler);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.state.lock().remove(buffer.0, ObjectKind::Buffer);
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.state.lock().remove(set.0, ObjectKind::DescriptorSet);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.state.lock().remove(framebuffer.0, ObjectKind::Framebuffer);
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.state.lock().remove(pipeline.0, ObjectKind::Pipeline);
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.state.lock().remove(semaphore.0, ObjectKind::Semaphore);
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.state.lock().remove(fence.0, ObjectKind::Fence);
    }
}

/// Recorder handed out by [`DummyBackend`]
#[derive(Debug)]
pub struct DummyRecorder {
    state: Arc<Mutex<DummyState>>,
    kind: PassKind,
    label: String,
    commands: Vec<RecordedCommand>,
    recording: bool,
}

impl DummyRecorder {
    fn record(&mut self, command: RecordedCommand) {
        assert!(
            self.recording,
            "DummyRecorder '{}': command recorded outside begin/end",
            self.label
        );
        self.commands.push(command);
    }
}

impl CommandRecorder for DummyRecorder {
    fn set_debug_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    fn begin(&mut self) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::RecordingFailed(format!(
                "'{}' is already recording",
                self.label
            )));
        }
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::RecordingFailed(format!(
                "'{}' is not recording",
                self.label
            )));
        }
        self.recording = false;
        Ok(())
    }

    fn begin_pipeline(
        &mut self,
        pipeline: PipelineHandle,
        framebuffer: Option<FramebufferHandle>,
        clear_values: &[ClearValue],
    ) {
        self.record(RecordedCommand::BeginPipeline {
            pipeline,
            framebuffer,
            clear_values: clear_values.len(),
        });
    }

    fn end_pipeline(&mut self) {
        self.record(RecordedCommand::EndPipeline);
    }

    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle) {
        self.record(RecordedCommand::BindDescriptorSet { index, set });
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(RecordedCommand::SetViewports(viewports.to_vec()));
    }

    fn set_scissors(&mut self, scissors: &[ScissorRect]) {
        self.record(RecordedCommand::SetScissors(scissors.to_vec()));
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64) {
        self.record(RecordedCommand::BindVertexBuffer {
            binding,
            buffer,
            offset,
        });
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::BindIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        self.record(RecordedCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.record(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(RecordedCommand::Dispatch { x, y, z });
    }

    fn submit(
        &mut self,
        wait: &[SemaphoreHandle],
        signal: &[SemaphoreHandle],
        fence: Option<FenceHandle>,
    ) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::SubmitFailed(format!(
                "'{}' submitted while still recording",
                self.label
            )));
        }
        let mut state = self.state.lock();
        for semaphore in wait.iter().chain(signal.iter()) {
            if !state.contains(semaphore.0, ObjectKind::Semaphore) {
                return Err(BackendError::UnknownHandle {
                    kind: "semaphore",
                    id: semaphore.0,
                });
            }
        }
        if let Some(fence) = fence {
            match state.objects.get_mut(&fence.0) {
                Some(DummyObject::Fence { signaled }) => *signaled = true,
                _ => {
                    return Err(BackendError::UnknownHandle {
                        kind: "fence",
                        id: fence.0,
                    })
                }
            }
        }
        log::trace!(
            "DummyBackend: submitting '{}' ({} commands, wait {:?}, signal {:?})",
            self.label,
            self.commands.len(),
            wait,
            signal
        );
        state.submissions.push(Submission {
            label: self.label.clone(),
            kind: self.kind,
            commands: self.commands.clone(),
            wait: wait.to_vec(),
            signal: signal.to_vec(),
            fence,
        });
        Ok(())
    }
}
