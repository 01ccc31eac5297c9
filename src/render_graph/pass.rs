//! Render pass definitions for the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::builder::Builder;
use crate::render_graph::graph::{GraphError, GraphResult};
use crate::render_graph::registry::Registry;
use crate::render_graph::resource::*;

/// How a pass writes one of its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentRole {
    Color,
    Depth,
    Resolve,
    /// Written through a storage-image binding rather than a framebuffer
    Storage,
}

/// How a pass binds one of its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBinding {
    /// Combined image + sampler
    Sampled(SamplerHandle),
    Storage,
}

impl InputBinding {
    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            InputBinding::Sampled(_) => DescriptorType::CombinedImageSampler,
            InputBinding::Storage => DescriptorType::StorageImage,
        }
    }
}

/// A resource read by a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDesc {
    pub handle: TextureHandle,
    pub binding: InputBinding,
    pub subresource: Subresource,
}

/// A resource written by a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDesc {
    pub handle: TextureHandle,
    pub role: AttachmentRole,
    pub subresource: Subresource,
}

/// Explicit framebuffer extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSize {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// A pipeline description recorded during setup
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDescriptor),
    Compute(ComputePipelineDescriptor),
}

/// Everything a pass declares during setup
#[derive(Debug, Default)]
pub struct PassLayout {
    pub(crate) inputs: Vec<InputDesc>,
    pub(crate) outputs: Vec<OutputDesc>,
    /// Descriptor set bindings in declaration order: every input plus storage outputs.
    pub(crate) bindings: Vec<InputDesc>,
    pub(crate) framebuffer_size: Option<FramebufferSize>,
    pub(crate) pipelines: Vec<PipelineDesc>,
}

impl PassLayout {
    pub fn inputs(&self) -> &[InputDesc] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputDesc] {
        &self.outputs
    }

    pub fn bindings(&self) -> &[InputDesc] {
        &self.bindings
    }

    pub fn framebuffer_size(&self) -> Option<FramebufferSize> {
        self.framebuffer_size
    }

    pub fn pipelines(&self) -> &[PipelineDesc] {
        &self.pipelines
    }

    pub fn reads(&self, handle: TextureHandle) -> bool {
        self.inputs.iter().any(|i| i.handle == handle)
    }

    pub fn writes(&self, handle: TextureHandle) -> bool {
        self.outputs.iter().any(|o| o.handle == handle)
    }
}

/// Lifecycle of a pass node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    /// Setup has run; no GPU objects exist yet.
    Built,
    /// Pipelines, framebuffer and input descriptor set exist.
    Initialized,
}

/// Callback type executed every frame a closure pass is enabled
pub type ExecuteFn<U> = Box<dyn FnMut(&Registry<'_, U>, &mut dyn CommandRecorder)>;

/// Per-frame enable decision of a closure pass
pub enum EnableCheck<U> {
    Always,
    Predicate(Box<dyn FnMut() -> bool>),
    WithRegistry(Box<dyn FnMut(&Registry<'_, U>) -> bool>),
}

impl<U> EnableCheck<U> {
    pub fn predicate(f: impl FnMut() -> bool + 'static) -> Self {
        EnableCheck::Predicate(Box::new(f))
    }

    pub fn with_registry(f: impl FnMut(&Registry<'_, U>) -> bool + 'static) -> Self {
        EnableCheck::WithRegistry(Box::new(f))
    }

    fn evaluate(&mut self, registry: &Registry<'_, U>) -> bool {
        match self {
            EnableCheck::Always => true,
            EnableCheck::Predicate(f) => f(),
            EnableCheck::WithRegistry(f) => f(registry),
        }
    }
}

impl<U> Default for EnableCheck<U> {
    fn default() -> Self {
        EnableCheck::Always
    }
}

/// A pass implemented as a type
pub trait RenderPass<U = ()> {
    /// Queue the pass records for
    fn kind(&self) -> PassKind {
        PassKind::Graphics
    }

    /// Declare resources and pipelines
    fn setup(&mut self, builder: &mut Builder<'_>);

    /// Record commands
    fn execute(&mut self, registry: &Registry<'_, U>, recorder: &mut dyn CommandRecorder);

    /// Evaluated every frame before recording
    fn is_enabled(&mut self, _registry: &Registry<'_, U>) -> bool {
        true
    }
}

/// Execution side of a pass node, shared by the closure and struct variants
pub(crate) trait PassBody<U> {
    fn execute(&mut self, registry: &Registry<'_, U>, recorder: &mut dyn CommandRecorder);
    fn is_enabled(&mut self, registry: &Registry<'_, U>) -> bool;
}

pub(crate) struct ClosurePass<U> {
    pub(crate) execute: ExecuteFn<U>,
    pub(crate) enable: EnableCheck<U>,
}

impl<U> PassBody<U> for ClosurePass<U> {
    fn execute(&mut self, registry: &Registry<'_, U>, recorder: &mut dyn CommandRecorder) {
        (self.execute)(registry, recorder)
    }

    fn is_enabled(&mut self, registry: &Registry<'_, U>) -> bool {
        self.enable.evaluate(registry)
    }
}

pub(crate) struct StructPass<P>(pub(crate) P);

impl<U, P: RenderPass<U>> PassBody<U> for StructPass<P> {
    fn execute(&mut self, registry: &Registry<'_, U>, recorder: &mut dyn CommandRecorder) {
        self.0.execute(registry, recorder)
    }

    fn is_enabled(&mut self, registry: &Registry<'_, U>) -> bool {
        self.0.is_enabled(registry)
    }
}

/// GPU objects a pass owns once initialized
#[derive(Debug, Default)]
pub(crate) struct CompiledPass {
    pub(crate) input_set: Option<DescriptorSetHandle>,
    pub(crate) pipelines: Vec<PipelineHandle>,
    pub(crate) framebuffer: Option<FramebufferHandle>,
    pub(crate) framebuffer_size: Option<FramebufferSize>,
    /// Views of every declared input and output, one per distinct range
    pub(crate) views: Vec<(TextureHandle, Subresource, ImageViewHandle)>,
}

/// A unit of GPU work in the render graph
pub struct PassNode<U> {
    name: String,
    kind: PassKind,
    state: PassState,
    layout: PassLayout,
    compiled: CompiledPass,
    recorder: Option<Box<dyn CommandRecorder>>,
    body: Box<dyn PassBody<U>>,
}

impl<U> PassNode<U> {
    pub(crate) fn new(
        name: &str,
        kind: PassKind,
        layout: PassLayout,
        body: Box<dyn PassBody<U>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state: PassState::Built,
            layout,
            compiled: CompiledPass::default(),
            recorder: None,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn layout(&self) -> &PassLayout {
        &self.layout
    }

    pub fn input_descriptor_set(&self) -> Option<DescriptorSetHandle> {
        self.compiled.input_set
    }

    pub fn pipelines(&self) -> &[PipelineHandle] {
        &self.compiled.pipelines
    }

    pub fn framebuffer(&self) -> Option<FramebufferHandle> {
        self.compiled.framebuffer
    }

    /// Create the pass's GPU objects. Every declared resource must exist already.
    ///
    /// On failure everything created so far is released and the pass stays
    /// `Built`, so a later compile starts from scratch.
    pub(crate) fn initialize<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        resources: &mut ResourceManager,
    ) -> GraphResult<()> {
        assert_eq!(
            self.state,
            PassState::Built,
            "Pass '{}' initialized twice",
            self.name
        );

        if let Err(err) = self.create_objects(backend, resources) {
            log::error!("Failed to initialize pass '{}': {}", self.name, err);
            self.destroy(backend);
            return Err(err);
        }
        self.state = PassState::Initialized;
        Ok(())
    }

    fn create_objects<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        resources: &mut ResourceManager,
    ) -> GraphResult<()> {
        let mut recorder = backend.create_command_recorder(self.kind)?;
        recorder.set_debug_label(&self.name);
        self.recorder = Some(recorder);

        let stages = match self.kind {
            PassKind::Graphics => ShaderStageFlags::VERTEX_FRAGMENT,
            PassKind::Compute => ShaderStageFlags::COMPUTE,
        };

        let mut set_layout = DescriptorSetLayoutDesc::new();
        let bindings = self.layout.bindings.clone();
        let mut writes = Vec::with_capacity(bindings.len());
        for (slot, input) in bindings.iter().enumerate() {
            let view = self.resolve_view(backend, resources, input.handle, input.subresource)?;
            let binding = slot as u32;
            set_layout = set_layout.with_binding(binding, input.binding.descriptor_type(), stages);
            let resource = match input.binding {
                InputBinding::Sampled(sampler) => DescriptorResource::ImageSampler { view, sampler },
                InputBinding::Storage => DescriptorResource::StorageImage(view),
            };
            writes.push(DescriptorWrite { binding, resource });
        }
        if !writes.is_empty() {
            self.compiled.input_set = Some(backend.create_descriptor_set(&set_layout, &writes)?);
        }

        if self.kind == PassKind::Graphics {
            self.create_framebuffer(backend, resources)?;
        } else {
            for output in &self.layout.outputs {
                assert!(
                    output.role == AttachmentRole::Storage,
                    "Compute pass '{}' writes '{}' as a {:?} attachment",
                    self.name,
                    resources.node(output.handle).name(),
                    output.role
                );
            }
        }

        for desc in &self.layout.pipelines {
            let pipeline = match desc {
                PipelineDesc::Graphics(desc) => {
                    let framebuffer = match self.compiled.framebuffer {
                        Some(framebuffer) => framebuffer,
                        None => panic!(
                            "Graphics pass '{}' declares a pipeline but writes no attachments",
                            self.name
                        ),
                    };
                    let mut desc = desc.clone();
                    if !writes.is_empty() {
                        desc.set_layouts.insert(0, set_layout.clone());
                    }
                    if desc.color_targets.is_empty() {
                        let color_count = self
                            .layout
                            .outputs
                            .iter()
                            .filter(|o| o.role == AttachmentRole::Color)
                            .count();
                        desc.color_targets = vec![
                            ColorTargetState {
                                blend: None,
                                write_mask: ColorWrites::ALL,
                            };
                            color_count
                        ];
                    }
                    if desc.label.is_none() {
                        desc.label = Some(self.name.clone());
                    }
                    backend.create_graphics_pipeline(&desc, framebuffer)?
                }
                PipelineDesc::Compute(desc) => {
                    let mut desc = desc.clone();
                    if !writes.is_empty() {
                        desc.set_layouts.insert(0, set_layout.clone());
                    }
                    if desc.label.is_none() {
                        desc.label = Some(self.name.clone());
                    }
                    backend.create_compute_pipeline(&desc)?
                }
            };
            self.compiled.pipelines.push(pipeline);
        }

        log::debug!(
            "Initialized pass '{}' ({} bindings, {} pipelines)",
            self.name,
            writes.len(),
            self.compiled.pipelines.len()
        );
        Ok(())
    }

    fn resolve_view<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        resources: &mut ResourceManager,
        handle: TextureHandle,
        subresource: Subresource,
    ) -> GraphResult<ImageViewHandle> {
        assert!(
            resources.contains(handle),
            "Pass '{}' references texture index {} but only {} exist",
            self.name,
            handle.index(),
            resources.len()
        );
        assert!(
            resources.node(handle).is_created(),
            "Pass '{}' references texture '{}' which was not created",
            self.name,
            resources.node(handle).name()
        );
        let view = resources.image_view(backend, handle, subresource)?;
        if !self
            .compiled
            .views
            .iter()
            .any(|(h, range, _)| *h == handle && *range == subresource)
        {
            self.compiled.views.push((handle, subresource, view));
        }
        Ok(view)
    }

    fn create_framebuffer<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        resources: &mut ResourceManager,
    ) -> GraphResult<()> {
        let mut desc = FramebufferDescriptor {
            label: Some(self.name.clone()),
            color: Vec::new(),
            depth: None,
            resolve: Vec::new(),
            width: 0,
            height: 0,
            layers: 1,
        };
        let mut inferred = None;

        let outputs = self.layout.outputs.clone();
        for output in &outputs {
            if output.role == AttachmentRole::Storage {
                continue;
            }
            let view = self.resolve_view(backend, resources, output.handle, output.subresource)?;
            let node = resources.node(output.handle);
            let attachment = FramebufferAttachment {
                view,
                format: node.descriptor().format,
                samples: node.descriptor().samples,
            };
            if inferred.is_none() {
                let (width, height) = node.descriptor().level_extent(output.subresource.base_level);
                inferred = Some(FramebufferSize {
                    width,
                    height,
                    layers: output.subresource.layer_count,
                });
            }
            match output.role {
                AttachmentRole::Color => desc.color.push(attachment),
                AttachmentRole::Depth => {
                    assert!(
                        desc.depth.is_none(),
                        "Pass '{}' declares more than one depth attachment",
                        self.name
                    );
                    desc.depth = Some(attachment);
                }
                AttachmentRole::Resolve => desc.resolve.push(attachment),
                AttachmentRole::Storage => unreachable!(),
            }
        }

        let Some(size) = self.layout.framebuffer_size.or(inferred) else {
            return Ok(());
        };
        desc.width = size.width;
        desc.height = size.height;
        desc.layers = size.layers;
        self.compiled.framebuffer = Some(backend.create_framebuffer(&desc)?);
        self.compiled.framebuffer_size = Some(size);
        Ok(())
    }

    fn registry<'a>(
        name: &'a str,
        kind: PassKind,
        compiled: &'a CompiledPass,
        user_data: &'a U,
    ) -> Registry<'a, U> {
        Registry::new(name, kind, compiled, user_data)
    }

    fn ensure_initialized(&self) -> GraphResult<()> {
        if self.state != PassState::Initialized {
            return Err(GraphError::NotCompiled {
                pass: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Re-evaluated every frame; nothing is remembered between calls.
    pub(crate) fn is_enabled(&mut self, user_data: &U) -> GraphResult<bool> {
        self.ensure_initialized()?;
        let registry = Self::registry(&self.name, self.kind, &self.compiled, user_data);
        Ok(self.body.is_enabled(&registry))
    }

    /// Record this frame's commands into the pass's command buffer.
    pub(crate) fn record(&mut self, user_data: &U) -> GraphResult<()> {
        self.ensure_initialized()?;
        let recorder = match self.recorder.as_mut() {
            Some(recorder) => recorder,
            None => panic!("Pass '{}' has no command recorder", self.name),
        };
        recorder.begin()?;
        let registry = Self::registry(&self.name, self.kind, &self.compiled, user_data);
        self.body.execute(&registry, recorder.as_mut());
        recorder.end()?;
        Ok(())
    }

    /// Submit the recorded commands with at most one wait and one signal semaphore.
    pub(crate) fn submit(
        &mut self,
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> GraphResult<()> {
        let recorder = match self.recorder.as_mut() {
            Some(recorder) => recorder,
            None => panic!("Pass '{}' submitted before it was initialized", self.name),
        };
        recorder.submit(wait.as_slice(), signal.as_slice(), fence)?;
        Ok(())
    }

    pub(crate) fn destroy<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        // Command buffers go first; they may reference the objects below.
        self.recorder = None;
        for pipeline in self.compiled.pipelines.drain(..) {
            backend.destroy_pipeline(pipeline);
        }
        if let Some(framebuffer) = self.compiled.framebuffer.take() {
            backend.destroy_framebuffer(framebuffer);
        }
        if let Some(set) = self.compiled.input_set.take() {
            backend.destroy_descriptor_set(set);
        }
        // Views belong to the resource nodes.
        self.compiled.views.clear();
        self.compiled.framebuffer_size = None;
        self.state = PassState::Built;
    }
}

impl<U> std::fmt::Debug for PassNode<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
