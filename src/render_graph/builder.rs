//! Setup-time recording of a pass's resources and pipelines

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

/// Handed to a pass while its setup runs.
///
/// Every call mutates the pass being built; no GPU work happens until the graph
/// is compiled. Pipeline setters are only valid between [`Builder::begin_pipeline`]
/// and [`Builder::end_pipeline`].
pub struct Builder<'a> {
    pass_name: &'a str,
    kind: PassKind,
    resources: &'a mut ResourceManager,
    layout: &'a mut PassLayout,
    pending: Option<GraphicsPipelineDescriptor>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(
        pass_name: &'a str,
        kind: PassKind,
        resources: &'a mut ResourceManager,
        layout: &'a mut PassLayout,
    ) -> Self {
        Self {
            pass_name,
            kind,
            resources,
            layout,
            pending: None,
        }
    }

    pub(crate) fn finish(self) {
        assert!(
            self.pending.is_none(),
            "Pass '{}': begin_pipeline without matching end_pipeline",
            self.pass_name
        );
    }

    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    // Resources

    /// Register a texture with the graph, or get the existing one of that name.
    pub fn create_texture(&mut self, name: &str, desc: ImageDescriptor) -> TextureHandle {
        self.resources.create_texture(name, desc)
    }

    /// Handle of an existing texture. Panics if `name` is unknown.
    pub fn texture(&self, name: &str) -> TextureHandle {
        self.resources.handle(name)
    }

    pub fn descriptor(&self, handle: TextureHandle) -> &ImageDescriptor {
        self.resources.node(handle).descriptor()
    }

    /// Declare an output written as a framebuffer attachment.
    pub fn write_texture(&mut self, handle: TextureHandle, role: AttachmentRole, subresource: Subresource) {
        if role == AttachmentRole::Storage {
            self.write_storage_image(handle, subresource);
            return;
        }
        assert!(
            self.kind == PassKind::Graphics,
            "Compute pass '{}' cannot write attachments; use write_storage_image",
            self.pass_name
        );
        self.layout.outputs.push(OutputDesc {
            handle,
            role,
            subresource,
        });
    }

    /// Declare an output written through a storage-image binding.
    pub fn write_storage_image(&mut self, handle: TextureHandle, subresource: Subresource) {
        self.layout.outputs.push(OutputDesc {
            handle,
            role: AttachmentRole::Storage,
            subresource,
        });
        self.layout.bindings.push(InputDesc {
            handle,
            binding: InputBinding::Storage,
            subresource,
        });
    }

    /// Declare an input bound as a combined image + sampler.
    pub fn read_texture(&mut self, handle: TextureHandle, sampler: SamplerHandle, subresource: Subresource) {
        self.push_input(InputDesc {
            handle,
            binding: InputBinding::Sampled(sampler),
            subresource,
        });
    }

    /// Declare an input bound as a storage image.
    pub fn read_storage_image(&mut self, handle: TextureHandle, subresource: Subresource) {
        self.push_input(InputDesc {
            handle,
            binding: InputBinding::Storage,
            subresource,
        });
    }

    fn push_input(&mut self, input: InputDesc) {
        self.layout.inputs.push(input);
        self.layout.bindings.push(input);
    }

    pub fn set_framebuffer_size(&mut self, width: u32, height: u32, layers: u32) {
        self.layout.framebuffer_size = Some(FramebufferSize {
            width,
            height,
            layers,
        });
    }

    // Pipelines

    pub fn begin_pipeline(&mut self) {
        assert!(
            self.pending.is_none(),
            "Pass '{}': begin_pipeline called twice",
            self.pass_name
        );
        self.pending = Some(GraphicsPipelineDescriptor::default());
    }

    /// Append the pipeline described since `begin_pipeline` to the pass.
    pub fn end_pipeline(&mut self) {
        let desc = match self.pending.take() {
            Some(desc) => desc,
            None => panic!(
                "Pass '{}': end_pipeline without begin_pipeline",
                self.pass_name
            ),
        };

        let pipeline = match self.kind {
            PassKind::Graphics => {
                assert!(
                    desc.shaders.iter().all(|s| s.stage != ShaderStage::Compute),
                    "Graphics pass '{}' was given a compute shader",
                    self.pass_name
                );
                PipelineDesc::Graphics(desc)
            }
            PassKind::Compute => {
                let mut shaders = desc.shaders.into_iter();
                let shader = match (shaders.next(), shaders.next()) {
                    (Some(shader), None) if shader.stage == ShaderStage::Compute => shader,
                    _ => panic!(
                        "Compute pass '{}' needs exactly one compute shader per pipeline",
                        self.pass_name
                    ),
                };
                PipelineDesc::Compute(ComputePipelineDescriptor {
                    label: desc.label,
                    shader,
                    push_constant_size: desc.push_constant_size,
                    set_layouts: desc.set_layouts,
                })
            }
        };
        self.layout.pipelines.push(pipeline);
    }

    fn pipeline_mut(&mut self) -> &mut GraphicsPipelineDescriptor {
        match self.pending.as_mut() {
            Some(desc) => desc,
            None => panic!(
                "Pass '{}': pipeline state set outside begin_pipeline/end_pipeline",
                self.pass_name
            ),
        }
    }

    pub fn set_pipeline_label(&mut self, label: &str) {
        self.pipeline_mut().label = Some(label.to_string());
    }

    pub fn enable_depth_test(&mut self, depth_write_enabled: bool, depth_compare: CompareFunction) {
        self.pipeline_mut().depth_stencil = Some(DepthStencilState {
            depth_write_enabled,
            depth_compare,
        });
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        self.pipeline_mut().rasterization.cull_mode = cull_mode;
    }

    pub fn set_front_face(&mut self, front_face: FrontFace) {
        self.pipeline_mut().rasterization.front_face = front_face;
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.pipeline_mut().rasterization.topology = topology;
    }

    pub fn set_polygon_mode(&mut self, polygon_mode: PolygonMode) {
        self.pipeline_mut().rasterization.polygon_mode = polygon_mode;
    }

    pub fn add_color_target(&mut self, target: ColorTargetState) {
        self.pipeline_mut().color_targets.push(target);
    }

    /// One blended color target per entry.
    pub fn add_blend_attachments(&mut self, blends: &[BlendState]) {
        let desc = self.pipeline_mut();
        desc.color_targets.extend(blends.iter().map(|blend| ColorTargetState {
            blend: Some(*blend),
            write_mask: ColorWrites::ALL,
        }));
    }

    pub fn add_shader(&mut self, shader: ShaderDesc) {
        self.pipeline_mut().shaders.push(shader);
    }

    /// Descriptor set layout bound after the pass's input set.
    pub fn add_shader_argument(&mut self, layout: DescriptorSetLayoutDesc) {
        self.pipeline_mut().set_layouts.push(layout);
    }

    pub fn set_vertex_input_element_desc(&mut self, attributes: &[VertexAttribute]) {
        self.pipeline_mut().vertex_attributes = attributes.to_vec();
    }

    pub fn set_vertex_input_view(&mut self, views: &[VertexInputView]) {
        self.pipeline_mut().vertex_views = views.to_vec();
    }

    pub fn set_push_constant_size(&mut self, size: u32) {
        self.pipeline_mut().push_constant_size = size;
    }

    pub fn set_blend_constant(&mut self, constant: [f32; 4]) {
        self.pipeline_mut().blend_constant = constant;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ImageDescriptor {
        ImageDescriptor::new_2d(
            32,
            32,
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::STORAGE_BINDING,
        )
    }

    #[test]
    fn test_edges_and_bindings_in_declaration_order() {
        let mut resources = ResourceManager::new();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new("blur", PassKind::Compute, &mut resources, &mut layout);

        let src = builder.create_texture("src", target());
        let dst = builder.create_texture("dst", target());
        builder.read_storage_image(src, Subresource::default());
        builder.write_storage_image(dst, Subresource::default());
        builder.finish();

        assert_eq!(layout.inputs().len(), 1);
        assert_eq!(layout.outputs()[0].role, AttachmentRole::Storage);
        let bound: Vec<_> = layout.bindings().iter().map(|b| b.handle).collect();
        assert_eq!(bound, vec![src, dst]);
        assert!(layout.reads(src));
        assert!(layout.writes(dst));
    }

    #[test]
    fn test_pipeline_state_is_accumulated() {
        let mut resources = ResourceManager::new();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new("forward", PassKind::Graphics, &mut resources, &mut layout);

        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::spirv(ShaderStage::Vertex, vec![0x0723_0203], "main"));
        builder.add_shader(ShaderDesc::spirv(ShaderStage::Fragment, vec![0x0723_0203], "main"));
        builder.enable_depth_test(true, CompareFunction::Less);
        builder.set_cull_mode(CullMode::Back);
        builder.add_blend_attachments(&[BlendState::alpha_blending()]);
        builder.set_push_constant_size(64);
        builder.end_pipeline();
        builder.begin_pipeline();
        builder.end_pipeline();
        builder.finish();

        assert_eq!(layout.pipelines().len(), 2);
        match &layout.pipelines()[0] {
            PipelineDesc::Graphics(desc) => {
                assert_eq!(desc.shaders.len(), 2);
                assert_eq!(desc.rasterization.cull_mode, CullMode::Back);
                assert_eq!(desc.color_targets.len(), 1);
                assert_eq!(desc.push_constant_size, 64);
                assert!(desc.depth_stencil.is_some());
            }
            other => panic!("unexpected pipeline {:?}", other),
        }
    }

    #[test]
    fn test_compute_pipeline_takes_single_shader() {
        let mut resources = ResourceManager::new();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new("cull", PassKind::Compute, &mut resources, &mut layout);
        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::spirv(ShaderStage::Compute, vec![0x0723_0203], "main"));
        builder.set_push_constant_size(16);
        builder.end_pipeline();
        builder.finish();

        match &layout.pipelines()[0] {
            PipelineDesc::Compute(desc) => {
                assert_eq!(desc.shader.stage, ShaderStage::Compute);
                assert_eq!(desc.push_constant_size, 16);
            }
            other => panic!("unexpected pipeline {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "outside begin_pipeline/end_pipeline")]
    fn test_setter_outside_pipeline_panics() {
        let mut resources = ResourceManager::new();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new("p", PassKind::Graphics, &mut resources, &mut layout);
        builder.set_cull_mode(CullMode::Front);
    }

    #[test]
    #[should_panic(expected = "without matching end_pipeline")]
    fn test_unclosed_pipeline_panics() {
        let mut resources = ResourceManager::new();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new("p", PassKind::Graphics, &mut resources, &mut layout);
        builder.begin_pipeline();
        builder.finish();
    }
}
