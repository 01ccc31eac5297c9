//! Common types shared between backends

use bitflags::bitflags;
use glam::Vec4;

use crate::backend::traits::{BufferHandle, ImageViewHandle, SamplerHandle};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    Depth16Unorm,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth32Float
                | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::R16Float | TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rg16Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be copied from.
        const COPY_SRC = 1 << 0;
        /// Texture can be copied to.
        const COPY_DST = 1 << 1;
        /// Texture can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Texture can be used as a storage image.
        const STORAGE_BINDING = 1 << 3;
        /// Texture can be used as a color or depth attachment.
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
        const INDIRECT = 1 << 8;
    }
}

/// The array/cubemap variant of an image.
///
/// The kind decides how many layers the image owns and which view
/// dimensionality a subresource range resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

impl ImageKind {
    pub fn is_cube(&self) -> bool {
        matches!(self, ImageKind::Cube | ImageKind::CubeArray)
    }
}

/// Image descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Depth of a 3D image; 1 otherwise.
    pub depth: u32,
    /// Total layer count. Cube images carry 6 layers per cube.
    pub array_layers: u32,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub kind: ImageKind,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            depth: 1,
            array_layers: 1,
            mip_levels: 1,
            samples: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            kind: ImageKind::D2,
        }
    }
}

impl ImageDescriptor {
    /// A single-layer 2D image.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            ..Default::default()
        }
    }

    /// A cubemap with `size`x`size` faces.
    pub fn cube(size: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width: size,
            height: size,
            array_layers: 6,
            format,
            usage,
            kind: ImageKind::Cube,
            ..Default::default()
        }
    }

    /// A volume image.
    pub fn new_3d(
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> Self {
        Self {
            width,
            height,
            depth,
            format,
            usage,
            kind: ImageKind::D3,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Turns the image into an array of `layers` layers (or `layers` cubes for cubemaps).
    pub fn with_array_layers(mut self, layers: u32) -> Self {
        match self.kind {
            ImageKind::Cube | ImageKind::CubeArray => {
                self.array_layers = layers * 6;
                self.kind = if layers > 1 {
                    ImageKind::CubeArray
                } else {
                    ImageKind::Cube
                };
            }
            _ => {
                self.array_layers = layers;
                self.kind = if layers > 1 {
                    ImageKind::D2Array
                } else {
                    ImageKind::D2
                };
            }
        }
        self
    }

    /// Extent of the given mip level, never smaller than one texel.
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

/// Image view dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageViewType {
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

/// A layer/level range of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_level: u32,
    pub level_count: u32,
}

impl Default for Subresource {
    fn default() -> Self {
        Self {
            base_layer: 0,
            layer_count: 1,
            base_level: 0,
            level_count: 1,
        }
    }
}

impl Subresource {
    pub fn new(base_layer: u32, layer_count: u32, base_level: u32, level_count: u32) -> Self {
        Self {
            base_layer,
            layer_count,
            base_level,
            level_count,
        }
    }

    /// Every layer and level of an image.
    pub fn whole(desc: &ImageDescriptor) -> Self {
        Self::new(0, desc.array_layers, 0, desc.mip_levels)
    }

    /// A single mip level of layer 0.
    pub fn level(level: u32) -> Self {
        Self::new(0, 1, level, 1)
    }

    /// A single layer at mip level 0.
    pub fn layer(layer: u32) -> Self {
        Self::new(layer, 1, 0, 1)
    }
}

/// Image view descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ImageViewDescriptor {
    pub view_type: ImageViewType,
    pub format: TextureFormat,
    pub subresource: Subresource,
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

/// A vertex buffer binding slot
#[derive(Debug, Clone, PartialEq)]
pub struct VertexInputView {
    pub binding: u32,
    pub stride: u32,
    pub step_mode: VertexStepMode,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
}

/// Compare function for depth/stencil and comparison samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
    Constant,
    OneMinusConstant,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    pub fn additive() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent::default(),
        }
    }
}

bitflags! {
    /// Color channels written by a color target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = 0xF;
    }
}

/// Per-attachment output state of a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTargetState {
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilState {
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            polygon_mode: PolygonMode::Fill,
        }
    }
}

/// Shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

bitflags! {
    /// Shader stages a binding or push constant range is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::VERTEX.bits() | Self::FRAGMENT.bits() | Self::COMPUTE.bits();
    }
}

impl From<ShaderStage> for ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

/// Shader code handed to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum ShaderSource {
    /// WGSL text, compiled by the backend.
    Wgsl(String),
    /// Precompiled SPIR-V words.
    SpirV(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    pub source: ShaderSource,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn wgsl(stage: ShaderStage, source: impl Into<String>, entry_point: &str) -> Self {
        Self {
            stage,
            source: ShaderSource::Wgsl(source.into()),
            entry_point: entry_point.to_string(),
        }
    }

    pub fn spirv(stage: ShaderStage, words: Vec<u32>, entry_point: &str) -> Self {
        Self {
            stage,
            source: ShaderSource::SpirV(words),
            entry_point: entry_point.to_string(),
        }
    }
}

/// Descriptor binding type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    CombinedImageSampler,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub stages: ShaderStageFlags,
}

/// Layout of one descriptor set ("shader argument")
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, binding: u32, ty: DescriptorType, stages: ShaderStageFlags) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            ty,
            stages,
        });
        self
    }
}

/// The resource written into a descriptor binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    ImageSampler {
        view: ImageViewHandle,
        sampler: SamplerHandle,
    },
    StorageImage(ImageViewHandle),
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// Graphics pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub shaders: Vec<ShaderDesc>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub vertex_views: Vec<VertexInputView>,
    pub rasterization: RasterizationState,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
    pub blend_constant: [f32; 4],
    pub push_constant_size: u32,
    /// Descriptor set layouts in set-index order.
    pub set_layouts: Vec<DescriptorSetLayoutDesc>,
}

impl Default for GraphicsPipelineDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            shaders: Vec::new(),
            vertex_attributes: Vec::new(),
            vertex_views: Vec::new(),
            rasterization: RasterizationState::default(),
            depth_stencil: None,
            color_targets: Vec::new(),
            blend_constant: [0.0; 4],
            push_constant_size: 0,
            set_layouts: Vec::new(),
        }
    }
}

/// Compute pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: ShaderDesc,
    pub push_constant_size: u32,
    pub set_layouts: Vec<DescriptorSetLayoutDesc>,
}

/// One image attached to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferAttachment {
    pub view: ImageViewHandle,
    pub format: TextureFormat,
    pub samples: u32,
}

/// Framebuffer descriptor. Attachments are laid out as `color..., depth, resolve...`.
#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub color: Vec<FramebufferAttachment>,
    pub depth: Option<FramebufferAttachment>,
    pub resolve: Vec<FramebufferAttachment>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl FramebufferDescriptor {
    /// All attachments in binding order.
    pub fn attachments(&self) -> Vec<FramebufferAttachment> {
        self.color
            .iter()
            .chain(self.depth.iter())
            .chain(self.resolve.iter())
            .copied()
            .collect()
    }
}

/// Clear value for one framebuffer attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color(Vec4),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with the standard depth range.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler descriptor
#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            compare: None,
        }
    }
}

/// The queue a pass records for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Graphics,
    Compute,
}
