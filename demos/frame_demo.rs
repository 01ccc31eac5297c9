//! Headless frame graph demo.
//!
//! Builds a small deferred-style frame: a sky lookup table computed once with
//! `execute_alone`, then every frame a shadow pass (only while the sun is up),
//! a g-buffer pass, an optional bloom compute pass and a tonemap pass.
//!
//! ```bash
//! # Record everything on the dummy backend
//! cargo run --example frame_demo -- --frames 120
//!
//! # Run on the GPU without bloom
//! cargo run --example frame_demo -- --backend vulkan --no-bloom
//! ```

use std::error::Error;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use clap::Parser;
use glam::{Mat4, Vec3};

use framegraph::backend::*;
use framegraph::render_graph::*;
use framegraph::{BackendType, GraphConfig};

const FENCE_TIMEOUT: Duration = Duration::from_secs(5);
const SHADOW_MAP_SIZE: u32 = 1024;
const SKY_LUT_SIZE: u32 = 64;

// ============================================================================
// Command line
// ============================================================================

/// Graphics backend selection for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Record every call, no GPU needed.
    #[default]
    Dummy,
    /// Headless Vulkan via ash.
    Vulkan,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Dummy => BackendType::Dummy,
            CliBackend::Vulkan => BackendType::Vulkan,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "frame_demo", about = "Runs a small frame graph for a number of frames")]
struct Args {
    #[arg(long, value_enum, default_value_t = CliBackend::Dummy)]
    backend: CliBackend,

    /// Number of frames to render
    #[arg(long, default_value_t = 60)]
    frames: u32,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Skip the bloom compute pass
    #[arg(long)]
    no_bloom: bool,

    /// Disable Vulkan validation layers
    #[arg(long)]
    no_validation: bool,
}

// ============================================================================
// Per-frame scene data
// ============================================================================

/// User data handed to every pass
#[derive(Debug, Clone, Copy)]
struct Scene {
    /// Only set for the one-off sky lookup table run
    precompute: bool,
    bloom: bool,
    sun_direction: Vec3,
    light_view_proj: Mat4,
    exposure: f32,
}

impl Scene {
    /// The sun makes one full turn over `frames` frames.
    fn at(frame: u32, frames: u32, bloom: bool) -> Self {
        let angle = frame as f32 / frames.max(1) as f32 * std::f32::consts::TAU;
        let sun_direction = Vec3::new(angle.cos(), angle.sin(), 0.3).normalize();
        let light_view = Mat4::look_at_rh(sun_direction * 10.0, Vec3::ZERO, Vec3::Y);
        let light_proj = Mat4::orthographic_rh(-5.0, 5.0, -5.0, 5.0, 0.1, 20.0);
        Self {
            precompute: false,
            bloom,
            sun_direction,
            light_view_proj: light_proj * light_view,
            exposure: 1.0 + 0.5 * sun_direction.y.max(0.0),
        }
    }

    fn sun_visible(&self) -> bool {
        self.sun_direction.y > 0.0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TonemapParams {
    exposure: f32,
    bloom_strength: f32,
}

// ============================================================================
// Shaders
// ============================================================================

const SKY_LUT_SHADER: &str = r#"
@group(0) @binding(0) var lut: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(lut);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let t = f32(id.y) / f32(size.y - 1u);
    let horizon = vec3<f32>(0.9, 0.75, 0.6);
    let zenith = vec3<f32>(0.2, 0.4, 0.9);
    textureStore(lut, vec2<i32>(id.xy), vec4<f32>(mix(horizon, zenith, t), 1.0));
}
"#;

const SHADOW_SHADER: &str = r#"
struct Light {
    view_proj: mat4x4<f32>,
}
var<push_constant> light: Light;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let corner = vec3<f32>(f32(index & 1u), f32((index >> 1u) & 1u), f32((index >> 2u) & 1u));
    return light.view_proj * vec4<f32>(corner * 2.0 - 1.0, 1.0);
}
"#;

const FULLSCREEN_VERTEX: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = uv;
    return out;
}
"#;

// Binding 0 is the shadow map (combined image sampler), unused here.
const GBUFFER_FRAGMENT: &str = r#"
@group(0) @binding(1) var sky_lut: texture_storage_2d<rgba16float, read>;

struct GBuffer {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
}

@fragment
fn fs_main(in: VertexOutput) -> GBuffer {
    let size = vec2<f32>(textureDimensions(sky_lut));
    let texel = vec2<i32>(in.uv * (size - 1.0));
    var out: GBuffer;
    out.albedo = textureLoad(sky_lut, texel);
    out.normal = vec4<f32>(0.0, 1.0, 0.0, 1.0);
    return out;
}
"#;

const BLOOM_SHADER: &str = r#"
@group(0) @binding(0) var source: texture_storage_2d<rgba8unorm, read>;
@group(0) @binding(1) var target: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(target);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let base = vec2<i32>(id.xy * 2u);
    var sum = vec4<f32>(0.0);
    for (var dy = 0; dy < 2; dy++) {
        for (var dx = 0; dx < 2; dx++) {
            sum += textureLoad(source, base + vec2<i32>(dx, dy));
        }
    }
    let bright = max(sum.rgb * 0.25 - vec3<f32>(0.8), vec3<f32>(0.0));
    textureStore(target, vec2<i32>(id.xy), vec4<f32>(bright, 1.0));
}
"#;

const TONEMAP_FRAGMENT: &str = r#"
@group(0) @binding(0) var hdr: texture_storage_2d<rgba8unorm, read>;
@group(0) @binding(1) var bloom: texture_storage_2d<rgba16float, read>;

struct Tonemap {
    exposure: f32,
    bloom_strength: f32,
}
var<push_constant> params: Tonemap;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(in.uv * (vec2<f32>(textureDimensions(hdr)) - 1.0));
    let bloom_texel = vec2<i32>(in.uv * (vec2<f32>(textureDimensions(bloom)) - 1.0));
    let color = textureLoad(hdr, texel).rgb + params.bloom_strength * textureLoad(bloom, bloom_texel).rgb;
    return vec4<f32>(vec3<f32>(1.0) - exp(-color * params.exposure), 1.0);
}
"#;

fn fullscreen_shaders(builder: &mut Builder<'_>, fragment: &str) {
    let source = format!("{FULLSCREEN_VERTEX}{fragment}");
    builder.add_shader(ShaderDesc::wgsl(ShaderStage::Vertex, source.clone(), "vs_main"));
    builder.add_shader(ShaderDesc::wgsl(ShaderStage::Fragment, source, "fs_main"));
}

// ============================================================================
// Passes
// ============================================================================

/// Half resolution bright-pass, written as a struct pass.
struct BloomPass {
    width: u32,
    height: u32,
}

impl RenderPass<Scene> for BloomPass {
    fn kind(&self) -> PassKind {
        PassKind::Compute
    }

    fn setup(&mut self, builder: &mut Builder<'_>) {
        let albedo = builder.texture("albedo");
        let bloom = builder.create_texture(
            "bloom",
            ImageDescriptor::new_2d(
                self.width,
                self.height,
                TextureFormat::Rgba16Float,
                TextureUsage::STORAGE_BINDING,
            ),
        );
        builder.read_storage_image(albedo, Subresource::default());
        builder.write_storage_image(bloom, Subresource::default());

        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::wgsl(ShaderStage::Compute, BLOOM_SHADER, "main"));
        builder.end_pipeline();
    }

    fn execute(&mut self, registry: &Registry<'_, Scene>, recorder: &mut dyn CommandRecorder) {
        recorder.begin_pipeline(registry.pipeline(0), None, &[]);
        recorder.bind_descriptor_set(0, registry.input_descriptor_set());
        recorder.dispatch(self.width.div_ceil(8), self.height.div_ceil(8), 1);
        recorder.end_pipeline();
    }

    fn is_enabled(&mut self, registry: &Registry<'_, Scene>) -> bool {
        registry.user_data().bloom
    }
}

fn build_graph<B: GraphicsBackend>(graph: &mut RenderGraph<B, Scene>, args: &Args, shadow_sampler: SamplerHandle) {
    let (width, height) = (args.width, args.height);

    graph.add_pass_with_enable(
        "sky_lut",
        PassKind::Compute,
        |builder| {
            let lut = builder.create_texture(
                "sky_lut",
                ImageDescriptor::new_2d(
                    SKY_LUT_SIZE,
                    SKY_LUT_SIZE,
                    TextureFormat::Rgba16Float,
                    TextureUsage::STORAGE_BINDING,
                ),
            );
            builder.write_storage_image(lut, Subresource::default());
            builder.begin_pipeline();
            builder.add_shader(ShaderDesc::wgsl(ShaderStage::Compute, SKY_LUT_SHADER, "main"));
            builder.end_pipeline();

            |registry: &Registry<'_, Scene>, recorder: &mut dyn CommandRecorder| {
                recorder.begin_pipeline(registry.pipeline(0), None, &[]);
                recorder.bind_descriptor_set(0, registry.input_descriptor_set());
                recorder.dispatch(SKY_LUT_SIZE / 8, SKY_LUT_SIZE / 8, 1);
                recorder.end_pipeline();
            }
        },
        EnableCheck::with_registry(|registry: &Registry<'_, Scene>| registry.user_data().precompute),
    );

    graph.add_pass_with_enable(
        "shadow",
        PassKind::Graphics,
        |builder| {
            let shadow_map = builder.create_texture(
                "shadow_map",
                ImageDescriptor::new_2d(
                    SHADOW_MAP_SIZE,
                    SHADOW_MAP_SIZE,
                    TextureFormat::Depth32Float,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                ),
            );
            builder.write_texture(shadow_map, AttachmentRole::Depth, Subresource::default());
            builder.begin_pipeline();
            builder.add_shader(ShaderDesc::wgsl(ShaderStage::Vertex, SHADOW_SHADER, "vs_main"));
            builder.enable_depth_test(true, CompareFunction::Less);
            builder.set_cull_mode(CullMode::Back);
            builder.set_push_constant_size(std::mem::size_of::<Mat4>() as u32);
            builder.end_pipeline();

            |registry: &Registry<'_, Scene>, recorder: &mut dyn CommandRecorder| {
                recorder.begin_pipeline(
                    registry.pipeline(0),
                    Some(registry.framebuffer()),
                    &[ClearValue::DepthStencil {
                        depth: 1.0,
                        stencil: 0,
                    }],
                );
                recorder.set_viewports(&[registry.viewport()]);
                recorder.set_scissors(&[registry.scissor()]);
                recorder.push_constant(
                    ShaderStageFlags::VERTEX_FRAGMENT,
                    &registry.user_data().light_view_proj,
                );
                recorder.draw(36, 1, 0, 0);
                recorder.end_pipeline();
            }
        },
        EnableCheck::with_registry(|registry: &Registry<'_, Scene>| registry.user_data().sun_visible()),
    );

    graph.add_pass("gbuffer", PassKind::Graphics, |builder| {
        let shadow_map = builder.texture("shadow_map");
        let sky_lut = builder.texture("sky_lut");
        let attachment = TextureUsage::RENDER_ATTACHMENT;
        let albedo = builder.create_texture(
            "albedo",
            ImageDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                attachment | TextureUsage::STORAGE_BINDING,
            ),
        );
        let normal = builder.create_texture(
            "normal",
            ImageDescriptor::new_2d(width, height, TextureFormat::Rgba16Float, attachment),
        );
        let depth = builder.create_texture(
            "scene_depth",
            ImageDescriptor::new_2d(width, height, TextureFormat::Depth32Float, attachment),
        );

        builder.read_texture(shadow_map, shadow_sampler, Subresource::default());
        builder.read_storage_image(sky_lut, Subresource::default());
        builder.write_texture(albedo, AttachmentRole::Color, Subresource::default());
        builder.write_texture(normal, AttachmentRole::Color, Subresource::default());
        builder.write_texture(depth, AttachmentRole::Depth, Subresource::default());

        builder.begin_pipeline();
        fullscreen_shaders(builder, GBUFFER_FRAGMENT);
        builder.enable_depth_test(true, CompareFunction::LessEqual);
        builder.set_cull_mode(CullMode::None);
        builder.end_pipeline();

        |registry: &Registry<'_, Scene>, recorder: &mut dyn CommandRecorder| {
            recorder.begin_pipeline(
                registry.pipeline(0),
                Some(registry.framebuffer()),
                &[
                    ClearValue::Color(glam::Vec4::ZERO),
                    ClearValue::Color(glam::Vec4::ZERO),
                    ClearValue::DepthStencil {
                        depth: 1.0,
                        stencil: 0,
                    },
                ],
            );
            recorder.set_viewports(&[registry.viewport()]);
            recorder.set_scissors(&[registry.scissor()]);
            recorder.bind_descriptor_set(0, registry.input_descriptor_set());
            recorder.draw(3, 1, 0, 0);
            recorder.end_pipeline();
        }
    });

    graph.add_struct_pass(
        "bloom",
        BloomPass {
            width: (width / 2).max(1),
            height: (height / 2).max(1),
        },
    );

    graph.add_pass("tonemap", PassKind::Graphics, |builder| {
        let albedo = builder.texture("albedo");
        let bloom = builder.texture("bloom");
        let ldr = builder.create_texture(
            "ldr",
            ImageDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
            ),
        );
        builder.read_storage_image(albedo, Subresource::default());
        builder.read_storage_image(bloom, Subresource::default());
        builder.write_texture(ldr, AttachmentRole::Color, Subresource::default());

        builder.begin_pipeline();
        fullscreen_shaders(builder, TONEMAP_FRAGMENT);
        builder.set_cull_mode(CullMode::None);
        builder.set_push_constant_size(std::mem::size_of::<TonemapParams>() as u32);
        builder.end_pipeline();

        |registry: &Registry<'_, Scene>, recorder: &mut dyn CommandRecorder| {
            let scene = registry.user_data();
            let params = TonemapParams {
                exposure: scene.exposure,
                bloom_strength: if scene.bloom { 0.6 } else { 0.0 },
            };
            recorder.begin_pipeline(registry.pipeline(0), Some(registry.framebuffer()), &[]);
            recorder.set_viewports(&[registry.viewport()]);
            recorder.set_scissors(&[registry.scissor()]);
            recorder.bind_descriptor_set(0, registry.input_descriptor_set());
            recorder.push_constant(ShaderStageFlags::VERTEX_FRAGMENT, &params);
            recorder.draw(3, 1, 0, 0);
            recorder.end_pipeline();
        }
    });
}

// ============================================================================
// Driver
// ============================================================================

fn run<B: GraphicsBackend>(backend: B, config: GraphConfig, args: &Args) -> Result<(), Box<dyn Error>> {
    let mut graph: RenderGraph<B, Scene> = RenderGraph::with_config(backend, config);

    let shadow_sampler = graph.backend_mut().create_sampler(&SamplerDescriptor {
        label: Some("shadow".to_string()),
        compare: Some(CompareFunction::LessEqual),
        ..Default::default()
    })?;
    build_graph(&mut graph, args, shadow_sampler);
    graph.compile()?;
    log::info!("Render graph:\n{}", graph.describe());

    let fence = graph.backend_mut().create_fence(false)?;
    let bloom = !args.no_bloom;

    let precompute = Scene {
        precompute: true,
        ..Scene::at(0, args.frames, bloom)
    };
    graph.execute_alone("sky_lut", &precompute, None, None, Some(fence))?;
    graph.backend_mut().wait_fence(fence, FENCE_TIMEOUT)?;
    graph.backend_mut().reset_fence(fence)?;
    log::info!("Sky lookup table ready");

    let start = Instant::now();
    for frame in 0..args.frames {
        let scene = Scene::at(frame, args.frames, bloom);
        graph.execute(&scene, None, None, Some(fence))?;
        graph.backend_mut().wait_fence(fence, FENCE_TIMEOUT)?;
        graph.backend_mut().reset_fence(fence)?;

        if frame % 30 == 0 {
            log::info!(
                "Frame {}: sun at {:.2}, shadows {}",
                frame,
                scene.sun_direction.y,
                if scene.sun_visible() { "on" } else { "off" }
            );
        }
    }
    let elapsed = start.elapsed();
    log::info!(
        "{} frames in {:.2?} ({:.2?} per frame)",
        args.frames,
        elapsed,
        elapsed / args.frames.max(1)
    );

    graph.backend_mut().wait_idle()?;
    graph.backend_mut().destroy_fence(fence);
    graph.backend_mut().destroy_sampler(shadow_sampler);
    Ok(())
}

#[cfg(feature = "vulkan-backend")]
fn run_vulkan(config: GraphConfig, args: &Args) -> Result<(), Box<dyn Error>> {
    use framegraph::{VulkanBackend, VulkanConfig};

    let backend = VulkanBackend::new(&VulkanConfig::from_graph_config(&config))?;
    log::info!("Running on {}", backend.device_name());
    run(backend, config, args)
}

#[cfg(not(feature = "vulkan-backend"))]
fn run_vulkan(_config: GraphConfig, _args: &Args) -> Result<(), Box<dyn Error>> {
    Err("built without the vulkan-backend feature".into())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let backend = BackendType::from(args.backend);
    let config = GraphConfig {
        label: "frame_demo".to_string(),
        backend,
        validation: !args.no_validation && cfg!(debug_assertions),
        ..Default::default()
    };
    if !backend.is_available() {
        return Err(format!("{:?} backend is not available in this build", backend).into());
    }

    match backend {
        BackendType::Dummy => {
            let backend = DummyBackend::new();
            let probe = backend.clone();
            run(backend, config, &args)?;
            log::info!(
                "Dummy backend recorded {} submissions",
                probe.submissions().len()
            );
        }
        BackendType::Vulkan => run_vulkan(config, &args)?,
    }
    Ok(())
}
