//! Shared helpers for the render graph integration tests.

#![allow(dead_code)]

use framegraph::backend::dummy::Submission;
use framegraph::backend::*;
use framegraph::render_graph::*;

/// Install a test logger once per binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn color_desc(width: u32, height: u32) -> ImageDescriptor {
    ImageDescriptor::new_2d(
        width,
        height,
        TextureFormat::Rgba8Unorm,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING,
    )
}

pub fn hdr_desc(width: u32, height: u32) -> ImageDescriptor {
    ImageDescriptor::new_2d(
        width,
        height,
        TextureFormat::Rgba16Float,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING,
    )
}

pub fn depth_desc(width: u32, height: u32) -> ImageDescriptor {
    ImageDescriptor::new_2d(
        width,
        height,
        TextureFormat::Depth32Float,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
    )
}

/// A graph with its backend, plus a second handle onto the same recorded state.
pub fn dummy_graph<U: 'static>() -> (RenderGraph<DummyBackend, U>, DummyBackend) {
    init_logging();
    let backend = DummyBackend::new();
    let probe = backend.clone();
    (RenderGraph::new(backend), probe)
}

/// Add a graphics pass writing `texture` as its single color attachment.
pub fn color_pass<U: 'static>(graph: &mut RenderGraph<DummyBackend, U>, name: &str, texture: &str) {
    let texture = texture.to_string();
    graph.add_pass(name, PassKind::Graphics, move |builder| {
        let handle = builder.create_texture(&texture, color_desc(32, 32));
        builder.write_texture(handle, AttachmentRole::Color, Subresource::default());
        |_: &Registry<'_, U>, _: &mut dyn CommandRecorder| {}
    });
}

/// Like [`color_pass`], gated by `enable`.
pub fn gated_pass<U: 'static>(
    graph: &mut RenderGraph<DummyBackend, U>,
    name: &str,
    texture: &str,
    enable: EnableCheck<U>,
) {
    let texture = texture.to_string();
    graph.add_pass_with_enable(
        name,
        PassKind::Graphics,
        move |builder| {
            let handle = builder.create_texture(&texture, color_desc(32, 32));
            builder.write_texture(handle, AttachmentRole::Color, Subresource::default());
            |_: &Registry<'_, U>, _: &mut dyn CommandRecorder| {}
        },
        enable,
    );
}

/// `(wait, signal)` of a submission made with at most one of each.
pub fn semaphore_pair(submission: &Submission) -> (Option<SemaphoreHandle>, Option<SemaphoreHandle>) {
    assert!(submission.wait.len() <= 1 && submission.signal.len() <= 1);
    (
        submission.wait.first().copied(),
        submission.signal.first().copied(),
    )
}

pub const FILL_SHADER: &str = r#"
@group(0) @binding(0) var target: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(target, vec2<i32>(id.xy), vec4<f32>(0.0, 0.0, 0.0, 1.0));
}
"#;
