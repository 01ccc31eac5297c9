//! Render graph integration tests.
//!
//! Every test drives a [`RenderGraph`] on the recording `DummyBackend` and checks
//! what reached the "GPU": created objects, recorded commands and the
//! semaphores/fences attached to each submission.
//!
//! ```bash
//! cargo test --test render_graph_tests
//! ```

mod common;

use std::cell::Cell;
use std::rc::Rc;

use rstest::rstest;

use common::{
    color_desc, color_pass, depth_desc, dummy_graph, gated_pass, hdr_desc, semaphore_pair, FILL_SHADER,
};
use framegraph::backend::dummy::{ObjectKind, RecordedCommand};
use framegraph::backend::*;
use framegraph::render_graph::*;
use framegraph::GraphError;

/// Per-frame switches used as user data
#[derive(Debug, Clone, Copy)]
struct Toggles {
    shadows: bool,
    bloom: bool,
    exposure: f32,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            shadows: true,
            bloom: true,
            exposure: 1.0,
        }
    }
}

// ============================================================================
// Semaphore chain
// ============================================================================

#[test]
fn test_three_enabled_passes_chain_semaphores() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "p1", "a");
    color_pass(&mut graph, "p2", "b");
    color_pass(&mut graph, "p3", "c");
    graph.compile().unwrap();

    graph.execute(&(), None, None, None).unwrap();

    let pool = graph.semaphores().to_vec();
    assert_eq!(pool.len(), 2);
    let submissions = probe.submissions();
    assert_eq!(probe.submitted_labels(), vec!["p1", "p2", "p3"]);
    assert_eq!(semaphore_pair(&submissions[0]), (None, Some(pool[0])));
    assert_eq!(semaphore_pair(&submissions[1]), (Some(pool[0]), Some(pool[1])));
    assert_eq!(semaphore_pair(&submissions[2]), (Some(pool[1]), None));
}

#[test]
fn test_disabled_middle_pass_is_skipped_in_chain() {
    let (mut graph, probe) = dummy_graph::<Toggles>();
    color_pass(&mut graph, "p1", "a");
    gated_pass(
        &mut graph,
        "p2",
        "b",
        EnableCheck::with_registry(|registry: &Registry<'_, Toggles>| registry.user_data().bloom),
    );
    color_pass(&mut graph, "p3", "c");
    graph.compile().unwrap();

    let toggles = Toggles {
        bloom: false,
        ..Default::default()
    };
    graph.execute(&toggles, None, None, None).unwrap();

    let pool = graph.semaphores().to_vec();
    let submissions = probe.submissions();
    assert_eq!(probe.submitted_labels(), vec!["p1", "p3"]);
    assert_eq!(semaphore_pair(&submissions[0]), (None, Some(pool[0])));
    assert_eq!(semaphore_pair(&submissions[1]), (Some(pool[0]), None));
}

#[test]
fn test_external_semaphores_and_fence_bracket_the_frame() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "first", "a");
    color_pass(&mut graph, "second", "b");
    graph.compile().unwrap();

    let acquire = graph.backend_mut().create_semaphore().unwrap();
    let release = graph.backend_mut().create_semaphore().unwrap();
    let fence = graph.backend_mut().create_fence(false).unwrap();
    graph
        .execute(&(), Some(acquire), Some(release), Some(fence))
        .unwrap();

    let pool = graph.semaphores().to_vec();
    let submissions = probe.submissions();
    assert_eq!(semaphore_pair(&submissions[0]), (Some(acquire), Some(pool[0])));
    assert_eq!(semaphore_pair(&submissions[1]), (Some(pool[0]), Some(release)));
    assert_eq!(submissions[0].fence, None);
    assert_eq!(submissions[1].fence, Some(fence));
    assert!(probe.is_fence_signaled(fence));
}

#[test]
fn test_single_pass_gets_both_external_semaphores() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "only", "a");
    graph.compile().unwrap();

    let acquire = graph.backend_mut().create_semaphore().unwrap();
    let release = graph.backend_mut().create_semaphore().unwrap();
    graph.execute(&(), Some(acquire), Some(release), None).unwrap();

    let submissions = probe.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(semaphore_pair(&submissions[0]), (Some(acquire), Some(release)));
}

#[test]
fn test_no_enabled_pass_submits_nothing() {
    let (mut graph, probe) = dummy_graph::<()>();
    gated_pass(&mut graph, "off", "a", EnableCheck::predicate(|| false));
    graph.compile().unwrap();

    let fence = graph.backend_mut().create_fence(false).unwrap();
    graph.execute(&(), None, None, Some(fence)).unwrap();

    assert!(probe.submissions().is_empty());
    assert!(!probe.is_fence_signaled(fence));
}

// ============================================================================
// Semaphore pool sizing
// ============================================================================

#[rstest]
#[case::empty(0, 0)]
#[case::single(1, 0)]
#[case::pair(2, 1)]
#[case::many(5, 4)]
fn test_semaphore_pool_size(#[case] passes: usize, #[case] expected: usize) {
    let (mut graph, probe) = dummy_graph::<()>();
    for index in 0..passes {
        color_pass(&mut graph, &format!("pass{index}"), &format!("texture{index}"));
    }
    graph.compile().unwrap();

    assert_eq!(graph.semaphore_pool_size(), expected);
    assert_eq!(probe.live_count(ObjectKind::Semaphore), expected);
}

#[test]
fn test_pool_counts_disabled_passes() {
    let (mut graph, _probe) = dummy_graph::<()>();
    color_pass(&mut graph, "a", "a");
    gated_pass(&mut graph, "b", "b", EnableCheck::predicate(|| false));
    gated_pass(&mut graph, "c", "c", EnableCheck::predicate(|| false));
    graph.compile().unwrap();

    assert_eq!(graph.semaphore_pool_size(), 2);
}

#[test]
fn test_recompile_rebuilds_pool() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "a", "a");
    color_pass(&mut graph, "b", "b");
    graph.compile().unwrap();
    let before = graph.semaphores().to_vec();

    color_pass(&mut graph, "c", "c");
    graph.compile().unwrap();

    assert_eq!(graph.semaphore_pool_size(), 2);
    assert_eq!(probe.live_count(ObjectKind::Semaphore), 2);
    assert_eq!(probe.created_count(ObjectKind::Semaphore), 3);
    assert!(before.iter().all(|s| !probe.is_alive(s.raw())));
}

// ============================================================================
// Enable gating
// ============================================================================

#[test]
fn test_predicate_is_reevaluated_every_frame() {
    let (mut graph, probe) = dummy_graph::<()>();
    let enabled = Rc::new(Cell::new(false));
    let flag = Rc::clone(&enabled);
    gated_pass(&mut graph, "gated", "a", EnableCheck::predicate(move || flag.get()));
    graph.compile().unwrap();

    graph.execute(&(), None, None, None).unwrap();
    assert!(probe.submissions().is_empty());

    enabled.set(true);
    graph.execute(&(), None, None, None).unwrap();
    assert_eq!(probe.submitted_labels(), vec!["gated"]);

    enabled.set(false);
    graph.execute(&(), None, None, None).unwrap();
    assert_eq!(probe.submitted_labels(), vec!["gated"]);
}

#[test]
fn test_registry_predicate_sees_user_data() {
    let (mut graph, probe) = dummy_graph::<Toggles>();
    gated_pass(
        &mut graph,
        "shadow",
        "shadow_map",
        EnableCheck::with_registry(|registry: &Registry<'_, Toggles>| {
            assert_eq!(registry.pass_name(), "shadow");
            registry.user_data().shadows
        }),
    );
    graph.compile().unwrap();

    for shadows in [true, false, true] {
        let toggles = Toggles {
            shadows,
            ..Default::default()
        };
        graph.execute(&toggles, None, None, None).unwrap();
    }
    assert_eq!(probe.submitted_labels(), vec!["shadow", "shadow"]);
}

struct BloomPass {
    executed: Rc<Cell<u32>>,
}

impl RenderPass<Toggles> for BloomPass {
    fn kind(&self) -> PassKind {
        PassKind::Compute
    }

    fn setup(&mut self, builder: &mut Builder<'_>) {
        let target = builder.create_texture("bloom", hdr_desc(16, 16));
        builder.write_storage_image(target, Subresource::default());
        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::wgsl(ShaderStage::Compute, FILL_SHADER, "main"));
        builder.set_push_constant_size(4);
        builder.end_pipeline();
    }

    fn execute(&mut self, registry: &Registry<'_, Toggles>, recorder: &mut dyn CommandRecorder) {
        self.executed.set(self.executed.get() + 1);
        recorder.begin_pipeline(registry.pipeline(0), None, &[]);
        recorder.bind_descriptor_set(0, registry.input_descriptor_set());
        recorder.push_constant(ShaderStageFlags::COMPUTE, &registry.user_data().exposure);
        recorder.dispatch(2, 2, 1);
        recorder.end_pipeline();
    }

    fn is_enabled(&mut self, registry: &Registry<'_, Toggles>) -> bool {
        registry.user_data().bloom
    }
}

#[test]
fn test_struct_pass_enable_and_user_data() {
    let (mut graph, probe) = dummy_graph::<Toggles>();
    let executed = Rc::new(Cell::new(0));
    graph.add_struct_pass(
        "bloom",
        BloomPass {
            executed: Rc::clone(&executed),
        },
    );
    graph.compile().unwrap();

    graph
        .execute(
            &Toggles {
                bloom: false,
                ..Default::default()
            },
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(executed.get(), 0);

    let toggles = Toggles {
        exposure: 2.5,
        ..Default::default()
    };
    graph.execute(&toggles, None, None, None).unwrap();
    assert_eq!(executed.get(), 1);

    let submissions = probe.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, PassKind::Compute);
    assert!(submissions[0].commands.contains(&RecordedCommand::PushConstants {
        stages: ShaderStageFlags::COMPUTE,
        offset: 0,
        data: 2.5f32.to_ne_bytes().to_vec(),
    }));
    assert!(submissions[0]
        .commands
        .contains(&RecordedCommand::Dispatch { x: 2, y: 2, z: 1 }));
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_registration_order_is_execution_order() {
    let (mut graph, probe) = dummy_graph::<()>();
    for name in ["lighting", "gbuffer", "post", "shadow"] {
        color_pass(&mut graph, name, name);
    }
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    assert_eq!(
        probe.submitted_labels(),
        vec!["lighting", "gbuffer", "post", "shadow"]
    );
    assert_eq!(graph.pass_names(), vec!["lighting", "gbuffer", "post", "shadow"]);
}

#[test]
fn test_read_before_write_is_reported_not_reordered() {
    let (mut graph, probe) = dummy_graph::<()>();
    graph.add_pass("consumer", PassKind::Compute, |builder| {
        let lit = builder.create_texture("lit", color_desc(32, 32));
        builder.read_storage_image(lit, Subresource::default());
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    color_pass(&mut graph, "producer", "lit");
    graph.compile().unwrap();

    let hazards = graph.validate_order();
    assert_eq!(
        hazards,
        vec![OrderHazard {
            texture: "lit".to_string(),
            reader: "consumer".to_string(),
            writers: vec!["producer".to_string()],
        }]
    );

    graph.execute(&(), None, None, None).unwrap();
    assert_eq!(probe.submitted_labels(), vec!["consumer", "producer"]);
}

// ============================================================================
// execute_alone
// ============================================================================

#[test]
fn test_execute_alone_unknown_pass_is_tolerated() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "known", "a");
    graph.compile().unwrap();

    graph.execute_alone("missing", &(), None, None, None).unwrap();
    assert!(probe.submissions().is_empty());
}

#[test]
fn test_execute_alone_disabled_pass_is_skipped() {
    let (mut graph, probe) = dummy_graph::<()>();
    gated_pass(&mut graph, "precompute", "lut", EnableCheck::predicate(|| false));
    graph.compile().unwrap();

    graph.execute_alone("precompute", &(), None, None, None).unwrap();
    assert!(probe.submissions().is_empty());
}

#[test]
fn test_execute_alone_uses_given_sync_objects() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "frame", "a");
    color_pass(&mut graph, "precompute", "lut");
    graph.compile().unwrap();

    let wait = graph.backend_mut().create_semaphore().unwrap();
    let signal = graph.backend_mut().create_semaphore().unwrap();
    let fence = graph.backend_mut().create_fence(false).unwrap();
    graph
        .execute_alone("precompute", &(), Some(wait), Some(signal), Some(fence))
        .unwrap();

    let submissions = probe.submissions();
    assert_eq!(probe.submitted_labels(), vec!["precompute"]);
    assert_eq!(semaphore_pair(&submissions[0]), (Some(wait), Some(signal)));
    assert_eq!(submissions[0].fence, Some(fence));

    graph.backend_mut().wait_fence(fence, std::time::Duration::from_secs(1)).unwrap();
    graph.backend_mut().reset_fence(fence).unwrap();
    assert!(!probe.is_fence_signaled(fence));
}

#[test]
fn test_execute_alone_picks_first_duplicate() {
    let (mut graph, probe) = dummy_graph::<()>();
    for marker in [1u32, 2u32] {
        graph.add_pass("dup", PassKind::Graphics, move |builder| {
            let target = builder.create_texture(&format!("target{marker}"), color_desc(8, 8));
            builder.write_texture(target, AttachmentRole::Color, Subresource::default());
            move |_: &Registry<'_, ()>, recorder: &mut dyn CommandRecorder| {
                recorder.push_constant(ShaderStageFlags::FRAGMENT, &marker);
            }
        });
    }
    graph.compile().unwrap();

    graph.execute_alone("dup", &(), None, None, None).unwrap();

    let submissions = probe.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0].commands,
        vec![RecordedCommand::PushConstants {
            stages: ShaderStageFlags::FRAGMENT,
            offset: 0,
            data: 1u32.to_ne_bytes().to_vec(),
        }]
    );
}

#[test]
fn test_execute_before_compile_is_an_error() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "early", "a");

    let result = graph.execute_alone("early", &(), None, None, None);
    assert!(matches!(result, Err(GraphError::NotCompiled { ref pass }) if pass == "early"));
    assert!(probe.submissions().is_empty());
}

// ============================================================================
// Resources
// ============================================================================

#[test]
fn test_duplicate_texture_returns_first_handle() {
    let (mut graph, probe) = dummy_graph::<()>();
    let first = graph.create_texture("A", color_desc(64, 64));
    let second = graph.create_texture("A", color_desc(128, 32));
    assert_eq!(first, second);
    assert_eq!(graph.resources().len(), 1);

    graph.compile().unwrap();
    let image = graph.resources().node(first).image().unwrap();
    let desc = probe.image_descriptor(image).unwrap();
    assert_eq!((desc.width, desc.height), (64, 64));
}

#[test]
fn test_compile_twice_creates_textures_once() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "a", "a");
    graph.compile().unwrap();
    graph.compile().unwrap();

    assert_eq!(probe.created_count(ObjectKind::Image), 1);
    assert_eq!(probe.created_count(ObjectKind::Framebuffer), 1);
}

#[rstest]
#[case::same_range(Subresource::default(), 1)]
#[case::other_level(Subresource::level(1), 2)]
fn test_views_are_memoized(#[case] read_range: Subresource, #[case] expected_views: usize) {
    let (mut graph, probe) = dummy_graph::<()>();
    let texture = graph.create_texture("hdr", hdr_desc(32, 32).with_mip_levels(2));
    graph.add_pass("write", PassKind::Graphics, move |builder| {
        builder.write_texture(texture, AttachmentRole::Color, Subresource::default());
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    graph.add_pass("read", PassKind::Compute, move |builder| {
        builder.read_storage_image(texture, read_range);
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    graph.compile().unwrap();

    assert_eq!(graph.resources().node(texture).view_count(), expected_views);
    assert_eq!(probe.created_count(ObjectKind::ImageView), expected_views);
}

#[test]
fn test_resource_manager_view_cache() {
    let mut backend = DummyBackend::new();
    let mut resources = ResourceManager::new();
    let cube = resources.create_texture(
        "environment",
        ImageDescriptor::cube(64, TextureFormat::Rgba16Float, TextureUsage::TEXTURE_BINDING),
    );
    resources.create_all(&mut backend).unwrap();

    let whole = Subresource::new(0, 6, 0, 1);
    let first = resources.image_view(&mut backend, cube, whole).unwrap();
    let again = resources.image_view(&mut backend, cube, whole).unwrap();
    let face = resources.image_view(&mut backend, cube, Subresource::layer(3)).unwrap();

    assert_eq!(first, again);
    assert_ne!(first, face);
    assert_eq!(backend.view_descriptor(first).unwrap().1.view_type, ImageViewType::Cube);
    assert_eq!(backend.view_descriptor(face).unwrap().1.view_type, ImageViewType::D2);
}

#[test]
fn test_imported_texture_survives_the_graph() {
    let (mut graph, probe) = dummy_graph::<()>();
    let desc = color_desc(40, 30);
    let external = graph.backend_mut().create_image(&desc).unwrap();
    let target = graph.import_texture("backbuffer", external, desc);
    graph.add_pass("present_blit", PassKind::Graphics, move |builder| {
        builder.write_texture(target, AttachmentRole::Color, Subresource::default());
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    graph.compile().unwrap();

    assert_eq!(probe.created_count(ObjectKind::Image), 1);
    let framebuffer = graph.pass("present_blit").unwrap().framebuffer().unwrap();
    let fb = probe.framebuffer_descriptor(framebuffer).unwrap();
    assert_eq!((fb.width, fb.height), (40, 30));

    drop(graph);
    assert!(probe.is_alive(external.raw()));
    assert_eq!(probe.live_count(ObjectKind::ImageView), 0);
    assert_eq!(probe.live_count(ObjectKind::Framebuffer), 0);
}

// ============================================================================
// Pass initialization
// ============================================================================

#[test]
fn test_input_descriptor_set_follows_declaration_order() {
    let (mut graph, probe) = dummy_graph::<()>();
    let sampler = graph
        .backend_mut()
        .create_sampler(&SamplerDescriptor::default())
        .unwrap();
    let albedo = graph.create_texture("albedo", color_desc(32, 32));
    let normals = graph.create_texture("normals", hdr_desc(32, 32));
    color_pass(&mut graph, "gbuffer", "albedo");
    graph.add_pass("lighting", PassKind::Graphics, move |builder| {
        builder.read_texture(albedo, sampler, Subresource::default());
        builder.read_storage_image(normals, Subresource::default());
        let lit = builder.create_texture("lit", hdr_desc(32, 32));
        builder.write_texture(lit, AttachmentRole::Color, Subresource::default());
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    graph.compile().unwrap();

    let set = graph.pass("lighting").unwrap().input_descriptor_set().unwrap();
    let (layout, writes) = probe.descriptor_set(set).unwrap();
    let types: Vec<_> = layout.bindings.iter().map(|b| (b.binding, b.ty)).collect();
    assert_eq!(
        types,
        vec![
            (0, DescriptorType::CombinedImageSampler),
            (1, DescriptorType::StorageImage),
        ]
    );
    assert!(layout
        .bindings
        .iter()
        .all(|b| b.stages == ShaderStageFlags::VERTEX_FRAGMENT));
    assert!(matches!(
        writes[0].resource,
        DescriptorResource::ImageSampler { sampler: s, .. } if s == sampler
    ));
    assert!(matches!(writes[1].resource, DescriptorResource::StorageImage(_)));

    // Writers only get no input set.
    assert!(graph.pass("gbuffer").unwrap().input_descriptor_set().is_none());
}

#[test]
fn test_framebuffer_attachment_order() {
    let (mut graph, probe) = dummy_graph::<()>();
    graph.add_pass("forward", PassKind::Graphics, |builder| {
        let resolved = builder.create_texture("resolved", color_desc(64, 64));
        let depth = builder.create_texture("depth", depth_desc(64, 64).with_samples(4));
        let msaa = builder.create_texture("msaa", hdr_desc(64, 64).with_samples(4));
        builder.write_texture(resolved, AttachmentRole::Resolve, Subresource::default());
        builder.write_texture(depth, AttachmentRole::Depth, Subresource::default());
        builder.write_texture(msaa, AttachmentRole::Color, Subresource::default());
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
    graph.compile().unwrap();

    let framebuffer = graph.pass("forward").unwrap().framebuffer().unwrap();
    let desc = probe.framebuffer_descriptor(framebuffer).unwrap();
    let formats: Vec<_> = desc.attachments().iter().map(|a| a.format).collect();
    assert_eq!(
        formats,
        vec![
            TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float,
            TextureFormat::Rgba8Unorm,
        ]
    );
    assert_eq!(desc.color[0].samples, 4);
}

#[rstest]
#[case::inferred_from_level(None, (32, 16, 1))]
#[case::explicit(Some((20, 10, 1)), (20, 10, 1))]
fn test_framebuffer_size(#[case] explicit: Option<(u32, u32, u32)>, #[case] expected: (u32, u32, u32)) {
    let (mut graph, probe) = dummy_graph::<()>();
    let seen = Rc::new(Cell::new((0, 0, 0)));
    let seen_in_pass = Rc::clone(&seen);
    graph.add_pass("downsample", PassKind::Graphics, move |builder| {
        let chain = builder.create_texture("chain", color_desc(64, 32).with_mip_levels(2));
        builder.write_texture(chain, AttachmentRole::Color, Subresource::level(1));
        if let Some((width, height, layers)) = explicit {
            builder.set_framebuffer_size(width, height, layers);
        }
        move |registry: &Registry<'_, ()>, recorder: &mut dyn CommandRecorder| {
            seen_in_pass.set(registry.framebuffer_size());
            recorder.set_viewports(&[registry.viewport()]);
        }
    });
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    let framebuffer = graph.pass("downsample").unwrap().framebuffer().unwrap();
    let desc = probe.framebuffer_descriptor(framebuffer).unwrap();
    assert_eq!((desc.width, desc.height, desc.layers), expected);
    assert_eq!(seen.get(), expected);
}

#[test]
fn test_graphics_pipeline_gets_input_layout_and_color_targets() {
    let (mut graph, probe) = dummy_graph::<()>();
    let source = graph.create_texture("source", hdr_desc(32, 32));
    color_pass(&mut graph, "produce", "source");
    graph.add_pass("tonemap", PassKind::Graphics, move |builder| {
        builder.read_storage_image(source, Subresource::default());
        let ldr = builder.create_texture("ldr", color_desc(32, 32));
        builder.write_texture(ldr, AttachmentRole::Color, Subresource::default());
        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::wgsl(ShaderStage::Vertex, "", "vs_main"));
        builder.add_shader(ShaderDesc::wgsl(ShaderStage::Fragment, "", "fs_main"));
        builder.set_cull_mode(CullMode::None);
        builder.end_pipeline();
        |registry: &Registry<'_, ()>, recorder: &mut dyn CommandRecorder| {
            recorder.begin_pipeline(
                registry.pipeline(0),
                Some(registry.framebuffer()),
                &[ClearValue::Color(glam::Vec4::ZERO)],
            );
            recorder.bind_descriptor_set(0, registry.input_descriptor_set());
            recorder.draw(3, 1, 0, 0);
            recorder.end_pipeline();
        }
    });
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    let pass = graph.pass("tonemap").unwrap();
    let (desc, framebuffer) = probe.graphics_pipeline(pass.pipelines()[0]).unwrap();
    assert_eq!(Some(framebuffer), pass.framebuffer());
    assert_eq!(desc.label.as_deref(), Some("tonemap"));
    assert_eq!(desc.set_layouts.len(), 1);
    assert_eq!(desc.set_layouts[0].bindings[0].ty, DescriptorType::StorageImage);
    assert_eq!(desc.color_targets.len(), 1);
    assert_eq!(desc.rasterization.cull_mode, CullMode::None);

    let tonemap = probe
        .submissions()
        .into_iter()
        .find(|s| s.label == "tonemap")
        .unwrap();
    assert_eq!(
        tonemap.commands.first(),
        Some(&RecordedCommand::BeginPipeline {
            pipeline: pass.pipelines()[0],
            framebuffer: pass.framebuffer(),
            clear_values: 1,
        })
    );
    assert_eq!(tonemap.commands.last(), Some(&RecordedCommand::EndPipeline));
}

#[test]
fn test_compute_storage_output_is_bound_not_attached() {
    let (mut graph, probe) = dummy_graph::<()>();
    graph.add_pass("fill", PassKind::Compute, |builder| {
        let target = builder.create_texture("filled", hdr_desc(64, 64));
        builder.write_storage_image(target, Subresource::default());
        builder.begin_pipeline();
        builder.add_shader(ShaderDesc::wgsl(ShaderStage::Compute, FILL_SHADER, "main"));
        builder.end_pipeline();
        |registry: &Registry<'_, ()>, recorder: &mut dyn CommandRecorder| {
            recorder.begin_pipeline(registry.pipeline(0), None, &[]);
            recorder.bind_descriptor_set(0, registry.input_descriptor_set());
            recorder.dispatch(8, 8, 1);
            recorder.end_pipeline();
        }
    });
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    let pass = graph.pass("fill").unwrap();
    assert!(pass.framebuffer().is_none());
    assert_eq!(probe.live_count(ObjectKind::Framebuffer), 0);

    let set = pass.input_descriptor_set().unwrap();
    let (layout, _) = probe.descriptor_set(set).unwrap();
    assert_eq!(layout.bindings.len(), 1);
    assert_eq!(layout.bindings[0].ty, DescriptorType::StorageImage);
    assert_eq!(layout.bindings[0].stages, ShaderStageFlags::COMPUTE);

    let pipeline = probe.compute_pipeline(pass.pipelines()[0]).unwrap();
    assert_eq!(pipeline.set_layouts.len(), 1);

    let submission = &probe.submissions()[0];
    assert_eq!(submission.kind, PassKind::Compute);
    assert!(submission
        .commands
        .contains(&RecordedCommand::Dispatch { x: 8, y: 8, z: 1 }));
}

#[test]
fn test_registry_exposes_declared_views_only() {
    let (mut graph, _probe) = dummy_graph::<()>();
    let declared = graph.create_texture("declared", color_desc(16, 16));
    let other = graph.create_texture("other", color_desc(16, 16));
    let lookups = Rc::new(Cell::new((false, false)));
    let lookups_in_pass = Rc::clone(&lookups);
    graph.add_pass("probe", PassKind::Graphics, move |builder| {
        builder.write_texture(declared, AttachmentRole::Color, Subresource::default());
        move |registry: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {
            lookups_in_pass.set((
                registry.image_view(declared, Subresource::default()).is_some(),
                registry.image_view(other, Subresource::default()).is_some(),
            ));
        }
    });
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    assert_eq!(lookups.get(), (true, false));
}

#[test]
fn test_registry_resolves_each_level_of_a_mip_chain() {
    let (mut graph, probe) = dummy_graph::<()>();
    let chain = graph.create_texture("chain", color_desc(32, 32).with_mip_levels(2));
    let seen = Rc::new(Cell::new((None, None)));
    let seen_in_pass = Rc::clone(&seen);
    graph.add_pass("downsample", PassKind::Graphics, move |builder| {
        builder.read_storage_image(chain, Subresource::level(0));
        builder.write_texture(chain, AttachmentRole::Color, Subresource::level(1));
        move |registry: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {
            seen_in_pass.set((
                registry.image_view(chain, Subresource::level(0)),
                registry.image_view(chain, Subresource::level(1)),
            ));
        }
    });
    graph.compile().unwrap();
    graph.execute(&(), None, None, None).unwrap();

    let (source, target) = seen.get();
    let (source, target) = (source.unwrap(), target.unwrap());
    assert_ne!(source, target);
    assert_eq!(probe.view_descriptor(source).unwrap().1.subresource.base_level, 0);
    assert_eq!(probe.view_descriptor(target).unwrap().1.subresource.base_level, 1);

    let pass = graph.pass("downsample").unwrap();
    let (_, writes) = probe.descriptor_set(pass.input_descriptor_set().unwrap()).unwrap();
    assert_eq!(writes[0].resource, DescriptorResource::StorageImage(source));
    let framebuffer = probe.framebuffer_descriptor(pass.framebuffer().unwrap()).unwrap();
    assert_eq!(framebuffer.color[0].view, target);
    assert_eq!((framebuffer.width, framebuffer.height), (16, 16));
}

#[test]
#[should_panic(expected = "has no framebuffer")]
fn test_compute_pass_framebuffer_lookup_panics() {
    let (mut graph, _probe) = dummy_graph::<()>();
    graph.add_pass("compute", PassKind::Compute, |builder| {
        let target = builder.create_texture("target", hdr_desc(8, 8));
        builder.write_storage_image(target, Subresource::default());
        |registry: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {
            registry.framebuffer();
        }
    });
    graph.compile().unwrap();
    let _ = graph.execute(&(), None, None, None);
}

/// A compute pass with two pipelines writing one storage image.
fn two_pipeline_compute_pass(graph: &mut RenderGraph<DummyBackend, ()>) {
    graph.add_pass("reduce", PassKind::Compute, |builder| {
        let target = builder.create_texture("reduced", hdr_desc(16, 16));
        builder.write_storage_image(target, Subresource::default());
        for label in ["reduce_rows", "reduce_columns"] {
            builder.begin_pipeline();
            builder.set_pipeline_label(label);
            builder.add_shader(ShaderDesc::wgsl(ShaderStage::Compute, FILL_SHADER, "main"));
            builder.end_pipeline();
        }
        |_: &Registry<'_, ()>, _: &mut dyn CommandRecorder| {}
    });
}

#[rstest]
#[case::first_pipeline(0)]
#[case::second_pipeline(1)]
fn test_failed_initialize_releases_partial_objects(#[case] successes: usize) {
    let (mut graph, probe) = dummy_graph::<()>();
    two_pipeline_compute_pass(&mut graph);
    probe.fail_after(ObjectKind::Pipeline, successes);

    let result = graph.compile();
    assert!(matches!(
        result,
        Err(GraphError::Backend(BackendError::PipelineCreationFailed(_)))
    ));
    let pass = graph.pass("reduce").unwrap();
    assert_eq!(pass.state(), PassState::Built);
    assert!(pass.input_descriptor_set().is_none());
    assert!(pass.pipelines().is_empty());
    assert_eq!(probe.live_count(ObjectKind::DescriptorSet), 0);
    assert_eq!(probe.live_count(ObjectKind::Pipeline), 0);

    graph.compile().unwrap();
    let pass = graph.pass("reduce").unwrap();
    assert_eq!(pass.state(), PassState::Initialized);
    let labels: Vec<_> = pass
        .pipelines()
        .iter()
        .map(|&p| probe.compute_pipeline(p).unwrap().label)
        .collect();
    assert_eq!(
        labels,
        vec![Some("reduce_rows".to_string()), Some("reduce_columns".to_string())]
    );
    assert_eq!(probe.live_count(ObjectKind::DescriptorSet), 1);
    assert_eq!(probe.live_count(ObjectKind::Pipeline), 2);

    drop(graph);
    for kind in [ObjectKind::DescriptorSet, ObjectKind::Pipeline, ObjectKind::Image] {
        assert_eq!(probe.live_count(kind), 0, "{:?} leaked", kind);
    }
}

#[test]
fn test_failed_framebuffer_leaves_pass_retryable() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "gbuffer", "albedo");
    probe.fail_next(ObjectKind::Framebuffer);

    assert!(graph.compile().is_err());
    assert!(matches!(
        graph.execute(&(), None, None, None),
        Err(GraphError::NotCompiled { .. })
    ));

    graph.compile().unwrap();
    assert_eq!(probe.live_count(ObjectKind::Framebuffer), 1);
    graph.execute(&(), None, None, None).unwrap();
    assert_eq!(probe.submitted_labels(), vec!["gbuffer"]);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_clear_all_passes_releases_pass_objects() {
    let (mut graph, probe) = dummy_graph::<()>();
    color_pass(&mut graph, "a", "a");
    color_pass(&mut graph, "b", "b");
    graph.compile().unwrap();
    assert_eq!(probe.live_count(ObjectKind::Framebuffer), 2);

    graph.clear_all_passes();

    assert_eq!(graph.pass_count(), 0);
    assert_eq!(probe.live_count(ObjectKind::Framebuffer), 0);
    // Textures belong to the graph, not the passes.
    assert_eq!(probe.live_count(ObjectKind::Image), 2);
}
