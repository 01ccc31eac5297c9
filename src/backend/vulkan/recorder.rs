//! Command buffer recording for the Vulkan backend

use super::{convert, DeviceShared};
use crate::backend::traits::*;
use crate::backend::types::*;
use ash::vk;
use std::sync::Arc;

use convert::vk_error;

#[derive(Clone, Copy)]
struct BoundPipeline {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

/// Owns one primary command buffer, re-recorded every time the pass runs.
pub struct VulkanRecorder {
    shared: Arc<DeviceShared>,
    command_buffer: vk::CommandBuffer,
    kind: PassKind,
    label: String,
    recording: bool,
    in_render_pass: bool,
    bound: Option<BoundPipeline>,
}

impl VulkanRecorder {
    pub(super) fn new(shared: Arc<DeviceShared>, command_buffer: vk::CommandBuffer, kind: PassKind) -> Self {
        Self {
            shared,
            command_buffer,
            kind,
            label: String::new(),
            recording: false,
            in_render_pass: false,
            bound: None,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn bound(&self, command: &str) -> BoundPipeline {
        match self.bound {
            Some(bound) => bound,
            None => panic!("{} called outside begin/end pipeline in pass '{}'", command, self.label),
        }
    }

    fn device(&self) -> &ash::Device {
        &self.shared.device
    }
}

impl CommandRecorder for VulkanRecorder {
    fn set_debug_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    fn begin(&mut self) -> BackendResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device()
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_error(BackendError::RecordingFailed))?;
            self.device()
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(vk_error(BackendError::RecordingFailed))?;
        }
        self.recording = true;
        self.in_render_pass = false;
        self.bound = None;
        Ok(())
    }

    fn end(&mut self) -> BackendResult<()> {
        if self.bound.is_some() {
            return Err(BackendError::RecordingFailed(format!(
                "pass '{}' ended recording with a pipeline still open",
                self.label
            )));
        }
        unsafe { self.device().end_command_buffer(self.command_buffer) }
            .map_err(vk_error(BackendError::RecordingFailed))?;
        self.recording = false;
        Ok(())
    }

    fn begin_pipeline(
        &mut self,
        pipeline: PipelineHandle,
        framebuffer: Option<FramebufferHandle>,
        clear_values: &[ClearValue],
    ) {
        let objects = self.shared.objects.lock();
        let entry = match objects.pipelines.get(&pipeline.0) {
            Some(entry) => entry,
            None => panic!("Unknown pipeline {} in pass '{}'", pipeline.0, self.label),
        };
        let device = &self.shared.device;
        let cmd = self.command_buffer;

        if entry.bind_point == vk::PipelineBindPoint::GRAPHICS {
            let fb = match framebuffer.and_then(|f| objects.framebuffers.get(&f.0)) {
                Some(fb) => fb,
                None => panic!("Graphics pipeline in pass '{}' needs a framebuffer", self.label),
            };
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: fb.extent,
            };
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(fb.render_pass)
                .framebuffer(fb.framebuffer)
                .render_area(render_area);

            unsafe {
                device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, entry.bind_point, entry.pipeline);
            }

            // Attachments use LOAD, so clears are explicit.
            if !clear_values.is_empty() {
                let clears: Vec<vk::ClearAttachment> = clear_values
                    .iter()
                    .zip(fb.clear_aspects.iter())
                    .enumerate()
                    .map(|(index, (value, aspect))| vk::ClearAttachment {
                        aspect_mask: *aspect,
                        color_attachment: index as u32,
                        clear_value: convert::clear_value(value),
                    })
                    .collect();
                let rect = vk::ClearRect {
                    rect: render_area,
                    base_array_layer: 0,
                    layer_count: fb.layers,
                };
                unsafe { device.cmd_clear_attachments(cmd, &clears, &[rect]) };
            }
            self.in_render_pass = true;
        } else {
            unsafe { device.cmd_bind_pipeline(cmd, entry.bind_point, entry.pipeline) };
        }

        self.bound = Some(BoundPipeline {
            layout: entry.layout,
            bind_point: entry.bind_point,
        });
    }

    fn end_pipeline(&mut self) {
        self.bound("end_pipeline");
        let cmd = self.command_buffer;
        unsafe {
            if self.in_render_pass {
                self.device().cmd_end_render_pass(cmd);
            }
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
            self.device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        self.in_render_pass = false;
        self.bound = None;
    }

    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle) {
        let bound = self.bound("bind_descriptor_set");
        let vk_set = match self.shared.objects.lock().descriptor_sets.get(&set.0) {
            Some(entry) => entry.set,
            None => panic!("Unknown descriptor set {} in pass '{}'", set.0, self.label),
        };
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                self.command_buffer,
                bound.bind_point,
                bound.layout,
                index,
                &[vk_set],
                &[],
            );
        }
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        let viewports: Vec<vk::Viewport> = viewports
            .iter()
            .map(|v| vk::Viewport {
                x: v.x,
                y: v.y,
                width: v.width,
                height: v.height,
                min_depth: v.min_depth,
                max_depth: v.max_depth,
            })
            .collect();
        unsafe { self.device().cmd_set_viewport(self.command_buffer, 0, &viewports) };
    }

    fn set_scissors(&mut self, scissors: &[ScissorRect]) {
        let scissors: Vec<vk::Rect2D> = scissors
            .iter()
            .map(|s| vk::Rect2D {
                offset: vk::Offset2D { x: s.x, y: s.y },
                extent: vk::Extent2D {
                    width: s.width,
                    height: s.height,
                },
            })
            .collect();
        unsafe { self.device().cmd_set_scissor(self.command_buffer, 0, &scissors) };
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64) {
        let vk_buffer = match self.shared.objects.lock().buffers.get(&buffer.0) {
            Some(entry) => entry.buffer,
            None => panic!("Unknown buffer {} in pass '{}'", buffer.0, self.label),
        };
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(self.command_buffer, binding, &[vk_buffer], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        let vk_buffer = match self.shared.objects.lock().buffers.get(&buffer.0) {
            Some(entry) => entry.buffer,
            None => panic!("Unknown buffer {} in pass '{}'", buffer.0, self.label),
        };
        unsafe {
            self.device().cmd_bind_index_buffer(
                self.command_buffer,
                vk_buffer,
                offset,
                convert::index_type(format),
            );
        }
    }

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        let bound = self.bound("push_constants");
        unsafe {
            self.device().cmd_push_constants(
                self.command_buffer,
                bound.layout,
                convert::shader_stages(stages),
                offset,
                data,
            );
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        assert!(self.in_render_pass, "draw outside a graphics pipeline in pass '{}'", self.label);
        unsafe {
            self.device().cmd_draw(
                self.command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        assert!(self.in_render_pass, "draw_indexed outside a graphics pipeline in pass '{}'", self.label);
        unsafe {
            self.device().cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        assert_eq!(self.kind, PassKind::Compute, "dispatch in graphics pass '{}'", self.label);
        self.bound("dispatch");
        unsafe { self.device().cmd_dispatch(self.command_buffer, x, y, z) };
    }

    fn submit(
        &mut self,
        wait: &[SemaphoreHandle],
        signal: &[SemaphoreHandle],
        fence: Option<FenceHandle>,
    ) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::SubmitFailed(format!(
                "pass '{}' submitted while still recording",
                self.label
            )));
        }

        let (wait, signal, fence) = {
            let objects = self.shared.objects.lock();
            let semaphore = |handle: &SemaphoreHandle| {
                objects
                    .semaphores
                    .get(&handle.0)
                    .copied()
                    .ok_or(BackendError::UnknownHandle {
                        kind: "semaphore",
                        id: handle.0,
                    })
            };
            let wait = wait.iter().map(semaphore).collect::<BackendResult<Vec<_>>>()?;
            let signal = signal.iter().map(semaphore).collect::<BackendResult<Vec<_>>>()?;
            let fence = match fence {
                Some(handle) => objects
                    .fences
                    .get(&handle.0)
                    .copied()
                    .ok_or(BackendError::UnknownHandle {
                        kind: "fence",
                        id: handle.0,
                    })?,
                None => vk::Fence::null(),
            };
            (wait, signal, fence)
        };

        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait.len()];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(std::slice::from_ref(&self.command_buffer))
            .signal_semaphores(&signal);

        unsafe {
            self.device()
                .queue_submit(self.shared.queue, &[submit_info], fence)
                .map_err(vk_error(BackendError::SubmitFailed))
        }
    }
}

impl Drop for VulkanRecorder {
    fn drop(&mut self) {
        unsafe {
            self.shared
                .device
                .free_command_buffers(self.shared.command_pool, &[self.command_buffer]);
        }
    }
}
