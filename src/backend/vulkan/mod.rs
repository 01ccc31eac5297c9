//! Headless Vulkan backend implementation using ash
//!
//! No surface or swapchain: images are created by the graph (or imported by the
//! caller) and live in `GENERAL` layout for their whole lifetime, so passes can
//! read and write them in any order the semaphore chain allows.

mod convert;
mod recorder;
mod shader;

pub use recorder::VulkanRecorder;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::GraphConfig;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::time::Duration;

use convert::vk_error;

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Configuration for creating a [`VulkanBackend`]
#[derive(Debug, Clone)]
pub struct VulkanConfig {
    pub app_name: String,
    /// Enable `VK_LAYER_KHRONOS_validation` when it is installed
    pub validation: bool,
    /// Capacity of the descriptor pool, in sets
    pub max_descriptor_sets: u32,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            app_name: "framegraph".to_string(),
            validation: cfg!(debug_assertions),
            max_descriptor_sets: 256,
        }
    }
}

impl VulkanConfig {
    pub fn from_graph_config(config: &GraphConfig) -> Self {
        Self {
            app_name: config.label.clone(),
            validation: config.validation,
            ..Default::default()
        }
    }
}

struct VkImage {
    image: vk::Image,
    /// None for images owned by someone else
    allocation: Option<Allocation>,
    format: TextureFormat,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkDescriptorSet {
    set: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
}

struct VkFramebuffer {
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    layers: u32,
    samples: vk::SampleCountFlags,
    /// Aspects of the clearable attachments: colors, then depth
    clear_aspects: Vec<vk::ImageAspectFlags>,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    bind_point: vk::PipelineBindPoint,
}

/// Native objects addressed by handle id
#[derive(Default)]
struct ObjectTable {
    images: HashMap<u64, VkImage>,
    views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    buffers: HashMap<u64, VkBuffer>,
    descriptor_sets: HashMap<u64, VkDescriptorSet>,
    framebuffers: HashMap<u64, VkFramebuffer>,
    pipelines: HashMap<u64, VkPipeline>,
    semaphores: HashMap<u64, vk::Semaphore>,
    fences: HashMap<u64, vk::Fence>,
}

/// State shared between the backend and its command recorders.
/// Dropped last: it owns the device and instance.
struct DeviceShared {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    objects: Mutex<ObjectTable>,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    shared: Arc<DeviceShared>,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    device_name: String,
    allocator: Option<Allocator>,
    descriptor_pool: vk::DescriptorPool,
    next_id: u64,
}

impl VulkanBackend {
    /// Create a headless backend on the first device with a graphics + compute queue,
    /// preferring discrete GPUs.
    pub fn new(config: &VulkanConfig) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let validation = config.validation && Self::validation_layer_available(&entry);
            if config.validation && !validation {
                log::warn!("Validation layers requested but not available");
            }

            let app_name = CString::new(config.app_name.as_str())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"framegraph")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);

            let layer_names = if validation {
                vec![VALIDATION_LAYER_NAME.as_ptr()]
            } else {
                Vec::new()
            };
            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(vk_error(BackendError::InitializationFailed))?;

            let (physical_device, queue_family) = Self::select_physical_device(&instance)?;
            let properties = instance.get_physical_device_properties(physical_device);
            let device_name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());

            let supported = instance.get_physical_device_features(physical_device);
            let features = vk::PhysicalDeviceFeatures {
                image_cube_array: supported.image_cube_array,
                independent_blend: supported.independent_blend,
                fill_mode_non_solid: supported.fill_mode_non_solid,
                ..Default::default()
            };

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities);
            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(std::slice::from_ref(&queue_info))
                .enabled_features(&features);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(vk_error(BackendError::InitializationFailed))?;
            let queue = device.get_device_queue(queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(vk_error(BackendError::InitializationFailed))?;

            let per_type = config.max_descriptor_sets * 8;
            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: per_type,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: per_type,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: per_type,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: per_type,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(config.max_descriptor_sets)
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(vk_error(BackendError::InitializationFailed))?;

            log::info!(
                "Vulkan backend initialized on '{}' (queue family {}, validation: {})",
                device_name,
                queue_family,
                validation
            );

            Ok(Self {
                shared: Arc::new(DeviceShared {
                    _entry: entry,
                    instance,
                    device,
                    queue,
                    command_pool,
                    objects: Mutex::new(ObjectTable::default()),
                }),
                physical_device,
                queue_family,
                device_name,
                allocator: Some(allocator),
                descriptor_pool,
                next_id: 1,
            })
        }
    }

    fn validation_layer_available(entry: &ash::Entry) -> bool {
        let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers,
            Err(_) => return false,
        };
        layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER_NAME))
    }

    fn select_physical_device(instance: &ash::Instance) -> BackendResult<(vk::PhysicalDevice, u32)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(vk_error(BackendError::InitializationFailed))?;

        let mut candidates: Vec<(vk::PhysicalDevice, u32, bool)> = physical_devices
            .into_iter()
            .filter_map(|pd| {
                let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
                let family = families.iter().position(|f| {
                    f.queue_flags
                        .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                })?;
                let discrete = unsafe { instance.get_physical_device_properties(pd) }.device_type
                    == vk::PhysicalDeviceType::DISCRETE_GPU;
                Some((pd, family as u32, discrete))
            })
            .collect();
        candidates.sort_by_key(|(_, _, discrete)| !discrete);

        candidates
            .first()
            .map(|(pd, family, _)| (*pd, *family))
            .ok_or_else(|| BackendError::InitializationFailed("No suitable physical device".into()))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    /// Register an image created outside the backend. It is never destroyed by us.
    pub fn import_image(&mut self, image: vk::Image, format: TextureFormat) -> ImageHandle {
        let id = self.next_id();
        self.shared.objects.lock().images.insert(
            id,
            VkImage {
                image,
                allocation: None,
                format,
            },
        );
        ImageHandle(id)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&mut self) -> BackendResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    /// Record and run a one-off command buffer, blocking until it finishes.
    fn run_single_time(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> BackendResult<()> {
        let device = &self.shared.device;
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.shared.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = device
                .allocate_command_buffers(&alloc_info)
                .map_err(vk_error(BackendError::RecordingFailed))?[0];

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let result = device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|_| {
                    record(device, cmd);
                    device.end_command_buffer(cmd)
                })
                .and_then(|_| {
                    let submit_info =
                        vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                    device.queue_submit(self.shared.queue, &[submit_info], vk::Fence::null())
                })
                .and_then(|_| device.queue_wait_idle(self.shared.queue));

            device.free_command_buffers(self.shared.command_pool, &[cmd]);
            result.map_err(vk_error(BackendError::SubmitFailed))
        }
    }

    fn create_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> BackendResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.ty))
                    .descriptor_count(1)
                    .stage_flags(convert::shader_stages(b.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.shared.device.create_descriptor_set_layout(&info, None) }
            .map_err(vk_error(BackendError::DescriptorSetCreationFailed))
    }

    /// Pipeline layout plus the set layouts it references
    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutDesc],
        push_constant_size: u32,
        push_stages: vk::ShaderStageFlags,
    ) -> BackendResult<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>)> {
        let layouts = set_layouts
            .iter()
            .map(|desc| self.create_set_layout(desc))
            .collect::<BackendResult<Vec<_>>>()?;

        let push_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange {
                stage_flags: push_stages,
                offset: 0,
                size: push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&push_ranges);
        match unsafe { self.shared.device.create_pipeline_layout(&info, None) } {
            Ok(layout) => Ok((layout, layouts)),
            Err(e) => {
                self.destroy_set_layouts(&layouts);
                Err(vk_error(BackendError::PipelineCreationFailed)(e))
            }
        }
    }

    fn destroy_set_layouts(&self, layouts: &[vk::DescriptorSetLayout]) {
        for &layout in layouts {
            unsafe { self.shared.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_shader_module(&self, shader: &ShaderDesc) -> BackendResult<vk::ShaderModule> {
        let words = shader::spirv_words(shader)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        unsafe { self.shared.device.create_shader_module(&info, None) }
            .map_err(vk_error(BackendError::ShaderCompilationFailed))
    }

    fn unknown(kind: &'static str, id: u64) -> BackendError {
        BackendError::UnknownHandle { kind, id }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let format = convert::texture_format(desc.format);
        let mut usage = convert::image_usage(desc.usage, desc.format);
        if usage.is_empty() {
            usage = vk::ImageUsageFlags::SAMPLED;
        }
        let flags = if desc.kind.is_cube() {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_type = if desc.kind == ImageKind::D3 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(convert::sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.shared.device.clone();
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(vk_error(BackendError::ImageCreationFailed))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("image"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))?;

        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .map_err(vk_error(BackendError::ImageCreationFailed))?;

        // Images stay in GENERAL for their whole life.
        let aspect = convert::aspect_mask(desc.format);
        self.run_single_time(|device, cmd| {
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                });
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        })?;

        let id = self.next_id();
        self.shared.objects.lock().images.insert(
            id,
            VkImage {
                image,
                allocation: Some(allocation),
                format: desc.format,
            },
        );
        log::debug!(
            "Vulkan: created image {:?} {}x{}x{} ({} layers, {} levels)",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.array_layers,
            desc.mip_levels
        );
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        desc: &ImageViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        let (vk_image, format) = {
            let objects = self.shared.objects.lock();
            let entry = objects
                .images
                .get(&image.0)
                .ok_or_else(|| Self::unknown("image", image.0))?;
            (entry.image, entry.format)
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(vk_image)
            .view_type(convert::view_type(desc.view_type))
            .format(convert::texture_format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: convert::aspect_mask(format),
                base_mip_level: desc.subresource.base_level,
                level_count: desc.subresource.level_count,
                base_array_layer: desc.subresource.base_layer,
                layer_count: desc.subresource.layer_count,
            });
        let view = unsafe { self.shared.device.create_image_view(&view_info, None) }
            .map_err(vk_error(BackendError::ImageViewCreationFailed))?;

        let id = self.next_id();
        self.shared.objects.lock().views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mipmap_filter))
            .address_mode_u(convert::address_mode(desc.address_mode_u))
            .address_mode_v(convert::address_mode(desc.address_mode_v))
            .address_mode_w(convert::address_mode(desc.address_mode_w))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(convert::compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { self.shared.device.create_sampler(&sampler_info, None) }
            .map_err(vk_error(BackendError::SamplerCreationFailed))?;

        let id = self.next_id();
        self.shared.objects.lock().samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let mut usage = convert::buffer_usage(desc.usage);
        if usage.is_empty() {
            usage = vk::BufferUsageFlags::TRANSFER_DST;
        }
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = self.shared.device.clone();
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(vk_error(BackendError::BufferCreationFailed))?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let location = if desc.usage.intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = self
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("buffer"),
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
            .map_err(vk_error(BackendError::BufferCreationFailed))?;

        let id = self.next_id();
        self.shared
            .objects
            .lock()
            .buffers
            .insert(id, VkBuffer { buffer, allocation });
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut objects = self.shared.objects.lock();
        let entry = objects
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Self::unknown("buffer", buffer.0))?;
        let mapped = entry.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::BufferCreationFailed("buffer is not host visible".into())
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} exceeds buffer size {}",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayoutDesc,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle> {
        enum Info {
            Image(vk::DescriptorImageInfo),
            Buffer(vk::DescriptorBufferInfo),
        }

        let infos = {
            let objects = self.shared.objects.lock();
            let view = |handle: ImageViewHandle| {
                objects
                    .views
                    .get(&handle.0)
                    .copied()
                    .ok_or_else(|| Self::unknown("image view", handle.0))
            };
            let buffer = |handle: BufferHandle| {
                objects
                    .buffers
                    .get(&handle.0)
                    .map(|b| b.buffer)
                    .ok_or_else(|| Self::unknown("buffer", handle.0))
            };

            writes
                .iter()
                .map(|write| {
                    let (ty, info) = match write.resource {
                        DescriptorResource::ImageSampler { view: v, sampler } => {
                            let sampler = objects
                                .samplers
                                .get(&sampler.0)
                                .copied()
                                .ok_or_else(|| Self::unknown("sampler", sampler.0))?;
                            (
                                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                                Info::Image(vk::DescriptorImageInfo {
                                    sampler,
                                    image_view: view(v)?,
                                    image_layout: vk::ImageLayout::GENERAL,
                                }),
                            )
                        }
                        DescriptorResource::StorageImage(v) => (
                            vk::DescriptorType::STORAGE_IMAGE,
                            Info::Image(vk::DescriptorImageInfo {
                                sampler: vk::Sampler::null(),
                                image_view: view(v)?,
                                image_layout: vk::ImageLayout::GENERAL,
                            }),
                        ),
                        DescriptorResource::UniformBuffer { buffer: b, offset, size } => (
                            vk::DescriptorType::UNIFORM_BUFFER,
                            Info::Buffer(vk::DescriptorBufferInfo {
                                buffer: buffer(b)?,
                                offset,
                                range: size,
                            }),
                        ),
                        DescriptorResource::StorageBuffer { buffer: b, offset, size } => (
                            vk::DescriptorType::STORAGE_BUFFER,
                            Info::Buffer(vk::DescriptorBufferInfo {
                                buffer: buffer(b)?,
                                offset,
                                range: size,
                            }),
                        ),
                    };
                    Ok((write.binding, ty, info))
                })
                .collect::<BackendResult<Vec<_>>>()?
        };

        let set_layout = self.create_set_layout(layout)?;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(std::slice::from_ref(&set_layout));
        let set = match unsafe { self.shared.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                self.destroy_set_layouts(&[set_layout]);
                return Err(vk_error(BackendError::DescriptorSetCreationFailed)(e));
            }
        };

        let vk_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    Info::Image(image) => write.image_info(std::slice::from_ref(image)),
                    Info::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)),
                }
            })
            .collect();
        unsafe { self.shared.device.update_descriptor_sets(&vk_writes, &[]) };

        let id = self.next_id();
        self.shared.objects.lock().descriptor_sets.insert(
            id,
            VkDescriptorSet {
                set,
                layout: set_layout,
            },
        );
        Ok(DescriptorSetHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        if !desc.resolve.is_empty() && desc.resolve.len() != desc.color.len() {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "{} resolve attachments for {} color attachments",
                desc.resolve.len(),
                desc.color.len()
            )));
        }

        let attachments = desc.attachments();
        let descriptions: Vec<vk::AttachmentDescription> = attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(convert::texture_format(a.format))
                    .samples(convert::sample_count(a.samples))
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::GENERAL)
                    .final_layout(vk::ImageLayout::GENERAL)
            })
            .collect();

        let reference = |attachment: usize| vk::AttachmentReference {
            attachment: attachment as u32,
            layout: vk::ImageLayout::GENERAL,
        };
        let color_count = desc.color.len();
        let depth_count = usize::from(desc.depth.is_some());
        let color_refs: Vec<_> = (0..color_count).map(reference).collect();
        let depth_ref = reference(color_count);
        let resolve_refs: Vec<_> = (0..desc.resolve.len())
            .map(|i| reference(color_count + depth_count + i))
            .collect();

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }

        let memory = vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE;
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
                .dst_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(memory),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
                .dst_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(memory),
        ];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptions)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        let render_pass = unsafe { self.shared.device.create_render_pass(&render_pass_info, None) }
            .map_err(vk_error(BackendError::FramebufferCreationFailed))?;

        let views = {
            let objects = self.shared.objects.lock();
            attachments
                .iter()
                .map(|a| {
                    objects
                        .views
                        .get(&a.view.0)
                        .copied()
                        .ok_or_else(|| Self::unknown("image view", a.view.0))
                })
                .collect::<BackendResult<Vec<_>>>()
        };
        let views = match views {
            Ok(views) => views,
            Err(e) => {
                unsafe { self.shared.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        let framebuffer = match unsafe { self.shared.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                unsafe { self.shared.device.destroy_render_pass(render_pass, None) };
                return Err(vk_error(BackendError::FramebufferCreationFailed)(e));
            }
        };

        let samples = attachments
            .first()
            .map(|a| convert::sample_count(a.samples))
            .unwrap_or(vk::SampleCountFlags::TYPE_1);
        let clear_aspects = desc
            .color
            .iter()
            .chain(desc.depth.iter())
            .map(|a| convert::aspect_mask(a.format))
            .collect();

        let id = self.next_id();
        self.shared.objects.lock().framebuffers.insert(
            id,
            VkFramebuffer {
                render_pass,
                framebuffer,
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                layers: desc.layers,
                samples,
                clear_aspects,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
        framebuffer: FramebufferHandle,
    ) -> BackendResult<PipelineHandle> {
        let (render_pass, samples) = {
            let objects = self.shared.objects.lock();
            let fb = objects
                .framebuffers
                .get(&framebuffer.0)
                .ok_or_else(|| Self::unknown("framebuffer", framebuffer.0))?;
            (fb.render_pass, fb.samples)
        };

        let mut modules = Vec::with_capacity(desc.shaders.len());
        for shader in &desc.shaders {
            match self.create_shader_module(shader) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        unsafe { self.shared.device.destroy_shader_module(module, None) };
                    }
                    return Err(e);
                }
            }
        }
        let entry_points: Vec<CString> = desc
            .shaders
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()).unwrap_or_default())
            .collect();
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .shaders
            .iter()
            .zip(modules.iter())
            .zip(entry_points.iter())
            .map(|((shader, module), entry)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert::shader_stage(shader.stage))
                    .module(*module)
                    .name(entry)
            })
            .collect();

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_views
            .iter()
            .map(|v| vk::VertexInputBindingDescription {
                binding: v.binding,
                stride: v.stride,
                input_rate: match v.step_mode {
                    VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                    VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                },
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: convert::vertex_format(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert::topology(desc.rasterization.topology));
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(convert::polygon_mode(desc.rasterization.polygon_mode))
            .cull_mode(convert::cull_mode(desc.rasterization.cull_mode))
            .front_face(convert::front_face(desc.rasterization.front_face))
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(samples);

        let depth_stencil = match desc.depth_stencil {
            Some(state) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(state.depth_write_enabled)
                .depth_compare_op(convert::compare_op(state.depth_compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(|target| {
                let state = vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(convert::color_writes(target.write_mask));
                match target.blend {
                    Some(blend) => state
                        .blend_enable(true)
                        .src_color_blend_factor(convert::blend_factor(blend.color.src_factor))
                        .dst_color_blend_factor(convert::blend_factor(blend.color.dst_factor))
                        .color_blend_op(convert::blend_op(blend.color.operation))
                        .src_alpha_blend_factor(convert::blend_factor(blend.alpha.src_factor))
                        .dst_alpha_blend_factor(convert::blend_factor(blend.alpha.dst_factor))
                        .alpha_blend_op(convert::blend_op(blend.alpha.operation)),
                    None => state,
                }
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&blend_attachments)
            .blend_constants(desc.blend_constant);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_layout = self.create_pipeline_layout(
            &desc.set_layouts,
            desc.push_constant_size,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let (layout, set_layouts) = match pipeline_layout {
            Ok(result) => result,
            Err(e) => {
                for module in modules {
                    unsafe { self.shared.device.destroy_shader_module(module, None) };
                }
                return Err(e);
            }
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let result = unsafe {
            self.shared
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        for module in modules {
            unsafe { self.shared.device.destroy_shader_module(module, None) };
        }
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.shared.device.destroy_pipeline_layout(layout, None) };
                self.destroy_set_layouts(&set_layouts);
                return Err(vk_error(BackendError::PipelineCreationFailed)(e));
            }
        };

        let id = self.next_id();
        self.shared.objects.lock().pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                layout,
                set_layouts,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            },
        );
        log::debug!("Vulkan: created graphics pipeline {:?}", desc.label);
        Ok(PipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let module = self.create_shader_module(&desc.shader)?;
        let entry = CString::new(desc.shader.entry_point.as_str()).unwrap_or_default();

        let pipeline_layout = self.create_pipeline_layout(
            &desc.set_layouts,
            desc.push_constant_size,
            vk::ShaderStageFlags::COMPUTE,
        );
        let (layout, set_layouts) = match pipeline_layout {
            Ok(result) => result,
            Err(e) => {
                unsafe { self.shared.device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let result = unsafe {
            self.shared
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.shared.device.destroy_shader_module(module, None) };
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.shared.device.destroy_pipeline_layout(layout, None) };
                self.destroy_set_layouts(&set_layouts);
                return Err(vk_error(BackendError::PipelineCreationFailed)(e));
            }
        };

        let id = self.next_id();
        self.shared.objects.lock().pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                layout,
                set_layouts,
                bind_point: vk::PipelineBindPoint::COMPUTE,
            },
        );
        log::debug!("Vulkan: created compute pipeline {:?}", desc.label);
        Ok(PipelineHandle(id))
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.shared.device.create_semaphore(&info, None) }
            .map_err(vk_error(BackendError::SyncCreationFailed))?;
        let id = self.next_id();
        self.shared.objects.lock().semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.shared.device.create_fence(&info, None) }
            .map_err(vk_error(BackendError::SyncCreationFailed))?;
        let id = self.next_id();
        self.shared.objects.lock().fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> BackendResult<()> {
        let vk_fence = self
            .shared
            .objects
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| Self::unknown("fence", fence.0))?;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.shared.device.wait_for_fences(&[vk_fence], true, nanos) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(BackendError::Timeout),
            Err(e) => Err(vk_error(BackendError::SubmitFailed)(e)),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let vk_fence = self
            .shared
            .objects
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| Self::unknown("fence", fence.0))?;
        unsafe { self.shared.device.reset_fences(&[vk_fence]) }
            .map_err(vk_error(BackendError::SyncCreationFailed))
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.shared.device.device_wait_idle() }.map_err(vk_error(BackendError::SubmitFailed))
    }

    fn create_command_recorder(&mut self, kind: PassKind) -> BackendResult<Box<dyn CommandRecorder>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.shared.device.allocate_command_buffers(&alloc_info) }
            .map_err(vk_error(BackendError::RecordingFailed))?[0];
        Ok(Box::new(VulkanRecorder::new(
            Arc::clone(&self.shared),
            command_buffer,
            kind,
        )))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        let removed = self.shared.objects.lock().images.remove(&image.0);
        if let Some(entry) = removed {
            if let Some(allocation) = entry.allocation {
                unsafe { self.shared.device.destroy_image(entry.image, None) };
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.free(allocation);
                }
            }
        }
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        if let Some(view) = self.shared.objects.lock().views.remove(&view.0) {
            unsafe { self.shared.device.destroy_image_view(view, None) };
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.shared.objects.lock().samplers.remove(&sampler.0) {
            unsafe { self.shared.device.destroy_sampler(sampler, None) };
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        let removed = self.shared.objects.lock().buffers.remove(&buffer.0);
        if let Some(entry) = removed {
            unsafe { self.shared.device.destroy_buffer(entry.buffer, None) };
            if let Some(allocator) = self.allocator.as_mut() {
                let _ = allocator.free(entry.allocation);
            }
        }
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if let Some(entry) = self.shared.objects.lock().descriptor_sets.remove(&set.0) {
            unsafe {
                let _ = self
                    .shared
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[entry.set]);
                self.shared
                    .device
                    .destroy_descriptor_set_layout(entry.layout, None);
            }
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(entry) = self.shared.objects.lock().framebuffers.remove(&framebuffer.0) {
            unsafe {
                self.shared.device.destroy_framebuffer(entry.framebuffer, None);
                self.shared.device.destroy_render_pass(entry.render_pass, None);
            }
        }
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        let removed = self.shared.objects.lock().pipelines.remove(&pipeline.0);
        if let Some(entry) = removed {
            unsafe {
                self.shared.device.destroy_pipeline(entry.pipeline, None);
                self.shared.device.destroy_pipeline_layout(entry.layout, None);
            }
            self.destroy_set_layouts(&entry.set_layouts);
        }
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.shared.objects.lock().semaphores.remove(&semaphore.0) {
            unsafe { self.shared.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.shared.objects.lock().fences.remove(&fence.0) {
            unsafe { self.shared.device.destroy_fence(fence, None) };
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = &self.shared.device;
        let mut objects = self.shared.objects.lock();
        unsafe {
            let _ = device.device_wait_idle();

            for (_, pipeline) in objects.pipelines.drain() {
                device.destroy_pipeline(pipeline.pipeline, None);
                device.destroy_pipeline_layout(pipeline.layout, None);
                for layout in pipeline.set_layouts {
                    device.destroy_descriptor_set_layout(layout, None);
                }
            }
            for (_, framebuffer) in objects.framebuffers.drain() {
                device.destroy_framebuffer(framebuffer.framebuffer, None);
                device.destroy_render_pass(framebuffer.render_pass, None);
            }
            for (_, set) in objects.descriptor_sets.drain() {
                device.destroy_descriptor_set_layout(set.layout, None);
            }
            device.destroy_descriptor_pool(self.descriptor_pool, None);

            for (_, view) in objects.views.drain() {
                device.destroy_image_view(view, None);
            }
            for (_, sampler) in objects.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            for (_, semaphore) in objects.semaphores.drain() {
                device.destroy_semaphore(semaphore, None);
            }
            for (_, fence) in objects.fences.drain() {
                device.destroy_fence(fence, None);
            }

            if let Some(allocator) = self.allocator.as_mut() {
                for (_, image) in objects.images.drain() {
                    if let Some(allocation) = image.allocation {
                        device.destroy_image(image.image, None);
                        let _ = allocator.free(allocation);
                    }
                }
                for (_, buffer) in objects.buffers.drain() {
                    device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
            }
        }
        drop(objects);

        // The allocator must go before the device, which `shared` destroys once
        // the last recorder is gone.
        drop(self.allocator.take());
    }
}
