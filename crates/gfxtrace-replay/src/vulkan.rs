//! Real-GPU [`ReplayDriver`] on top of `ash`.
//!
//! One instance, one physical device, one queue. Recorded calls arrive in
//! strict order, so command recording is simple: a render-pass scope owns
//! one primary command buffer, submitted and waited at scope end, and
//! transfer-style calls each run in a one-shot command buffer. Buffer
//! allocations are host-visible so updates and readbacks map directly.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use tracing::{debug, info, warn};

use gfxtrace_core::driver::{DriverError, ReadbackImage, ReplayDriver, ResolvedDescriptorWrite};
use gfxtrace_protocol::types::*;
use gfxtrace_protocol::{RawHandle, ResourceType};

fn vk_err(call: &'static str, e: vk::Result) -> DriverError {
    match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DriverError::OutOfMemory { call }
        }
        other => DriverError::CallFailed {
            call,
            detail: format!("{other:?}"),
        },
    }
}

struct BufferState {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

struct ImageState {
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: [u32; 3],
    /// Sampling parameters retained for state queries; this backend keeps
    /// them in samplers, not images.
    parameters: HashMap<u32, i32>,
}

struct FramebufferState {
    framebuffer: vk::Framebuffer,
    width: u32,
    height: u32,
}

struct OverlayTarget {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    framebuffer: vk::Framebuffer,
    width: u32,
    height: u32,
}

#[derive(Default, Clone)]
struct BoundState {
    pipeline: Option<RawHandle>,
    vertex_buffers: Vec<(u32, RawHandle, u64)>,
    index_buffer: Option<(RawHandle, u64, u32)>,
    pipeline_layout: Option<RawHandle>,
    descriptor_sets: Vec<(u32, RawHandle, Vec<u32>)>,
    viewport: Option<SerializedViewport>,
    scissor: Option<SerializedRect2D>,
}

/// Scope state for the command buffer owned by an open render pass.
struct PassScope {
    command_buffer: vk::CommandBuffer,
    extent: [u32; 2],
}

pub struct VulkanDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Render pass used for overlay targets; created lazily.
    overlay_pass: Option<vk::RenderPass>,

    next_handle: RawHandle,
    buffers: HashMap<RawHandle, BufferState>,
    images: HashMap<RawHandle, ImageState>,
    image_views: HashMap<RawHandle, vk::ImageView>,
    samplers: HashMap<RawHandle, vk::Sampler>,
    shader_modules: HashMap<RawHandle, vk::ShaderModule>,
    set_layouts: HashMap<RawHandle, vk::DescriptorSetLayout>,
    pipeline_layouts: HashMap<RawHandle, vk::PipelineLayout>,
    descriptor_sets: HashMap<RawHandle, vk::DescriptorSet>,
    pipelines: HashMap<RawHandle, vk::Pipeline>,
    render_passes: HashMap<RawHandle, vk::RenderPass>,
    framebuffers: HashMap<RawHandle, FramebufferState>,
    fences: HashMap<RawHandle, vk::Fence>,
    overlay_targets: HashMap<RawHandle, OverlayTarget>,

    bound: BoundState,
    pass: Option<PassScope>,
    active_overlay: Option<RawHandle>,
    label_depth: u32,
    checksum: u64,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fold(seed: u64, value: u64) -> u64 {
    let mut hash = if seed == 0 { FNV_OFFSET } else { seed };
    for b in value.to_le_bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl VulkanDriver {
    /// Create the instance, pick the first physical device with a
    /// graphics queue, and build the device-level plumbing.
    pub fn new() -> Result<Self, DriverError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| DriverError::CallFailed {
            call: "load_entry",
            detail: e.to_string(),
        })?;

        let app_name = CString::new("gfxtrace-replay").unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::make_api_version(0, 1, 3, 0));
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| vk_err("create_instance", e))?;

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| vk_err("enumerate_physical_devices", e))?;

        let mut selected = None;
        for pd in physical_devices {
            let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
            if let Some(index) = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            {
                selected = Some((pd, index as u32));
                break;
            }
        }
        let (physical_device, queue_family_index) =
            selected.ok_or(DriverError::Unsupported("no graphics-capable device"))?;

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        info!(
            device = ?unsafe { std::ffi::CStr::from_ptr(props.device_name.as_ptr()) },
            "replay device selected"
        );

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| vk_err("create_device", e))?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_err("create_command_pool", e))?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1024),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1024),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1024),
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1024)
            .pool_sizes(&pool_sizes);
        let descriptor_pool =
            unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
                .map_err(|e| vk_err("create_descriptor_pool", e))?;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            _entry: entry,
            instance,
            device,
            queue,
            command_pool,
            descriptor_pool,
            memory_properties,
            overlay_pass: None,
            next_handle: 0x1000,
            buffers: HashMap::new(),
            images: HashMap::new(),
            image_views: HashMap::new(),
            samplers: HashMap::new(),
            shader_modules: HashMap::new(),
            set_layouts: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            descriptor_sets: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            fences: HashMap::new(),
            overlay_targets: HashMap::new(),
            bound: BoundState::default(),
            pass: None,
            active_overlay: None,
            label_depth: 0,
            checksum: 0,
        })
    }

    fn alloc_handle(&mut self) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, DriverError> {
        for i in 0..self.memory_properties.memory_type_count {
            if type_bits & (1 << i) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
            {
                return Ok(i);
            }
        }
        Err(DriverError::Unsupported("no matching memory type"))
    }

    fn allocate_for_buffer(
        &self,
        buffer: vk::Buffer,
    ) -> Result<vk::DeviceMemory, DriverError> {
        let reqs = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let type_index = self.find_memory_type(
            reqs.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }
            .map_err(|e| vk_err("allocate_memory", e))?;
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
            .map_err(|e| vk_err("bind_buffer_memory", e))?;
        Ok(memory)
    }

    fn allocate_for_image(&self, image: vk::Image) -> Result<vk::DeviceMemory, DriverError> {
        let reqs = unsafe { self.device.get_image_memory_requirements(image) };
        let type_index = self.find_memory_type(
            reqs.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }
            .map_err(|e| vk_err("allocate_memory", e))?;
        unsafe { self.device.bind_image_memory(image, memory, 0) }
            .map_err(|e| vk_err("bind_image_memory", e))?;
        Ok(memory)
    }

    /// Write `data` into a host-visible allocation at `offset`.
    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let ptr = unsafe {
            self.device.map_memory(
                memory,
                offset,
                data.len() as u64,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(|e| vk_err("map_memory", e))?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        size: u64,
    ) -> Result<Vec<u8>, DriverError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| vk_err("map_memory", e))?;
        let data =
            unsafe { std::slice::from_raw_parts(ptr as *const u8, size as usize).to_vec() };
        unsafe { self.device.unmap_memory(memory) };
        Ok(data)
    }

    /// Record and synchronously submit a one-shot command buffer.
    fn one_shot<F>(&self, record: F) -> Result<(), DriverError>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_err("allocate_command_buffers", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| vk_err("begin_command_buffer", e))?;
        record(&self.device, cmd);
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| vk_err("end_command_buffer", e))?;

        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe { self.device.queue_submit(self.queue, &[submit], vk::Fence::null()) }
            .map_err(|e| vk_err("queue_submit", e))?;
        unsafe { self.device.queue_wait_idle(self.queue) }
            .map_err(|e| vk_err("queue_wait_idle", e))?;
        unsafe { self.device.free_command_buffers(self.command_pool, &cmds) };
        Ok(())
    }

    fn buffer(&self, handle: RawHandle, call: &'static str) -> Result<&BufferState, DriverError> {
        self.buffers
            .get(&handle)
            .ok_or(DriverError::InvalidHandle { call, handle })
    }

    fn image(&self, handle: RawHandle, call: &'static str) -> Result<&ImageState, DriverError> {
        self.images
            .get(&handle)
            .ok_or(DriverError::InvalidHandle { call, handle })
    }

    fn transition_layout(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(from)
            .new_layout(to)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Flush CPU-side bound state into the active command buffer.
    /// Called lazily before each action so binds may arrive in any order.
    fn apply_bound_state(&self, cmd: vk::CommandBuffer, extent: [u32; 2]) {
        if let Some(handle) = self.bound.pipeline {
            if let Some(pipeline) = self.pipelines.get(&handle) {
                unsafe {
                    self.device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        *pipeline,
                    );
                }
            }
        }
        for (binding, handle, offset) in &self.bound.vertex_buffers {
            if let Some(state) = self.buffers.get(handle) {
                unsafe {
                    self.device
                        .cmd_bind_vertex_buffers(cmd, *binding, &[state.buffer], &[*offset]);
                }
            }
        }
        if let Some((handle, offset, index_type)) = &self.bound.index_buffer {
            if let Some(state) = self.buffers.get(handle) {
                unsafe {
                    self.device.cmd_bind_index_buffer(
                        cmd,
                        state.buffer,
                        *offset,
                        vk::IndexType::from_raw(*index_type as i32),
                    );
                }
            }
        }

        let viewport = self.bound.viewport.map_or(
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent[0] as f32,
                height: extent[1] as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            |v| vk::Viewport {
                x: v.x,
                y: v.y,
                width: v.width,
                height: v.height,
                min_depth: v.min_depth,
                max_depth: v.max_depth,
            },
        );
        let scissor = self.bound.scissor.map_or(
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent[0],
                    height: extent[1],
                },
            },
            |s| vk::Rect2D {
                offset: vk::Offset2D {
                    x: s.offset[0],
                    y: s.offset[1],
                },
                extent: vk::Extent2D {
                    width: s.extent[0],
                    height: s.extent[1],
                },
            },
        );
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        if let Some(layout) = self
            .bound
            .pipeline_layout
            .and_then(|h| self.pipeline_layouts.get(&h))
        {
            for (first_set, set_handle, dynamic_offsets) in &self.bound.descriptor_sets {
                if let Some(set) = self.descriptor_sets.get(set_handle) {
                    unsafe {
                        self.device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            *layout,
                            *first_set,
                            &[*set],
                            dynamic_offsets,
                        );
                    }
                }
            }
        }
    }

    /// Command buffer and extent for the next action. Draws outside a
    /// render pass are a capture defect and rejected.
    fn action_scope(&self, call: &'static str) -> Result<(vk::CommandBuffer, [u32; 2]), DriverError> {
        match &self.pass {
            Some(scope) => Ok((scope.command_buffer, scope.extent)),
            None => Err(DriverError::CallFailed {
                call,
                detail: "action outside a render pass scope".to_string(),
            }),
        }
    }

    fn ensure_overlay_pass(&mut self) -> Result<vk::RenderPass, DriverError> {
        if let Some(pass) = self.overlay_pass {
            return Ok(pass);
        }
        let attachment = vk::AttachmentDescription::default()
            .format(vk::Format::R8G8B8A8_UNORM)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let color_ref = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpass = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)];
        let attachments = [attachment];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpass);
        let pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| vk_err("create_render_pass", e))?;
        self.overlay_pass = Some(pass);
        Ok(pass)
    }

    /// Execute one action redirected into the overlay target's own pass.
    fn overlay_draw<F>(&mut self, call: &'static str, record: F) -> Result<(), DriverError>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let target_handle = self.active_overlay.ok_or(DriverError::CallFailed {
            call,
            detail: "no overlay target active".to_string(),
        })?;
        let pass = self.ensure_overlay_pass()?;
        let target = self
            .overlay_targets
            .get(&target_handle)
            .ok_or(DriverError::InvalidHandle {
                call,
                handle: target_handle,
            })?;
        let (framebuffer, width, height) = (target.framebuffer, target.width, target.height);

        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        }];
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .clear_values(&clear);
        self.one_shot(|device, cmd| {
            unsafe {
                device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            }
            self.apply_bound_state(cmd, [width, height]);
            record(device, cmd);
            unsafe { device.cmd_end_render_pass(cmd) };
        })
    }

    fn fold_action(&mut self, call: &'static str, a: u64, b: u64) {
        let mut digest = self.checksum;
        for byte in call.bytes() {
            digest = fold(digest, u64::from(byte));
        }
        digest = fold(digest, a);
        digest = fold(digest, b);
        digest = fold(digest, self.bound.pipeline.unwrap_or(0));
        self.checksum = digest;
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, target) in self.overlay_targets.drain() {
                self.device.destroy_framebuffer(target.framebuffer, None);
                self.device.destroy_image_view(target.view, None);
                self.device.destroy_image(target.image, None);
                self.device.free_memory(target.memory, None);
            }
            if let Some(pass) = self.overlay_pass.take() {
                self.device.destroy_render_pass(pass, None);
            }
            for (_, state) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(state.framebuffer, None);
            }
            for (_, pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(pass, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in self.pipeline_layouts.drain() {
                self.device.destroy_pipeline_layout(layout, None);
            }
            for (_, layout) in self.set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, module) in self.shader_modules.drain() {
                self.device.destroy_shader_module(module, None);
            }
            for (_, view) in self.image_views.drain() {
                self.device.destroy_image_view(view, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, state) in self.images.drain() {
                self.device.destroy_image(state.image, None);
                self.device.free_memory(state.memory, None);
            }
            for (_, state) in self.buffers.drain() {
                self.device.destroy_buffer(state.buffer, None);
                self.device.free_memory(state.memory, None);
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl ReplayDriver for VulkanDriver {
    fn create_buffer(
        &mut self,
        info: &SerializedBufferCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size.max(1))
            .usage(
                vk::BufferUsageFlags::from_raw(info.usage)
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| vk_err("create_buffer", e))?;
        let memory = self.allocate_for_buffer(buffer)?;
        let handle = self.alloc_handle();
        self.buffers.insert(
            handle,
            BufferState {
                buffer,
                memory,
                size: info.size,
            },
        );
        debug!(handle, size = info.size, "created buffer");
        Ok(handle)
    }

    fn create_image(
        &mut self,
        info: &SerializedImageCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::from_raw(info.format))
            .extent(vk::Extent3D {
                width: info.extent[0].max(1),
                height: info.extent[1].max(1),
                depth: info.extent[2].max(1),
            })
            .mip_levels(info.mip_levels.max(1))
            .array_layers(info.array_layers.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::from_raw(info.usage)
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| vk_err("create_image", e))?;
        let memory = self.allocate_for_image(image)?;
        let handle = self.alloc_handle();
        self.images.insert(
            handle,
            ImageState {
                image,
                memory,
                extent: info.extent,
                parameters: HashMap::new(),
            },
        );
        debug!(handle, extent = ?info.extent, "created image");
        Ok(handle)
    }

    fn create_image_view(
        &mut self,
        image: RawHandle,
        info: &SerializedImageViewCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        let state = self.image(image, "create_image_view")?;
        let create_info = vk::ImageViewCreateInfo::default()
            .image(state.image)
            .view_type(vk::ImageViewType::from_raw(info.view_type))
            .format(vk::Format::from_raw(info.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::from_raw(
                        info.subresource_range.aspect_mask,
                    ))
                    .base_mip_level(info.subresource_range.base_mip_level)
                    .level_count(info.subresource_range.level_count)
                    .base_array_layer(info.subresource_range.base_array_layer)
                    .layer_count(info.subresource_range.layer_count),
            );
        let view = unsafe { self.device.create_image_view(&create_info, None) }
            .map_err(|e| vk_err("create_image_view", e))?;
        let handle = self.alloc_handle();
        self.image_views.insert(handle, view);
        Ok(handle)
    }

    fn create_sampler(
        &mut self,
        info: &SerializedSamplerCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::from_raw(info.mag_filter))
            .min_filter(vk::Filter::from_raw(info.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::from_raw(info.mipmap_mode))
            .address_mode_u(vk::SamplerAddressMode::from_raw(info.address_mode_u))
            .address_mode_v(vk::SamplerAddressMode::from_raw(info.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::from_raw(info.address_mode_w))
            .anisotropy_enable(info.anisotropy_enable)
            .max_anisotropy(info.max_anisotropy);
        let sampler = unsafe { self.device.create_sampler(&create_info, None) }
            .map_err(|e| vk_err("create_sampler", e))?;
        let handle = self.alloc_handle();
        self.samplers.insert(handle, sampler);
        Ok(handle)
    }

    fn create_shader_module(&mut self, code: &[u8]) -> Result<RawHandle, DriverError> {
        if code.len() % 4 != 0 {
            return Err(DriverError::CallFailed {
                call: "create_shader_module",
                detail: "SPIR-V byte length is not word aligned".to_string(),
            });
        }
        let words: Vec<u32> = code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| vk_err("create_shader_module", e))?;
        let handle = self.alloc_handle();
        self.shader_modules.insert(handle, module);
        Ok(handle)
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[RawHandle],
        push_constant_ranges: &[SerializedPushConstantRange],
    ) -> Result<RawHandle, DriverError> {
        let vk_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|h| {
                self.set_layouts
                    .get(h)
                    .copied()
                    .ok_or(DriverError::InvalidHandle {
                        call: "create_pipeline_layout",
                        handle: *h,
                    })
            })
            .collect::<Result<_, _>>()?;
        let vk_ranges: Vec<vk::PushConstantRange> = push_constant_ranges
            .iter()
            .map(|r| {
                vk::PushConstantRange::default()
                    .stage_flags(vk::ShaderStageFlags::from_raw(r.stage_flags))
                    .offset(r.offset)
                    .size(r.size)
            })
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&vk_layouts)
            .push_constant_ranges(&vk_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| vk_err("create_pipeline_layout", e))?;
        let handle = self.alloc_handle();
        self.pipeline_layouts.insert(handle, layout);
        Ok(handle)
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[SerializedDescriptorSetLayoutBinding],
    ) -> Result<RawHandle, DriverError> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(vk::DescriptorType::from_raw(b.descriptor_type))
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(vk::ShaderStageFlags::from_raw(b.stage_flags))
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| vk_err("create_descriptor_set_layout", e))?;
        let handle = self.alloc_handle();
        self.set_layouts.insert(handle, layout);
        Ok(handle)
    }

    fn create_descriptor_set(&mut self, layout: RawHandle) -> Result<RawHandle, DriverError> {
        let vk_layout =
            self.set_layouts
                .get(&layout)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "create_descriptor_set",
                    handle: layout,
                })?;
        let layouts = [vk_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| vk_err("allocate_descriptor_sets", e))?[0];
        let handle = self.alloc_handle();
        self.descriptor_sets.insert(handle, set);
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        info: &SerializedGraphicsPipelineCreateInfo,
        stage_modules: &[RawHandle],
        layout: RawHandle,
        render_pass: RawHandle,
    ) -> Result<RawHandle, DriverError> {
        let vk_layout =
            self.pipeline_layouts
                .get(&layout)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "create_graphics_pipeline",
                    handle: layout,
                })?;
        let vk_pass =
            self.render_passes
                .get(&render_pass)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "create_graphics_pipeline",
                    handle: render_pass,
                })?;

        let entry_names: Vec<CString> = info
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()).unwrap_or_default())
            .collect();
        let mut stages = Vec::with_capacity(info.stages.len());
        for (i, stage) in info.stages.iter().enumerate() {
            let module_handle = stage_modules.get(i).copied().unwrap_or_default();
            let module = self
                .shader_modules
                .get(&module_handle)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "create_graphics_pipeline",
                    handle: module_handle,
                })?;
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::from_raw(stage.stage))
                    .module(module)
                    .name(entry_names[i].as_c_str()),
            );
        }

        let vertex_bindings: Vec<vk::VertexInputBindingDescription> = info
            .vertex_bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(vk::VertexInputRate::from_raw(b.input_rate))
            })
            .collect();
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = info
            .vertex_attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(vk::Format::from_raw(a.format))
                    .offset(a.offset)
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::from_raw(info.topology));

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::from_raw(info.rasterization.polygon_mode))
            .cull_mode(vk::CullModeFlags::from_raw(info.rasterization.cull_mode))
            .front_face(vk::FrontFace::from_raw(info.rasterization.front_face))
            .line_width(info.rasterization.line_width);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = info.depth_stencil.map(|ds| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(ds.depth_test_enable)
                .depth_write_enable(ds.depth_write_enable)
                .depth_compare_op(vk::CompareOp::from_raw(ds.depth_compare_op))
        });

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::from_raw(info.color_write_mask))];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&dynamic_states);

        let mut create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(vk_layout)
            .render_pass(vk_pass)
            .subpass(info.subpass);
        if let Some(ref ds) = depth_stencil {
            create_info = create_info.depth_stencil_state(ds);
        }

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        }
        .map_err(|(_, e)| vk_err("create_graphics_pipelines", e))?;
        let handle = self.alloc_handle();
        self.pipelines.insert(handle, pipelines[0]);
        debug!(handle, "created graphics pipeline");
        Ok(handle)
    }

    fn create_render_pass(
        &mut self,
        info: &SerializedRenderPassCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        for (i, att) in info.color_attachments.iter().enumerate() {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(vk::Format::from_raw(att.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::from_raw(att.load_op))
                    .store_op(vk::AttachmentStoreOp::from_raw(att.store_op))
                    .initial_layout(vk::ImageLayout::from_raw(att.initial_layout))
                    .final_layout(vk::ImageLayout::from_raw(att.final_layout)),
            );
            color_refs.push(
                vk::AttachmentReference::default()
                    .attachment(i as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            );
        }
        let depth_ref = info.depth_attachment.as_ref().map(|att| {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(vk::Format::from_raw(att.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::from_raw(att.load_op))
                    .store_op(vk::AttachmentStoreOp::from_raw(att.store_op))
                    .initial_layout(vk::ImageLayout::from_raw(att.initial_layout))
                    .final_layout(vk::ImageLayout::from_raw(att.final_layout)),
            );
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32 - 1)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let subpasses = [subpass];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);
        let pass = unsafe { self.device.create_render_pass(&create_info, None) }
            .map_err(|e| vk_err("create_render_pass", e))?;
        let handle = self.alloc_handle();
        self.render_passes.insert(handle, pass);
        Ok(handle)
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RawHandle,
        attachments: &[RawHandle],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<RawHandle, DriverError> {
        let vk_pass =
            self.render_passes
                .get(&render_pass)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "create_framebuffer",
                    handle: render_pass,
                })?;
        let views: Vec<vk::ImageView> = attachments
            .iter()
            .map(|h| {
                self.image_views
                    .get(h)
                    .copied()
                    .ok_or(DriverError::InvalidHandle {
                        call: "create_framebuffer",
                        handle: *h,
                    })
            })
            .collect::<Result<_, _>>()?;
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(vk_pass)
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(layers.max(1));
        let framebuffer = unsafe { self.device.create_framebuffer(&create_info, None) }
            .map_err(|e| vk_err("create_framebuffer", e))?;
        let handle = self.alloc_handle();
        self.framebuffers.insert(
            handle,
            FramebufferState {
                framebuffer,
                width,
                height,
            },
        );
        Ok(handle)
    }

    fn create_fence(&mut self, signaled: bool) -> Result<RawHandle, DriverError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&create_info, None) }
            .map_err(|e| vk_err("create_fence", e))?;
        let handle = self.alloc_handle();
        self.fences.insert(handle, fence);
        Ok(handle)
    }

    fn destroy_resource(
        &mut self,
        handle: RawHandle,
        resource_type: ResourceType,
    ) -> Result<(), DriverError> {
        let removed = match resource_type {
            ResourceType::Buffer => self.buffers.remove(&handle).map(|s| unsafe {
                self.device.destroy_buffer(s.buffer, None);
                self.device.free_memory(s.memory, None);
            }),
            ResourceType::Image => self.images.remove(&handle).map(|s| unsafe {
                self.device.destroy_image(s.image, None);
                self.device.free_memory(s.memory, None);
            }),
            ResourceType::ImageView => self
                .image_views
                .remove(&handle)
                .map(|v| unsafe { self.device.destroy_image_view(v, None) }),
            ResourceType::Sampler => self
                .samplers
                .remove(&handle)
                .map(|s| unsafe { self.device.destroy_sampler(s, None) }),
            ResourceType::ShaderModule => self
                .shader_modules
                .remove(&handle)
                .map(|m| unsafe { self.device.destroy_shader_module(m, None) }),
            ResourceType::DescriptorSetLayout => self
                .set_layouts
                .remove(&handle)
                .map(|l| unsafe { self.device.destroy_descriptor_set_layout(l, None) }),
            ResourceType::PipelineLayout => self
                .pipeline_layouts
                .remove(&handle)
                .map(|l| unsafe { self.device.destroy_pipeline_layout(l, None) }),
            ResourceType::DescriptorSet => self.descriptor_sets.remove(&handle).map(|s| {
                let _ = unsafe { self.device.free_descriptor_sets(self.descriptor_pool, &[s]) };
            }),
            ResourceType::Pipeline => self
                .pipelines
                .remove(&handle)
                .map(|p| unsafe { self.device.destroy_pipeline(p, None) }),
            ResourceType::RenderPass => self
                .render_passes
                .remove(&handle)
                .map(|p| unsafe { self.device.destroy_render_pass(p, None) }),
            ResourceType::Framebuffer => self
                .framebuffers
                .remove(&handle)
                .map(|s| unsafe { self.device.destroy_framebuffer(s.framebuffer, None) }),
            ResourceType::Fence => self
                .fences
                .remove(&handle)
                .map(|f| unsafe { self.device.destroy_fence(f, None) }),
            _ => None,
        };
        removed.ok_or(DriverError::InvalidHandle {
            call: "destroy_resource",
            handle,
        })
    }

    fn update_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let state = self.buffer(buffer, "update_buffer")?;
        if offset + data.len() as u64 > state.size {
            return Err(DriverError::CallFailed {
                call: "update_buffer",
                detail: format!(
                    "write of {} bytes at {offset} past buffer size {}",
                    data.len(),
                    state.size
                ),
            });
        }
        self.write_memory(state.memory, offset, data)
    }

    fn upload_texture(
        &mut self,
        image: RawHandle,
        mip_level: u32,
        array_layer: u32,
        offset: [i32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> Result<(), DriverError> {
        let vk_image = self.image(image, "upload_texture")?.image;

        // Stage through a host-visible buffer
        let staging_info = SerializedBufferCreateInfo {
            size: data.len() as u64,
            usage: vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
            sharing_mode: 0,
        };
        let staging = self.create_buffer(&staging_info)?;
        let staging_state = self.buffer(staging, "upload_texture")?;
        self.write_memory(staging_state.memory, 0, data)?;
        let staging_buffer = staging_state.buffer;

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(mip_level)
                    .base_array_layer(array_layer)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D {
                x: offset[0],
                y: offset[1],
                z: offset[2],
            })
            .image_extent(vk::Extent3D {
                width: extent[0],
                height: extent[1],
                depth: extent[2].max(1),
            });
        self.one_shot(|device, cmd| {
            Self::transition_layout(
                device,
                cmd,
                vk_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging_buffer,
                    vk_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Self::transition_layout(
                device,
                cmd,
                vk_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;
        self.destroy_resource(staging, ResourceType::Buffer)
    }

    fn set_texture_parameter(
        &mut self,
        image: RawHandle,
        parameter: u32,
        value: i32,
    ) -> Result<(), DriverError> {
        // Sampling parameters live in samplers on this backend; the value
        // is retained so state queries stay faithful to the capture.
        let state = self
            .images
            .get_mut(&image)
            .ok_or(DriverError::InvalidHandle {
                call: "set_texture_parameter",
                handle: image,
            })?;
        state.parameters.insert(parameter, value);
        Ok(())
    }

    fn update_descriptor_sets(
        &mut self,
        writes: &[ResolvedDescriptorWrite],
    ) -> Result<(), DriverError> {
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        for write in writes {
            let buffers = write
                .buffers
                .iter()
                .map(|(handle, offset, range)| {
                    Ok(vk::DescriptorBufferInfo::default()
                        .buffer(self.buffer(*handle, "update_descriptor_sets")?.buffer)
                        .offset(*offset)
                        .range(*range))
                })
                .collect::<Result<_, DriverError>>()?;
            buffer_infos.push(buffers);

            let images = write
                .images
                .iter()
                .map(|(sampler, view, layout)| {
                    let vk_sampler = self.samplers.get(sampler).copied().unwrap_or_default();
                    let vk_view = self
                        .image_views
                        .get(view)
                        .copied()
                        .ok_or(DriverError::InvalidHandle {
                            call: "update_descriptor_sets",
                            handle: *view,
                        })?;
                    Ok(vk::DescriptorImageInfo::default()
                        .sampler(vk_sampler)
                        .image_view(vk_view)
                        .image_layout(vk::ImageLayout::from_raw(*layout)))
                })
                .collect::<Result<_, DriverError>>()?;
            image_infos.push(images);
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (i, write) in writes.iter().enumerate() {
            let set = self
                .descriptor_sets
                .get(&write.dst_set)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "update_descriptor_sets",
                    handle: write.dst_set,
                })?;
            let mut vk_write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.dst_binding)
                .dst_array_element(write.dst_array_element)
                .descriptor_type(vk::DescriptorType::from_raw(write.descriptor_type));
            if !buffer_infos[i].is_empty() {
                vk_write = vk_write.buffer_info(&buffer_infos[i]);
            }
            if !image_infos[i].is_empty() {
                vk_write = vk_write.image_info(&image_infos[i]);
            }
            vk_writes.push(vk_write);
        }
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: RawHandle) -> Result<(), DriverError> {
        if !self.pipelines.contains_key(&pipeline) {
            return Err(DriverError::InvalidHandle {
                call: "bind_pipeline",
                handle: pipeline,
            });
        }
        self.bound.pipeline = Some(pipeline);
        Ok(())
    }

    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[RawHandle],
        offsets: &[u64],
    ) -> Result<(), DriverError> {
        for (i, handle) in buffers.iter().enumerate() {
            let binding = first_binding + i as u32;
            let offset = offsets.get(i).copied().unwrap_or(0);
            self.bound.vertex_buffers.retain(|(b, _, _)| *b != binding);
            self.bound.vertex_buffers.push((binding, *handle, offset));
        }
        self.bound.vertex_buffers.sort_by_key(|(b, _, _)| *b);
        Ok(())
    }

    fn bind_index_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        index_type: u32,
    ) -> Result<(), DriverError> {
        self.bound.index_buffer = Some((buffer, offset, index_type));
        Ok(())
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: RawHandle,
        first_set: u32,
        sets: &[RawHandle],
        dynamic_offsets: &[u32],
    ) -> Result<(), DriverError> {
        self.bound.pipeline_layout = Some(layout);
        for (i, handle) in sets.iter().enumerate() {
            let slot = first_set + i as u32;
            self.bound.descriptor_sets.retain(|(s, _, _)| *s != slot);
            self.bound
                .descriptor_sets
                .push((slot, *handle, dynamic_offsets.to_vec()));
        }
        self.bound.descriptor_sets.sort_by_key(|(s, _, _)| *s);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &SerializedViewport) -> Result<(), DriverError> {
        self.bound.viewport = Some(*viewport);
        Ok(())
    }

    fn set_scissor(&mut self, scissor: &SerializedRect2D) -> Result<(), DriverError> {
        self.bound.scissor = Some(*scissor);
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        render_pass: RawHandle,
        framebuffer: RawHandle,
        render_area: &SerializedRect2D,
        clear_values: &[SerializedClearValue],
    ) -> Result<(), DriverError> {
        if self.pass.is_some() {
            return Err(DriverError::CallFailed {
                call: "begin_render_pass",
                detail: "render pass scope already open".to_string(),
            });
        }
        let vk_pass =
            self.render_passes
                .get(&render_pass)
                .copied()
                .ok_or(DriverError::InvalidHandle {
                    call: "begin_render_pass",
                    handle: render_pass,
                })?;
        let fb = self
            .framebuffers
            .get(&framebuffer)
            .ok_or(DriverError::InvalidHandle {
                call: "begin_render_pass",
                handle: framebuffer,
            })?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_err("allocate_command_buffers", e))?[0];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| vk_err("begin_command_buffer", e))?;

        let clears: Vec<vk::ClearValue> = clear_values
            .iter()
            .map(|c| vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: c.as_color(),
                },
            })
            .collect();
        let pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(vk_pass)
            .framebuffer(fb.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D {
                    x: render_area.offset[0],
                    y: render_area.offset[1],
                },
                extent: vk::Extent2D {
                    width: render_area.extent[0],
                    height: render_area.extent[1],
                },
            })
            .clear_values(&clears);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &pass_begin, vk::SubpassContents::INLINE);
        }
        self.pass = Some(PassScope {
            command_buffer: cmd,
            extent: [fb.width, fb.height],
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<(), DriverError> {
        let scope = self.pass.take().ok_or(DriverError::CallFailed {
            call: "end_render_pass",
            detail: "no render pass scope open".to_string(),
        })?;
        let cmd = scope.command_buffer;
        unsafe { self.device.cmd_end_render_pass(cmd) };
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| vk_err("end_command_buffer", e))?;
        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe { self.device.queue_submit(self.queue, &[submit], vk::Fence::null()) }
            .map_err(|e| vk_err("queue_submit", e))?;
        unsafe { self.device.queue_wait_idle(self.queue) }
            .map_err(|e| vk_err("queue_wait_idle", e))?;
        unsafe { self.device.free_command_buffers(self.command_pool, &cmds) };
        Ok(())
    }

    fn begin_debug_label(&mut self, _label: &str) -> Result<(), DriverError> {
        // Debug-utils labels need an instance extension; nesting is still
        // tracked so scope state stays consistent.
        self.label_depth += 1;
        Ok(())
    }

    fn end_debug_label(&mut self) -> Result<(), DriverError> {
        self.label_depth = self.label_depth.saturating_sub(1);
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), DriverError> {
        self.fold_action("draw", u64::from(vertex_count), u64::from(instance_count));
        if self.active_overlay.is_some() {
            return self.overlay_draw("draw", |device, cmd| unsafe {
                device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
            });
        }
        let (cmd, extent) = self.action_scope("draw")?;
        self.apply_bound_state(cmd, extent);
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), DriverError> {
        self.fold_action(
            "draw_indexed",
            u64::from(index_count),
            u64::from(instance_count),
        );
        if self.active_overlay.is_some() {
            return self.overlay_draw("draw_indexed", |device, cmd| unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            });
        }
        let (cmd, extent) = self.action_scope("draw_indexed")?;
        self.apply_bound_state(cmd, extent);
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DriverError> {
        self.fold_action("dispatch", u64::from(x), u64::from(y * z));
        self.one_shot(|device, cmd| unsafe {
            device.cmd_dispatch(cmd, x, y, z);
        })
    }

    fn copy_buffer(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferCopy],
    ) -> Result<(), DriverError> {
        let src_buf = self.buffer(src, "copy_buffer")?.buffer;
        let dst_buf = self.buffer(dst, "copy_buffer")?.buffer;
        let vk_regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| {
                vk::BufferCopy::default()
                    .src_offset(r.src_offset)
                    .dst_offset(r.dst_offset)
                    .size(r.size)
            })
            .collect();
        self.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src_buf, dst_buf, &vk_regions);
        })
    }

    fn copy_buffer_to_image(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferImageCopy],
    ) -> Result<(), DriverError> {
        let src_buf = self.buffer(src, "copy_buffer_to_image")?.buffer;
        let dst_image = self.image(dst, "copy_buffer_to_image")?.image;
        let vk_regions: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|r| {
                vk::BufferImageCopy::default()
                    .buffer_offset(r.buffer_offset)
                    .buffer_row_length(r.buffer_row_length)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(r.mip_level)
                            .base_array_layer(r.array_layer)
                            .layer_count(1),
                    )
                    .image_offset(vk::Offset3D {
                        x: r.image_offset[0],
                        y: r.image_offset[1],
                        z: r.image_offset[2],
                    })
                    .image_extent(vk::Extent3D {
                        width: r.image_extent[0],
                        height: r.image_extent[1],
                        depth: r.image_extent[2].max(1),
                    })
            })
            .collect();
        self.one_shot(|device, cmd| {
            Self::transition_layout(
                device,
                cmd,
                dst_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    src_buf,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk_regions,
                );
            }
            Self::transition_layout(
                device,
                cmd,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })
    }

    fn clear_attachments(
        &mut self,
        clear_value: &SerializedClearValue,
        rect: &SerializedRect2D,
    ) -> Result<(), DriverError> {
        let (cmd, _) = self.action_scope("clear_attachments")?;
        let attachment = vk::ClearAttachment::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .color_attachment(0)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_value.as_color(),
                },
            });
        let clear_rect = vk::ClearRect::default()
            .rect(vk::Rect2D {
                offset: vk::Offset2D {
                    x: rect.offset[0],
                    y: rect.offset[1],
                },
                extent: vk::Extent2D {
                    width: rect.extent[0],
                    height: rect.extent[1],
                },
            })
            .layer_count(1);
        unsafe {
            self.device
                .cmd_clear_attachments(cmd, &[attachment], &[clear_rect]);
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), DriverError> {
        if self.pass.is_some() {
            warn!("wait_idle inside an open render pass scope");
        }
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_err("device_wait_idle", e))
    }

    fn read_back_buffer(&mut self, buffer: RawHandle) -> Result<Vec<u8>, DriverError> {
        let state = self.buffer(buffer, "read_back_buffer")?;
        self.read_memory(state.memory, state.size)
    }

    fn read_back_texture(&mut self, image: RawHandle) -> Result<Vec<u8>, DriverError> {
        let state = self.image(image, "read_back_texture")?;
        let (vk_image, extent) = (state.image, state.extent);
        let byte_size = u64::from(extent[0]) * u64::from(extent[1]) * u64::from(extent[2].max(1)) * 4;

        let staging_info = SerializedBufferCreateInfo {
            size: byte_size,
            usage: vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
            sharing_mode: 0,
        };
        let staging = self.create_buffer(&staging_info)?;
        let staging_state = self.buffer(staging, "read_back_texture")?;
        let staging_buffer = staging_state.buffer;

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: extent[0],
                height: extent[1],
                depth: extent[2].max(1),
            });
        self.one_shot(|device, cmd| {
            Self::transition_layout(
                device,
                cmd,
                vk_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    vk_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    staging_buffer,
                    &[region],
                );
            }
        })?;
        let memory = self.buffer(staging, "read_back_texture")?.memory;
        let data = self.read_memory(memory, byte_size)?;
        self.destroy_resource(staging, ResourceType::Buffer)?;
        Ok(data)
    }

    fn create_overlay_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RawHandle, DriverError> {
        // Targets are reused per extent; the overlay pass clears on load
        let existing = self
            .overlay_targets
            .iter()
            .find(|(_, t)| t.width == width && t.height == height)
            .map(|(h, _)| *h);
        if let Some(handle) = existing {
            debug!(handle, width, height, "reusing overlay target");
            return Ok(handle);
        }
        let pass = self.ensure_overlay_pass()?;
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| vk_err("create_image", e))?;
        let memory = self.allocate_for_image(image)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| vk_err("create_image_view", e))?;

        let views = [view];
        let fb_info = vk::FramebufferCreateInfo::default()
            .render_pass(pass)
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&fb_info, None) }
            .map_err(|e| vk_err("create_framebuffer", e))?;

        let handle = self.alloc_handle();
        self.overlay_targets.insert(
            handle,
            OverlayTarget {
                image,
                memory,
                view,
                framebuffer,
                width,
                height,
            },
        );
        debug!(handle, width, height, "created overlay target");
        Ok(handle)
    }

    fn read_overlay_target(
        &mut self,
        target: RawHandle,
    ) -> Result<ReadbackImage, DriverError> {
        let state = self
            .overlay_targets
            .get(&target)
            .ok_or(DriverError::InvalidHandle {
                call: "read_overlay_target",
                handle: target,
            })?;
        let (vk_image, width, height) = (state.image, state.width, state.height);
        let byte_size = u64::from(width) * u64::from(height) * 4;

        let staging_info = SerializedBufferCreateInfo {
            size: byte_size,
            usage: vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
            sharing_mode: 0,
        };
        let staging = self.create_buffer(&staging_info)?;
        let staging_buffer = self.buffer(staging, "read_overlay_target")?.buffer;

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });
        self.one_shot(|device, cmd| unsafe {
            device.cmd_copy_image_to_buffer(
                cmd,
                vk_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging_buffer,
                &[region],
            );
        })?;
        let memory = self.buffer(staging, "read_overlay_target")?.memory;
        let data = self.read_memory(memory, byte_size)?;
        self.destroy_resource(staging, ResourceType::Buffer)?;
        Ok(ReadbackImage {
            width,
            height,
            data,
        })
    }

    fn set_overlay_target(&mut self, target: Option<RawHandle>) -> Result<(), DriverError> {
        if let Some(handle) = target {
            if !self.overlay_targets.contains_key(&handle) {
                return Err(DriverError::InvalidHandle {
                    call: "set_overlay_target",
                    handle,
                });
            }
        }
        self.active_overlay = target;
        Ok(())
    }

    fn state_checksum(&mut self) -> u64 {
        let mut digest = self.checksum;
        digest = fold(digest, self.bound.pipeline.unwrap_or(0));
        for (binding, handle, offset) in &self.bound.vertex_buffers {
            digest = fold(digest, u64::from(*binding));
            digest = fold(digest, *handle);
            digest = fold(digest, *offset);
        }
        for (slot, handle, _) in &self.bound.descriptor_sets {
            digest = fold(digest, u64::from(*slot));
            digest = fold(digest, *handle);
        }
        digest = fold(digest, u64::from(self.label_depth));
        digest = fold(digest, self.buffers.len() as u64);
        digest = fold(digest, self.images.len() as u64);
        digest = fold(digest, self.pipelines.len() as u64);
        digest
    }
}
