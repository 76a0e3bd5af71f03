//! Deterministic state-tracking implementation of [`ReplayDriver`].
//!
//! No GPU behind it: resource contents, bound state, and a running digest
//! of render-target writes are tracked in memory. Identical call sequences
//! produce identical state checksums, which is what the replay machine's
//! determinism and order-preservation guarantees are verified against.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use gfxtrace_protocol::types::*;
use gfxtrace_protocol::{RawHandle, ResourceType};

use crate::driver::{DriverError, ReadbackImage, ReplayDriver, ResolvedDescriptorWrite};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = if seed == 0 { FNV_OFFSET } else { seed };
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn fnv1a_u64(seed: u64, value: u64) -> u64 {
    fnv1a(seed, &value.to_le_bytes())
}

#[derive(Debug, Clone)]
struct ImageState {
    info: SerializedImageCreateInfo,
    /// (mip, layer) -> tightly packed texel bytes
    subresources: BTreeMap<(u32, u32), Vec<u8>>,
    parameters: BTreeMap<u32, i32>,
}

#[derive(Debug, Clone)]
struct FramebufferState {
    width: u32,
    height: u32,
    attachments: Vec<RawHandle>,
    /// Running digest of everything rendered into this target.
    content_digest: u64,
}

#[derive(Debug, Clone, Default)]
struct BoundState {
    pipeline: Option<RawHandle>,
    vertex_buffers: BTreeMap<u32, (RawHandle, u64)>,
    index_buffer: Option<(RawHandle, u64, u32)>,
    descriptor_sets: BTreeMap<u32, RawHandle>,
    viewport: Option<SerializedViewport>,
    scissor: Option<SerializedRect2D>,
    render_pass: Option<RawHandle>,
    framebuffer: Option<RawHandle>,
}

/// One draw-class call issued to the driver, for test inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawRecord {
    pub call: &'static str,
    pub vertex_or_index_count: u32,
    pub instance_count: u32,
    pub pipeline: Option<RawHandle>,
    pub overlay_target: Option<RawHandle>,
}

pub struct SoftwareDriver {
    next_handle: RawHandle,
    buffers: HashMap<RawHandle, Vec<u8>>,
    images: HashMap<RawHandle, ImageState>,
    shader_modules: HashMap<RawHandle, Vec<u8>>,
    pipelines: HashMap<RawHandle, SerializedGraphicsPipelineCreateInfo>,
    render_passes: HashMap<RawHandle, SerializedRenderPassCreateInfo>,
    framebuffers: HashMap<RawHandle, FramebufferState>,
    /// Objects with no tracked payload: samplers, layouts, sets, fences.
    opaque_objects: HashMap<RawHandle, ResourceType>,
    descriptor_bindings: HashMap<RawHandle, Vec<ResolvedDescriptorWrite>>,
    bound: BoundState,
    overlay_targets: HashMap<RawHandle, ReadbackImage>,
    active_overlay: Option<RawHandle>,
    debug_label_depth: u32,
    draw_log: Vec<DrawRecord>,
    call_log: Vec<&'static str>,
    drain_count: u64,
}

impl SoftwareDriver {
    pub fn new() -> Self {
        Self {
            // Offset so software handles are visually distinct from IDs
            next_handle: 0x1000,
            buffers: HashMap::new(),
            images: HashMap::new(),
            shader_modules: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            opaque_objects: HashMap::new(),
            descriptor_bindings: HashMap::new(),
            bound: BoundState::default(),
            overlay_targets: HashMap::new(),
            active_overlay: None,
            debug_label_depth: 0,
            draw_log: Vec::new(),
            call_log: Vec::new(),
            drain_count: 0,
        }
    }

    fn alloc(&mut self) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn log(&mut self, call: &'static str) {
        trace!(call, "software driver");
        self.call_log.push(call);
    }

    fn image_mut(
        &mut self,
        image: RawHandle,
        call: &'static str,
    ) -> Result<&mut ImageState, DriverError> {
        self.images
            .get_mut(&image)
            .ok_or(DriverError::InvalidHandle { call, handle: image })
    }

    fn record_draw(&mut self, record: DrawRecord) {
        // Fold the draw into the current target's content digest
        let digest_input = {
            let mut d = fnv1a(0, record.call.as_bytes());
            d = fnv1a_u64(d, u64::from(record.vertex_or_index_count));
            d = fnv1a_u64(d, u64::from(record.instance_count));
            d = fnv1a_u64(d, record.pipeline.unwrap_or(0));
            for (slot, (buf, off)) in &self.bound.vertex_buffers {
                d = fnv1a_u64(d, u64::from(*slot));
                d = fnv1a_u64(d, *buf);
                d = fnv1a_u64(d, *off);
            }
            for (slot, set) in &self.bound.descriptor_sets {
                d = fnv1a_u64(d, u64::from(*slot));
                d = fnv1a_u64(d, *set);
            }
            d
        };

        if let Some(target) = self.active_overlay {
            if let Some(img) = self.overlay_targets.get_mut(&target) {
                // Deterministic fill derived from the draw digest
                let color = [
                    (digest_input >> 16) as u8,
                    (digest_input >> 8) as u8,
                    digest_input as u8,
                    0xFF,
                ];
                for texel in img.data.chunks_exact_mut(4) {
                    texel.copy_from_slice(&color);
                }
            }
        } else if let Some(fb) = self.bound.framebuffer {
            if let Some(state) = self.framebuffers.get_mut(&fb) {
                state.content_digest = fnv1a_u64(state.content_digest, digest_input);
            }
        }

        self.draw_log.push(record);
    }

    // ── Test/CLI inspection surface ─────────────────────────

    pub fn draw_log(&self) -> &[DrawRecord] {
        &self.draw_log
    }

    pub fn take_call_log(&mut self) -> Vec<&'static str> {
        std::mem::take(&mut self.call_log)
    }

    pub fn drain_count(&self) -> u64 {
        self.drain_count
    }

    pub fn overlay_target_count(&self) -> usize {
        self.overlay_targets.len()
    }

    pub fn active_overlay_target(&self) -> Option<RawHandle> {
        self.active_overlay
    }

    pub fn bound_pipeline(&self) -> Option<RawHandle> {
        self.bound.pipeline
    }

    pub fn bound_framebuffer(&self) -> Option<RawHandle> {
        self.bound.framebuffer
    }

    pub fn buffer_contents(&self, buffer: RawHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|v| v.as_slice())
    }

    pub fn texture_contents(&self, image: RawHandle, mip: u32, layer: u32) -> Option<&[u8]> {
        self.images
            .get(&image)
            .and_then(|img| img.subresources.get(&(mip, layer)))
            .map(|v| v.as_slice())
    }

    pub fn framebuffer_digest(&self, framebuffer: RawHandle) -> Option<u64> {
        self.framebuffers.get(&framebuffer).map(|f| f.content_digest)
    }
}

impl Default for SoftwareDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayDriver for SoftwareDriver {
    fn create_buffer(
        &mut self,
        info: &SerializedBufferCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_buffer");
        let handle = self.alloc();
        self.buffers.insert(handle, vec![0u8; info.size as usize]);
        Ok(handle)
    }

    fn create_image(
        &mut self,
        info: &SerializedImageCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_image");
        let handle = self.alloc();
        self.images.insert(
            handle,
            ImageState {
                info: info.clone(),
                subresources: BTreeMap::new(),
                parameters: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    fn create_image_view(
        &mut self,
        image: RawHandle,
        _info: &SerializedImageViewCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_image_view");
        if !self.images.contains_key(&image) {
            return Err(DriverError::InvalidHandle {
                call: "create_image_view",
                handle: image,
            });
        }
        let handle = self.alloc();
        self.opaque_objects.insert(handle, ResourceType::ImageView);
        Ok(handle)
    }

    fn create_sampler(
        &mut self,
        _info: &SerializedSamplerCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_sampler");
        let handle = self.alloc();
        self.opaque_objects.insert(handle, ResourceType::Sampler);
        Ok(handle)
    }

    fn create_shader_module(&mut self, code: &[u8]) -> Result<RawHandle, DriverError> {
        self.log("create_shader_module");
        let handle = self.alloc();
        self.shader_modules.insert(handle, code.to_vec());
        Ok(handle)
    }

    fn create_pipeline_layout(
        &mut self,
        _set_layouts: &[RawHandle],
        _push_constant_ranges: &[SerializedPushConstantRange],
    ) -> Result<RawHandle, DriverError> {
        self.log("create_pipeline_layout");
        let handle = self.alloc();
        self.opaque_objects.insert(handle, ResourceType::PipelineLayout);
        Ok(handle)
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[SerializedDescriptorSetLayoutBinding],
    ) -> Result<RawHandle, DriverError> {
        self.log("create_descriptor_set_layout");
        let handle = self.alloc();
        self.opaque_objects
            .insert(handle, ResourceType::DescriptorSetLayout);
        Ok(handle)
    }

    fn create_descriptor_set(&mut self, _layout: RawHandle) -> Result<RawHandle, DriverError> {
        self.log("create_descriptor_set");
        let handle = self.alloc();
        self.opaque_objects.insert(handle, ResourceType::DescriptorSet);
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        info: &SerializedGraphicsPipelineCreateInfo,
        stage_modules: &[RawHandle],
        _layout: RawHandle,
        _render_pass: RawHandle,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_graphics_pipeline");
        for module in stage_modules {
            if !self.shader_modules.contains_key(module) {
                return Err(DriverError::InvalidHandle {
                    call: "create_graphics_pipeline",
                    handle: *module,
                });
            }
        }
        let handle = self.alloc();
        self.pipelines.insert(handle, info.clone());
        Ok(handle)
    }

    fn create_render_pass(
        &mut self,
        info: &SerializedRenderPassCreateInfo,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_render_pass");
        let handle = self.alloc();
        self.render_passes.insert(handle, info.clone());
        Ok(handle)
    }

    fn create_framebuffer(
        &mut self,
        _render_pass: RawHandle,
        attachments: &[RawHandle],
        width: u32,
        height: u32,
        _layers: u32,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_framebuffer");
        let handle = self.alloc();
        self.framebuffers.insert(
            handle,
            FramebufferState {
                width,
                height,
                attachments: attachments.to_vec(),
                content_digest: 0,
            },
        );
        Ok(handle)
    }

    fn create_fence(&mut self, _signaled: bool) -> Result<RawHandle, DriverError> {
        self.log("create_fence");
        let handle = self.alloc();
        self.opaque_objects.insert(handle, ResourceType::Fence);
        Ok(handle)
    }

    fn destroy_resource(
        &mut self,
        handle: RawHandle,
        resource_type: ResourceType,
    ) -> Result<(), DriverError> {
        self.log("destroy_resource");
        let removed = match resource_type {
            ResourceType::Buffer => self.buffers.remove(&handle).is_some(),
            ResourceType::Image => self.images.remove(&handle).is_some(),
            ResourceType::ShaderModule => self.shader_modules.remove(&handle).is_some(),
            ResourceType::Pipeline => self.pipelines.remove(&handle).is_some(),
            ResourceType::RenderPass => self.render_passes.remove(&handle).is_some(),
            ResourceType::Framebuffer => self.framebuffers.remove(&handle).is_some(),
            ResourceType::DescriptorSet => {
                self.descriptor_bindings.remove(&handle);
                self.opaque_objects.remove(&handle).is_some()
            }
            _ => self.opaque_objects.remove(&handle).is_some(),
        };
        if !removed {
            return Err(DriverError::InvalidHandle {
                call: "destroy_resource",
                handle,
            });
        }
        Ok(())
    }

    fn update_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        self.log("update_buffer");
        let contents = self.buffers.get_mut(&buffer).ok_or(DriverError::InvalidHandle {
            call: "update_buffer",
            handle: buffer,
        })?;
        let offset = offset as usize;
        let end = offset + data.len();
        if end > contents.len() {
            return Err(DriverError::CallFailed {
                call: "update_buffer",
                detail: format!("write [{offset}, {end}) past buffer size {}", contents.len()),
            });
        }
        contents[offset..end].copy_from_slice(data);
        Ok(())
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
        self.log("upload_texture");
        let state = self.image_mut(image, "upload_texture")?;
        let full_extent = state.info.extent;
        let texel_count = (extent[0] * extent[1] * extent[2].max(1)) as usize;
        if texel_count == 0 || data.len() % texel_count != 0 {
            return Err(DriverError::CallFailed {
                call: "upload_texture",
                detail: format!("{} bytes for {texel_count} texels", data.len()),
            });
        }
        let whole = offset == [0, 0, 0] && extent == full_extent;
        let bpt = data.len() / texel_count;
        let sub = state
            .subresources
            .entry((mip_level, array_layer))
            .or_default();
        if whole {
            *sub = data.to_vec();
        } else {
            if sub.is_empty() {
                // First touch sizes the subresource from the image extent
                // so the rest reads back as zero fill
                let full_texels =
                    (full_extent[0] * full_extent[1] * full_extent[2].max(1)) as usize;
                sub.resize(full_texels * bpt, 0);
            }
            // Partial update over existing contents, row by row
            let row_bytes = extent[0] as usize * bpt;
            let dst_row_bytes = full_extent[0] as usize * bpt;
            for row in 0..extent[1] as usize {
                let dst_start =
                    (offset[1] as usize + row) * dst_row_bytes + offset[0] as usize * bpt;
                let src_start = row * row_bytes;
                if dst_start + row_bytes > sub.len() {
                    return Err(DriverError::CallFailed {
                        call: "upload_texture",
                        detail: "region outside image".to_string(),
                    });
                }
                sub[dst_start..dst_start + row_bytes]
                    .copy_from_slice(&data[src_start..src_start + row_bytes]);
            }
        }
        Ok(())
    }

    fn set_texture_parameter(
        &mut self,
        image: RawHandle,
        parameter: u32,
        value: i32,
    ) -> Result<(), DriverError> {
        self.log("set_texture_parameter");
        let state = self.image_mut(image, "set_texture_parameter")?;
        state.parameters.insert(parameter, value);
        Ok(())
    }

    fn update_descriptor_sets(
        &mut self,
        writes: &[ResolvedDescriptorWrite],
    ) -> Result<(), DriverError> {
        self.log("update_descriptor_sets");
        for write in writes {
            self.descriptor_bindings
                .entry(write.dst_set)
                .or_default()
                .push(write.clone());
        }
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: RawHandle) -> Result<(), DriverError> {
        self.log("bind_pipeline");
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
        self.log("bind_vertex_buffers");
        for (i, buffer) in buffers.iter().enumerate() {
            let offset = offsets.get(i).copied().unwrap_or(0);
            self.bound
                .vertex_buffers
                .insert(first_binding + i as u32, (*buffer, offset));
        }
        Ok(())
    }

    fn bind_index_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        index_type: u32,
    ) -> Result<(), DriverError> {
        self.log("bind_index_buffer");
        self.bound.index_buffer = Some((buffer, offset, index_type));
        Ok(())
    }

    fn bind_descriptor_sets(
        &mut self,
        _layout: RawHandle,
        first_set: u32,
        sets: &[RawHandle],
        _dynamic_offsets: &[u32],
    ) -> Result<(), DriverError> {
        self.log("bind_descriptor_sets");
        for (i, set) in sets.iter().enumerate() {
            self.bound.descriptor_sets.insert(first_set + i as u32, *set);
        }
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &SerializedViewport) -> Result<(), DriverError> {
        self.log("set_viewport");
        self.bound.viewport = Some(*viewport);
        Ok(())
    }

    fn set_scissor(&mut self, scissor: &SerializedRect2D) -> Result<(), DriverError> {
        self.log("set_scissor");
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
        self.log("begin_render_pass");
        self.bound.render_pass = Some(render_pass);
        self.bound.framebuffer = Some(framebuffer);
        if let Some(state) = self.framebuffers.get_mut(&framebuffer) {
            let mut digest = fnv1a_u64(0, render_pass);
            for clear in clear_values {
                digest = fnv1a(digest, &clear.data);
            }
            digest = fnv1a(digest, &render_area.extent[0].to_le_bytes());
            digest = fnv1a(digest, &render_area.extent[1].to_le_bytes());
            state.content_digest = digest;
        }
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<(), DriverError> {
        self.log("end_render_pass");
        self.bound.render_pass = None;
        self.bound.framebuffer = None;
        Ok(())
    }

    fn begin_debug_label(&mut self, _label: &str) -> Result<(), DriverError> {
        self.log("begin_debug_label");
        self.debug_label_depth += 1;
        Ok(())
    }

    fn end_debug_label(&mut self) -> Result<(), DriverError> {
        self.log("end_debug_label");
        self.debug_label_depth = self.debug_label_depth.saturating_sub(1);
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) -> Result<(), DriverError> {
        self.log("draw");
        let record = DrawRecord {
            call: "draw",
            vertex_or_index_count: vertex_count,
            instance_count,
            pipeline: self.bound.pipeline,
            overlay_target: self.active_overlay,
        };
        self.record_draw(record);
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) -> Result<(), DriverError> {
        self.log("draw_indexed");
        let record = DrawRecord {
            call: "draw_indexed",
            vertex_or_index_count: index_count,
            instance_count,
            pipeline: self.bound.pipeline,
            overlay_target: self.active_overlay,
        };
        self.record_draw(record);
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DriverError> {
        self.log("dispatch");
        let record = DrawRecord {
            call: "dispatch",
            vertex_or_index_count: x * y * z,
            instance_count: 1,
            pipeline: self.bound.pipeline,
            overlay_target: self.active_overlay,
        };
        self.record_draw(record);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferCopy],
    ) -> Result<(), DriverError> {
        self.log("copy_buffer");
        for region in regions {
            let data = {
                let src_buf = self.buffers.get(&src).ok_or(DriverError::InvalidHandle {
                    call: "copy_buffer",
                    handle: src,
                })?;
                let start = region.src_offset as usize;
                let end = start + region.size as usize;
                if end > src_buf.len() {
                    return Err(DriverError::CallFailed {
                        call: "copy_buffer",
                        detail: "source region out of bounds".to_string(),
                    });
                }
                src_buf[start..end].to_vec()
            };
            self.update_buffer(dst, region.dst_offset, &data)?;
        }
        Ok(())
    }

    fn copy_buffer_to_image(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferImageCopy],
    ) -> Result<(), DriverError> {
        self.log("copy_buffer_to_image");
        for region in regions {
            let texel_count =
                (region.image_extent[0] * region.image_extent[1] * region.image_extent[2].max(1))
                    as usize;
            let data = {
                let src_buf = self.buffers.get(&src).ok_or(DriverError::InvalidHandle {
                    call: "copy_buffer_to_image",
                    handle: src,
                })?;
                let start = region.buffer_offset as usize;
                let end = start + texel_count * 4;
                if end > src_buf.len() {
                    return Err(DriverError::CallFailed {
                        call: "copy_buffer_to_image",
                        detail: "source region out of bounds".to_string(),
                    });
                }
                src_buf[start..end].to_vec()
            };
            self.upload_texture(
                dst,
                region.mip_level,
                region.array_layer,
                region.image_offset,
                region.image_extent,
                &data,
            )?;
        }
        Ok(())
    }

    fn clear_attachments(
        &mut self,
        clear_value: &SerializedClearValue,
        rect: &SerializedRect2D,
    ) -> Result<(), DriverError> {
        self.log("clear_attachments");
        if let Some(fb) = self.bound.framebuffer {
            if let Some(state) = self.framebuffers.get_mut(&fb) {
                let mut digest = fnv1a(state.content_digest, &clear_value.data);
                digest = fnv1a(digest, &rect.extent[0].to_le_bytes());
                state.content_digest = fnv1a(digest, &rect.extent[1].to_le_bytes());
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), DriverError> {
        self.log("wait_idle");
        self.drain_count += 1;
        Ok(())
    }

    fn read_back_buffer(&mut self, buffer: RawHandle) -> Result<Vec<u8>, DriverError> {
        self.log("read_back_buffer");
        self.buffers
            .get(&buffer)
            .cloned()
            .ok_or(DriverError::InvalidHandle {
                call: "read_back_buffer",
                handle: buffer,
            })
    }

    fn read_back_texture(&mut self, image: RawHandle) -> Result<Vec<u8>, DriverError> {
        self.log("read_back_texture");
        let state = self.images.get(&image).ok_or(DriverError::InvalidHandle {
            call: "read_back_texture",
            handle: image,
        })?;
        Ok(state
            .subresources
            .get(&(0, 0))
            .cloned()
            .unwrap_or_default())
    }

    fn create_overlay_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RawHandle, DriverError> {
        self.log("create_overlay_target");
        // Targets are reused per extent across overlay passes
        let existing = self
            .overlay_targets
            .iter()
            .find(|(_, img)| img.width == width && img.height == height)
            .map(|(h, _)| *h);
        if let Some(handle) = existing {
            if let Some(img) = self.overlay_targets.get_mut(&handle) {
                img.data.fill(0);
            }
            return Ok(handle);
        }
        let handle = self.alloc();
        self.overlay_targets.insert(
            handle,
            ReadbackImage {
                width,
                height,
                data: vec![0u8; (width * height * 4) as usize],
            },
        );
        Ok(handle)
    }

    fn read_overlay_target(
        &mut self,
        target: RawHandle,
    ) -> Result<ReadbackImage, DriverError> {
        self.log("read_overlay_target");
        self.overlay_targets
            .get(&target)
            .cloned()
            .ok_or(DriverError::InvalidHandle {
                call: "read_overlay_target",
                handle: target,
            })
    }

    fn set_overlay_target(&mut self, target: Option<RawHandle>) -> Result<(), DriverError> {
        self.log("set_overlay_target");
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
        let mut digest = 0u64;
        digest = fnv1a_u64(digest, u64::from(self.debug_label_depth));
        digest = fnv1a_u64(digest, self.bound.pipeline.unwrap_or(0));
        for (slot, (buf, off)) in &self.bound.vertex_buffers {
            digest = fnv1a_u64(digest, u64::from(*slot));
            digest = fnv1a_u64(digest, *buf);
            digest = fnv1a_u64(digest, *off);
        }
        if let Some((buf, off, ty)) = self.bound.index_buffer {
            digest = fnv1a_u64(digest, buf);
            digest = fnv1a_u64(digest, off);
            digest = fnv1a_u64(digest, u64::from(ty));
        }
        for (slot, set) in &self.bound.descriptor_sets {
            digest = fnv1a_u64(digest, u64::from(*slot));
            digest = fnv1a_u64(digest, *set);
        }
        digest = fnv1a_u64(digest, self.bound.render_pass.unwrap_or(0));
        digest = fnv1a_u64(digest, self.bound.framebuffer.unwrap_or(0));

        let mut buffer_handles: Vec<_> = self.buffers.keys().copied().collect();
        buffer_handles.sort_unstable();
        for handle in buffer_handles {
            digest = fnv1a_u64(digest, handle);
            digest = fnv1a(digest, &self.buffers[&handle]);
        }
        let mut image_handles: Vec<_> = self.images.keys().copied().collect();
        image_handles.sort_unstable();
        for handle in image_handles {
            digest = fnv1a_u64(digest, handle);
            let image = &self.images[&handle];
            for ((mip, layer), data) in &image.subresources {
                digest = fnv1a_u64(digest, u64::from(*mip));
                digest = fnv1a_u64(digest, u64::from(*layer));
                digest = fnv1a(digest, data);
            }
            for (param, value) in &image.parameters {
                digest = fnv1a_u64(digest, u64::from(*param));
                digest = fnv1a_u64(digest, *value as u64);
            }
        }
        let mut fb_handles: Vec<_> = self.framebuffers.keys().copied().collect();
        fb_handles.sort_unstable();
        for handle in fb_handles {
            let fb = &self.framebuffers[&handle];
            digest = fnv1a_u64(digest, handle);
            digest = fnv1a_u64(digest, u64::from(fb.width));
            digest = fnv1a_u64(digest, u64::from(fb.height));
            digest = fnv1a_u64(digest, fb.attachments.len() as u64);
            digest = fnv1a_u64(digest, fb.content_digest);
        }
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba8_image(width: u32, height: u32) -> SerializedImageCreateInfo {
        SerializedImageCreateInfo {
            flags: 0,
            image_type: 1,
            format: 37, // RGBA8
            extent: [width, height, 1],
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            tiling: 0,
            usage: 0,
            initial_layout: 0,
        }
    }

    #[test]
    fn identical_sequences_produce_identical_checksums() {
        let run = || {
            let mut driver = SoftwareDriver::new();
            let image = driver.create_image(&rgba8_image(4, 4)).unwrap();
            driver
                .upload_texture(image, 0, 0, [0; 3], [4, 4, 1], &[7u8; 64])
                .unwrap();
            let buffer = driver
                .create_buffer(&SerializedBufferCreateInfo {
                    size: 16,
                    usage: 0,
                    sharing_mode: 0,
                })
                .unwrap();
            driver.update_buffer(buffer, 4, &[1, 2, 3]).unwrap();
            driver.state_checksum()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn draw_changes_framebuffer_digest() {
        let mut driver = SoftwareDriver::new();
        let rp = driver
            .create_render_pass(&SerializedRenderPassCreateInfo {
                color_attachments: vec![],
                depth_attachment: None,
            })
            .unwrap();
        let fb = driver.create_framebuffer(rp, &[], 64, 64, 1).unwrap();
        let area = SerializedRect2D {
            offset: [0, 0],
            extent: [64, 64],
        };
        driver.begin_render_pass(rp, fb, &area, &[]).unwrap();
        let before = driver.framebuffer_digest(fb).unwrap();
        driver.draw(3, 1, 0, 0).unwrap();
        let after = driver.framebuffer_digest(fb).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn first_partial_upload_zero_fills_the_rest() {
        let mut driver = SoftwareDriver::new();
        let image = driver.create_image(&rgba8_image(4, 4)).unwrap();
        driver
            .upload_texture(image, 0, 0, [1, 1, 0], [2, 2, 1], &[0xFFu8; 16])
            .unwrap();
        let data = driver.texture_contents(image, 0, 0).unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(data[0], 0);
        let row1_texel1 = (4 + 1) * 4;
        assert_eq!(data[row1_texel1], 0xFF);
    }

    #[test]
    fn partial_texture_update_preserves_surroundings() {
        let mut driver = SoftwareDriver::new();
        let image = driver.create_image(&rgba8_image(4, 4)).unwrap();
        driver
            .upload_texture(image, 0, 0, [0; 3], [4, 4, 1], &[0x11u8; 64])
            .unwrap();
        driver
            .upload_texture(image, 0, 0, [1, 1, 0], [2, 2, 1], &[0xFFu8; 16])
            .unwrap();
        let data = driver.texture_contents(image, 0, 0).unwrap();
        // Corner untouched, interior overwritten
        assert_eq!(data[0], 0x11);
        let row1_texel1 = (4 + 1) * 4;
        assert_eq!(data[row1_texel1], 0xFF);
    }
}
