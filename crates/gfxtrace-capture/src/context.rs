use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use gfxtrace_core::driver::ResolvedDescriptorWrite;
use gfxtrace_core::{Mode, RecordOutcome, ReplayDriver, ResourceManager, UpdateKind};
use gfxtrace_protocol::call::{ApiCall, Chunk};
use gfxtrace_protocol::types::*;
use gfxtrace_protocol::{RawHandle, ResourceId, ResourceType};

use crate::error::CaptureError;
use crate::policy::{record_policy, RecordPolicy};
use crate::recorder::{CompletedCapture, FrameRecorder};

/// Source of texel data for an upload call.
///
/// `TransferBuffer` is the hidden-dependency case: the upload's behavior
/// depends on a bound buffer that is not part of the call's own arguments.
/// Capture neutralizes it by fetching the bytes and recording them inline.
pub enum TexelSource<'a> {
    Inline(&'a [u8]),
    TransferBuffer {
        buffer: RawHandle,
        offset: u64,
        size: u64,
    },
}

/// Application-facing graphics pipeline description, with driver handles.
pub struct GraphicsPipelineDesc {
    /// (shader module, entry point, stage bits)
    pub stages: Vec<(RawHandle, String, u32)>,
    pub vertex_bindings: Vec<SerializedVertexBinding>,
    pub vertex_attributes: Vec<SerializedVertexAttribute>,
    pub topology: i32,
    pub rasterization: SerializedRasterizationState,
    pub depth_stencil: Option<SerializedDepthStencilState>,
    pub color_write_mask: u32,
    pub layout: RawHandle,
    pub render_pass: RawHandle,
    pub subpass: u32,
}

/// Application-facing descriptor write, with driver handles.
pub struct DescriptorWriteDesc {
    pub dst_set: RawHandle,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: i32,
    /// (buffer, offset, range)
    pub buffers: Vec<(RawHandle, u64, u64)>,
    /// (sampler, image view, layout)
    pub images: Vec<(RawHandle, RawHandle, i32)>,
}

/// Bound state mirrored on the capture side. Used to re-establish current
/// bindings at the head of a capture frame and to minimize redundant
/// re-bind chunks.
#[derive(Default)]
struct ShadowState {
    pipeline: Option<ResourceId>,
    vertex_buffers: BTreeMap<u32, (ResourceId, u64)>,
    index_buffer: Option<(ResourceId, u64, u32)>,
    /// slot -> (pipeline layout, set, dynamic offsets). The offsets are
    /// shared across the slots of one bind call instead of cloned per slot.
    descriptor_sets: BTreeMap<u32, (ResourceId, ResourceId, Arc<[u32]>)>,
    viewport: Option<SerializedViewport>,
    scissor: Option<SerializedRect2D>,
}

/// One capture context: owns the mode state machine, the current-side
/// resource identity, the frame recorder, and the forwarding seam to the
/// real driver. All interception is synchronous on the calling thread.
pub struct CaptureContext<D: ReplayDriver> {
    driver: D,
    resources: ResourceManager,
    recorder: FrameRecorder,
    mode: Mode,
    frame_number: u64,
    shadow: ShadowState,
    /// Resources alive when the open frame began; their records form the
    /// capture's initial state.
    pending_initial: Vec<ResourceId>,
}

impl<D: ReplayDriver> CaptureContext<D> {
    pub fn new(driver: D, settings: gfxtrace_core::CaptureSettings) -> Self {
        Self {
            driver,
            resources: ResourceManager::new(settings),
            recorder: FrameRecorder::new(),
            mode: Mode::WritingIdle,
            frame_number: 0,
            shadow: ShadowState::default(),
            pending_initial: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // ── Chunk routing ───────────────────────────────────────

    fn record(&mut self, call: ApiCall) -> Result<(), CaptureError> {
        match record_policy(self.mode, &call) {
            RecordPolicy::Skip => Ok(()),
            RecordPolicy::FrameRecord => {
                self.resources.mark_frame_referenced(&call.referenced_ids());
                self.recorder.append(Chunk::new(call))?;
                Ok(())
            }
            RecordPolicy::ResourceRecord => self.record_to_resource(call),
        }
    }

    fn record_to_resource(&mut self, call: ApiCall) -> Result<(), CaptureError> {
        if let Some((id, _)) = call.created_id() {
            self.resources.record_creation_chunk(id, Chunk::new(call))?;
            return Ok(());
        }
        let kind = match &call {
            ApiCall::SetTextureParameter { .. } => UpdateKind::Parameter,
            _ => UpdateKind::Upload,
        };
        let owner = match call.referenced_ids().first() {
            Some(id) => *id,
            None => return Ok(()),
        };
        match self.resources.record_update_chunk(owner, kind, Chunk::new(call))? {
            RecordOutcome::Recorded => {}
            RecordOutcome::Diverted => {
                debug!(%owner, "per-update chunking diverted to wholesale refetch");
            }
        }
        Ok(())
    }

    /// Called by wrappers that have no recording logic yet. The real call
    /// already went through; the capture is flagged as potentially
    /// incomplete rather than silently dropping the call.
    pub fn note_unimplemented(&mut self, entry_point: &str) {
        warn!(entry_point, "intercepted call has no recording logic");
        if self.mode.is_capturing_frame() {
            self.recorder.mark_incomplete();
        }
    }

    // ── Capture lifecycle ───────────────────────────────────

    /// Request a capture of the next full frame.
    pub fn attempt_capture(&mut self) {
        self.recorder.attempt_capture();
    }

    /// Open a capture frame now. Refetches dirty resources wholesale,
    /// snapshots the initial-resource set, and re-establishes current
    /// bound state at the head of the frame record.
    pub fn begin_capture_frame(&mut self) -> Result<(), CaptureError> {
        self.refetch_dirty()?;
        self.pending_initial = self.resources.tracked_resources();
        self.recorder.begin_capture_frame(self.frame_number)?;
        self.mode = Mode::WritingCaptureFrame;
        self.reestablish_shadow_state()?;
        Ok(())
    }

    /// Close the open capture frame and finalize its header.
    pub fn end_capture_frame(&mut self) -> Result<(), CaptureError> {
        self.record(ApiCall::EndOfFrame)?;
        let initial_resources = std::mem::take(&mut self.pending_initial);
        let mut initial_chunks = Vec::new();
        for id in &initial_resources {
            initial_chunks.extend(self.resources.initial_chunks(*id)?);
        }
        self.recorder
            .end_capture_frame(initial_resources, initial_chunks)?;
        self.mode = Mode::WritingIdle;
        info!("capture frame complete");
        Ok(())
    }

    /// Frame boundary from the application (present/swap). Closes an open
    /// capture frame, or opens one if a capture was requested.
    pub fn end_frame(&mut self) -> Result<(), CaptureError> {
        if self.mode.is_capturing_frame() {
            self.end_capture_frame()?;
        } else if self.recorder.is_capture_requested() {
            self.begin_capture_frame()?;
        }
        self.frame_number += 1;
        Ok(())
    }

    pub fn has_successful_capture(&self) -> bool {
        self.recorder.has_successful_capture()
    }

    pub fn capture(&self) -> Option<&CompletedCapture> {
        self.recorder.capture()
    }

    pub fn take_capture(&mut self) -> Option<CompletedCapture> {
        self.recorder.take_capture()
    }

    /// Replace dirty resources' accumulated update histories with fresh
    /// wholesale snapshots read back from the driver.
    fn refetch_dirty(&mut self) -> Result<(), CaptureError> {
        for id in self.resources.take_dirty() {
            let Some(handle) = self.resources.get_current_resource(id) else {
                continue;
            };
            let snapshot = match self.resources.resource_type(id) {
                Some(ResourceType::Image) => {
                    let extent = self.image_extent(id).unwrap_or([0, 0, 0]);
                    let data = self.driver.read_back_texture(handle)?;
                    ApiCall::UploadTexture {
                        image: id,
                        mip_level: 0,
                        array_layer: 0,
                        offset: [0, 0, 0],
                        extent,
                        data,
                        source_neutralized: true,
                    }
                }
                Some(ResourceType::Buffer) => {
                    let data = self.driver.read_back_buffer(handle)?;
                    ApiCall::UpdateBuffer {
                        buffer: id,
                        offset: 0,
                        data,
                    }
                }
                other => {
                    warn!(%id, ?other, "dirty resource kind has no wholesale refetch");
                    continue;
                }
            };
            debug!(%id, "wholesale refetch");
            self.resources
                .reset_record_with_snapshot(id, Chunk::new(snapshot))?;
        }
        Ok(())
    }

    fn image_extent(&self, id: ResourceId) -> Option<[u32; 3]> {
        self.resources
            .initial_chunks(id)
            .ok()?
            .iter()
            .find_map(|c| match &c.call {
                ApiCall::CreateImage { info, .. } => Some(info.extent),
                _ => None,
            })
    }

    /// Emit the shadowed bound state into the frame record head so the
    /// frame replays with the bindings the application had established
    /// before the boundary.
    fn reestablish_shadow_state(&mut self) -> Result<(), CaptureError> {
        if let Some(pipeline) = self.shadow.pipeline {
            self.record(ApiCall::BindPipeline { pipeline })?;
        }
        let vertex_binds: Vec<(u32, ResourceId, u64)> = self
            .shadow
            .vertex_buffers
            .iter()
            .map(|(slot, (buf, off))| (*slot, *buf, *off))
            .collect();
        for (slot, buffer, offset) in vertex_binds {
            self.record(ApiCall::BindVertexBuffers {
                first_binding: slot,
                buffers: vec![buffer],
                offsets: vec![offset],
            })?;
        }
        if let Some((buffer, offset, index_type)) = self.shadow.index_buffer {
            self.record(ApiCall::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            })?;
        }
        let desc_binds: Vec<(u32, ResourceId, ResourceId, Vec<u32>)> = self
            .shadow
            .descriptor_sets
            .iter()
            .map(|(slot, (layout, set, offs))| (*slot, *layout, *set, offs.to_vec()))
            .collect();
        for (slot, layout, set, dynamic_offsets) in desc_binds {
            self.record(ApiCall::BindDescriptorSets {
                layout,
                first_set: slot,
                sets: vec![set],
                dynamic_offsets,
            })?;
        }
        if let Some(viewport) = self.shadow.viewport {
            self.record(ApiCall::SetViewport { viewport })?;
        }
        if let Some(scissor) = self.shadow.scissor {
            self.record(ApiCall::SetScissor { scissor })?;
        }
        Ok(())
    }

    // ── Identity helpers ────────────────────────────────────

    /// ID for a handle, or NULL with a warning for untracked handles.
    /// Untracked handles skip serialization; they never fail the call.
    fn id_for(&mut self, handle: RawHandle) -> ResourceId {
        match self.resources.get_id(handle) {
            Some(id) => id,
            None => {
                warn!(handle, "untracked handle; chunk will be skipped");
                if self.mode.is_capturing_frame() {
                    self.recorder.mark_incomplete();
                }
                ResourceId::NULL
            }
        }
    }

    fn ids_for(&mut self, handles: &[RawHandle]) -> Vec<ResourceId> {
        handles.iter().map(|h| self.id_for(*h)).collect()
    }

    // ── Intercepted entry points: resource creation ─────────

    pub fn create_buffer(
        &mut self,
        info: SerializedBufferCreateInfo,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_buffer(&info)?;
        let id = self.resources.register_resource(handle, ResourceType::Buffer)?;
        self.record(ApiCall::CreateBuffer { id, info })?;
        Ok(handle)
    }

    pub fn create_image(
        &mut self,
        info: SerializedImageCreateInfo,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_image(&info)?;
        let id = self.resources.register_resource(handle, ResourceType::Image)?;
        self.record(ApiCall::CreateImage { id, info })?;
        Ok(handle)
    }

    pub fn create_image_view(
        &mut self,
        image: RawHandle,
        view_type: i32,
        format: i32,
        subresource_range: SerializedImageSubresourceRange,
    ) -> Result<RawHandle, CaptureError> {
        let image_id = self.id_for(image);
        let info = SerializedImageViewCreateInfo {
            image: image_id,
            view_type,
            format,
            subresource_range,
        };
        let handle = self.driver.create_image_view(image, &info)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::ImageView)?;
        if !image_id.is_null() {
            self.record(ApiCall::CreateImageView { id, info })?;
        }
        Ok(handle)
    }

    pub fn create_sampler(
        &mut self,
        info: SerializedSamplerCreateInfo,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_sampler(&info)?;
        let id = self.resources.register_resource(handle, ResourceType::Sampler)?;
        self.record(ApiCall::CreateSampler { id, info })?;
        Ok(handle)
    }

    pub fn create_shader_module(&mut self, code: &[u8]) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_shader_module(code)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::ShaderModule)?;
        self.record(ApiCall::CreateShaderModule {
            id,
            code: code.to_vec(),
        })?;
        Ok(handle)
    }

    pub fn create_descriptor_set_layout(
        &mut self,
        bindings: Vec<SerializedDescriptorSetLayoutBinding>,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_descriptor_set_layout(&bindings)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::DescriptorSetLayout)?;
        self.record(ApiCall::CreateDescriptorSetLayout { id, bindings })?;
        Ok(handle)
    }

    pub fn create_pipeline_layout(
        &mut self,
        set_layouts: &[RawHandle],
        push_constant_ranges: Vec<SerializedPushConstantRange>,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self
            .driver
            .create_pipeline_layout(set_layouts, &push_constant_ranges)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::PipelineLayout)?;
        let set_layout_ids = self.ids_for(set_layouts);
        self.record(ApiCall::CreatePipelineLayout {
            id,
            set_layouts: set_layout_ids,
            push_constant_ranges,
        })?;
        Ok(handle)
    }

    pub fn create_descriptor_set(&mut self, layout: RawHandle) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_descriptor_set(layout)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::DescriptorSet)?;
        let layout_id = self.id_for(layout);
        self.record(ApiCall::CreateDescriptorSet {
            id,
            layout: layout_id,
        })?;
        Ok(handle)
    }

    pub fn create_render_pass(
        &mut self,
        info: SerializedRenderPassCreateInfo,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_render_pass(&info)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::RenderPass)?;
        self.record(ApiCall::CreateRenderPass { id, info })?;
        Ok(handle)
    }

    pub fn create_framebuffer(
        &mut self,
        render_pass: RawHandle,
        attachments: &[RawHandle],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<RawHandle, CaptureError> {
        let handle = self
            .driver
            .create_framebuffer(render_pass, attachments, width, height, layers)?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::Framebuffer)?;
        let info = SerializedFramebufferCreateInfo {
            render_pass: self.id_for(render_pass),
            attachments: self.ids_for(attachments),
            width,
            height,
            layers,
        };
        self.record(ApiCall::CreateFramebuffer { id, info })?;
        Ok(handle)
    }

    pub fn create_graphics_pipeline(
        &mut self,
        desc: GraphicsPipelineDesc,
    ) -> Result<RawHandle, CaptureError> {
        let stage_modules: Vec<RawHandle> = desc.stages.iter().map(|s| s.0).collect();
        let info = SerializedGraphicsPipelineCreateInfo {
            stages: desc
                .stages
                .iter()
                .map(|(module, entry, stage)| SerializedShaderStage {
                    module: self.resources.get_id(*module).unwrap_or(ResourceId::NULL),
                    entry_point: entry.clone(),
                    stage: *stage,
                })
                .collect(),
            vertex_bindings: desc.vertex_bindings,
            vertex_attributes: desc.vertex_attributes,
            topology: desc.topology,
            rasterization: desc.rasterization,
            depth_stencil: desc.depth_stencil,
            color_write_mask: desc.color_write_mask,
            layout: self.id_for(desc.layout),
            render_pass: self.id_for(desc.render_pass),
            subpass: desc.subpass,
        };
        let handle = self.driver.create_graphics_pipeline(
            &info,
            &stage_modules,
            desc.layout,
            desc.render_pass,
        )?;
        let id = self
            .resources
            .register_resource(handle, ResourceType::Pipeline)?;
        self.record(ApiCall::CreateGraphicsPipeline { id, info })?;
        Ok(handle)
    }

    pub fn create_fence(&mut self, signaled: bool) -> Result<RawHandle, CaptureError> {
        let handle = self.driver.create_fence(signaled)?;
        let id = self.resources.register_resource(handle, ResourceType::Fence)?;
        self.record(ApiCall::CreateFence { id, signaled })?;
        Ok(handle)
    }

    pub fn destroy(
        &mut self,
        handle: RawHandle,
        resource_type: ResourceType,
    ) -> Result<(), CaptureError> {
        self.driver.destroy_resource(handle, resource_type)?;
        if let Some(id) = self.resources.get_id(handle) {
            self.record(ApiCall::DestroyResource { id, resource_type })?;
        }
        self.resources.unregister_resource(handle);
        Ok(())
    }

    // ── Intercepted entry points: resource updates ──────────

    pub fn update_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CaptureError> {
        self.driver.update_buffer(buffer, offset, data)?;
        let id = self.id_for(buffer);
        if !id.is_null() {
            self.record(ApiCall::UpdateBuffer {
                buffer: id,
                offset,
                data: data.to_vec(),
            })?;
        }
        Ok(())
    }

    /// Texture upload. When the source is a bound transfer buffer the data
    /// is fetched and recorded inline, neutralizing the hidden dependency
    /// on buffer bindings at replay time.
    pub fn upload_texture(
        &mut self,
        image: RawHandle,
        mip_level: u32,
        array_layer: u32,
        offset: [i32; 3],
        extent: [u32; 3],
        source: TexelSource<'_>,
    ) -> Result<(), CaptureError> {
        let (data, neutralized) = match source {
            TexelSource::Inline(bytes) => (bytes.to_vec(), false),
            TexelSource::TransferBuffer {
                buffer,
                offset: buf_offset,
                size,
            } => {
                let contents = self.driver.read_back_buffer(buffer)?;
                let start = buf_offset as usize;
                let end = start + size as usize;
                let slice = contents.get(start..end).ok_or_else(|| {
                    gfxtrace_core::DriverError::CallFailed {
                        call: "upload_texture",
                        detail: "transfer buffer range out of bounds".to_string(),
                    }
                })?;
                (slice.to_vec(), true)
            }
        };
        self.driver
            .upload_texture(image, mip_level, array_layer, offset, extent, &data)?;
        let id = self.id_for(image);
        if !id.is_null() {
            self.record(ApiCall::UploadTexture {
                image: id,
                mip_level,
                array_layer,
                offset,
                extent,
                data,
                source_neutralized: neutralized,
            })?;
        }
        Ok(())
    }

    pub fn set_texture_parameter(
        &mut self,
        image: RawHandle,
        parameter: u32,
        value: i32,
    ) -> Result<(), CaptureError> {
        self.driver.set_texture_parameter(image, parameter, value)?;
        let id = self.id_for(image);
        if !id.is_null() {
            self.record(ApiCall::SetTextureParameter {
                image: id,
                parameter,
                value,
            })?;
        }
        Ok(())
    }

    pub fn update_descriptor_sets(
        &mut self,
        writes: &[DescriptorWriteDesc],
    ) -> Result<(), CaptureError> {
        let resolved: Vec<ResolvedDescriptorWrite> = writes
            .iter()
            .map(|w| ResolvedDescriptorWrite {
                dst_set: w.dst_set,
                dst_binding: w.dst_binding,
                dst_array_element: w.dst_array_element,
                descriptor_type: w.descriptor_type,
                buffers: w.buffers.clone(),
                images: w.images.clone(),
            })
            .collect();
        self.driver.update_descriptor_sets(&resolved)?;

        // One chunk per write so each lands in exactly one set's record
        for w in writes {
            let write = SerializedDescriptorWrite {
                dst_set: self.id_for(w.dst_set),
                dst_binding: w.dst_binding,
                dst_array_element: w.dst_array_element,
                descriptor_type: w.descriptor_type,
                buffers: w
                    .buffers
                    .iter()
                    .map(|(b, off, range)| SerializedDescriptorBufferInfo {
                        buffer: self.resources.get_id(*b).unwrap_or(ResourceId::NULL),
                        offset: *off,
                        range: *range,
                    })
                    .collect(),
                images: w
                    .images
                    .iter()
                    .map(|(sampler, view, layout)| SerializedDescriptorImageInfo {
                        sampler: self.resources.get_id(*sampler).unwrap_or(ResourceId::NULL),
                        image_view: self.resources.get_id(*view).unwrap_or(ResourceId::NULL),
                        image_layout: *layout,
                    })
                    .collect(),
            };
            if !write.dst_set.is_null() {
                self.record(ApiCall::UpdateDescriptorSets {
                    writes: vec![write],
                })?;
            }
        }
        Ok(())
    }

    // ── Intercepted entry points: state setting ─────────────

    pub fn bind_pipeline(&mut self, pipeline: RawHandle) -> Result<(), CaptureError> {
        self.driver.bind_pipeline(pipeline)?;
        let id = self.id_for(pipeline);
        // Redundant re-binds are forwarded but recorded minimized: the
        // driver state is provably identical, so the chunk is dropped.
        if self.shadow.pipeline == Some(id) {
            return Ok(());
        }
        self.shadow.pipeline = Some(id);
        if !id.is_null() {
            self.record(ApiCall::BindPipeline { pipeline: id })?;
        }
        Ok(())
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[RawHandle],
        offsets: &[u64],
    ) -> Result<(), CaptureError> {
        self.driver.bind_vertex_buffers(first_binding, buffers, offsets)?;
        let ids = self.ids_for(buffers);
        for (i, id) in ids.iter().enumerate() {
            let offset = offsets.get(i).copied().unwrap_or(0);
            self.shadow
                .vertex_buffers
                .insert(first_binding + i as u32, (*id, offset));
        }
        self.record(ApiCall::BindVertexBuffers {
            first_binding,
            buffers: ids,
            offsets: offsets.to_vec(),
        })?;
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        index_type: u32,
    ) -> Result<(), CaptureError> {
        self.driver.bind_index_buffer(buffer, offset, index_type)?;
        let id = self.id_for(buffer);
        self.shadow.index_buffer = Some((id, offset, index_type));
        if !id.is_null() {
            self.record(ApiCall::BindIndexBuffer {
                buffer: id,
                offset,
                index_type,
            })?;
        }
        Ok(())
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: RawHandle,
        first_set: u32,
        sets: &[RawHandle],
        dynamic_offsets: &[u32],
    ) -> Result<(), CaptureError> {
        self.driver
            .bind_descriptor_sets(layout, first_set, sets, dynamic_offsets)?;
        let layout_id = self.id_for(layout);
        let set_ids = self.ids_for(sets);
        let offsets: Arc<[u32]> = Arc::from(dynamic_offsets);
        for (i, set_id) in set_ids.iter().enumerate() {
            self.shadow.descriptor_sets.insert(
                first_set + i as u32,
                (layout_id, *set_id, Arc::clone(&offsets)),
            );
        }
        self.record(ApiCall::BindDescriptorSets {
            layout: layout_id,
            first_set,
            sets: set_ids,
            dynamic_offsets: dynamic_offsets.to_vec(),
        })?;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: SerializedViewport) -> Result<(), CaptureError> {
        self.driver.set_viewport(&viewport)?;
        if self.shadow.viewport == Some(viewport) {
            return Ok(());
        }
        self.shadow.viewport = Some(viewport);
        self.record(ApiCall::SetViewport { viewport })?;
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: SerializedRect2D) -> Result<(), CaptureError> {
        self.driver.set_scissor(&scissor)?;
        if self.shadow.scissor == Some(scissor) {
            return Ok(());
        }
        self.shadow.scissor = Some(scissor);
        self.record(ApiCall::SetScissor { scissor })?;
        Ok(())
    }

    // ── Intercepted entry points: scopes and actions ────────

    pub fn begin_render_pass(
        &mut self,
        render_pass: RawHandle,
        framebuffer: RawHandle,
        render_area: SerializedRect2D,
        clear_values: Vec<SerializedClearValue>,
    ) -> Result<(), CaptureError> {
        self.driver
            .begin_render_pass(render_pass, framebuffer, &render_area, &clear_values)?;
        let rp_id = self.id_for(render_pass);
        let fb_id = self.id_for(framebuffer);
        self.record(ApiCall::BeginRenderPass {
            render_pass: rp_id,
            framebuffer: fb_id,
            render_area,
            clear_values,
        })?;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<(), CaptureError> {
        self.driver.end_render_pass()?;
        self.record(ApiCall::EndRenderPass)?;
        Ok(())
    }

    pub fn begin_debug_label(&mut self, label: &str) -> Result<(), CaptureError> {
        self.driver.begin_debug_label(label)?;
        self.record(ApiCall::BeginDebugLabel {
            label: label.to_string(),
        })?;
        Ok(())
    }

    pub fn end_debug_label(&mut self) -> Result<(), CaptureError> {
        self.driver.end_debug_label()?;
        self.record(ApiCall::EndDebugLabel)?;
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), CaptureError> {
        self.driver
            .draw(vertex_count, instance_count, first_vertex, first_instance)?;
        self.record(ApiCall::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })?;
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), CaptureError> {
        self.driver.draw_indexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        )?;
        self.record(ApiCall::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })?;
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), CaptureError> {
        self.driver.dispatch(x, y, z)?;
        self.record(ApiCall::Dispatch {
            group_count_x: x,
            group_count_y: y,
            group_count_z: z,
        })?;
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: Vec<SerializedBufferCopy>,
    ) -> Result<(), CaptureError> {
        self.driver.copy_buffer(src, dst, &regions)?;
        let src_id = self.id_for(src);
        let dst_id = self.id_for(dst);
        if !src_id.is_null() && !dst_id.is_null() {
            self.record(ApiCall::CopyBuffer {
                src: src_id,
                dst: dst_id,
                regions,
            })?;
        }
        // Outside a frame capture the copy leaves no chunk, so the
        // destination's record no longer matches its live contents
        if !self.mode.is_capturing_frame() && !dst_id.is_null() {
            self.resources.mark_dirty(dst_id);
        }
        Ok(())
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: Vec<SerializedBufferImageCopy>,
    ) -> Result<(), CaptureError> {
        self.driver.copy_buffer_to_image(src, dst, &regions)?;
        let src_id = self.id_for(src);
        let dst_id = self.id_for(dst);
        if !src_id.is_null() && !dst_id.is_null() {
            self.record(ApiCall::CopyBufferToImage {
                src: src_id,
                dst: dst_id,
                regions,
            })?;
        }
        if !self.mode.is_capturing_frame() && !dst_id.is_null() {
            self.resources.mark_dirty(dst_id);
        }
        Ok(())
    }

    pub fn clear_attachments(
        &mut self,
        clear_value: SerializedClearValue,
        rect: SerializedRect2D,
    ) -> Result<(), CaptureError> {
        self.driver.clear_attachments(&clear_value, &rect)?;
        self.record(ApiCall::ClearAttachments { clear_value, rect })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_core::{CaptureSettings, SoftwareDriver};

    fn ctx() -> CaptureContext<SoftwareDriver> {
        CaptureContext::new(SoftwareDriver::new(), CaptureSettings::default())
    }

    fn rgba8_image(w: u32, h: u32) -> SerializedImageCreateInfo {
        SerializedImageCreateInfo {
            flags: 0,
            image_type: 1,
            format: 37,
            extent: [w, h, 1],
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            tiling: 0,
            usage: 0,
            initial_layout: 0,
        }
    }

    #[test]
    fn creation_is_recorded_outside_frame_capture() {
        let mut ctx = ctx();
        let handle = ctx
            .create_buffer(SerializedBufferCreateInfo {
                size: 16,
                usage: 0,
                sharing_mode: 0,
            })
            .unwrap();
        let id = ctx.resources().get_id(handle).unwrap();
        assert_eq!(ctx.resources().initial_chunks(id).unwrap().len(), 1);
    }

    #[test]
    fn draws_only_recorded_during_frame_capture() {
        let mut ctx = ctx();
        ctx.draw(3, 1, 0, 0).unwrap();
        assert!(!ctx.has_successful_capture());

        ctx.begin_capture_frame().unwrap();
        ctx.draw(3, 1, 0, 0).unwrap();
        ctx.end_capture_frame().unwrap();

        let capture = ctx.capture().unwrap();
        let draws = capture
            .frame_chunks
            .iter()
            .filter(|c| matches!(c.call, ApiCall::Draw { .. }))
            .count();
        assert_eq!(draws, 1);
        // Driver saw both draws regardless
        assert_eq!(ctx.driver_mut().draw_log().len(), 2);
    }

    #[test]
    fn redundant_pipeline_rebind_is_minimized() {
        let mut ctx = ctx();
        let module = ctx.create_shader_module(&[0u8; 8]).unwrap();
        let layout = ctx.create_pipeline_layout(&[], vec![]).unwrap();
        let rp = ctx
            .create_render_pass(SerializedRenderPassCreateInfo {
                color_attachments: vec![],
                depth_attachment: None,
            })
            .unwrap();
        let pipeline = ctx
            .create_graphics_pipeline(GraphicsPipelineDesc {
                stages: vec![(module, "main".to_string(), 1)],
                vertex_bindings: vec![],
                vertex_attributes: vec![],
                topology: 3,
                rasterization: SerializedRasterizationState {
                    polygon_mode: 0,
                    cull_mode: 0,
                    front_face: 0,
                    line_width: 1.0,
                },
                depth_stencil: None,
                color_write_mask: 0xF,
                layout,
                render_pass: rp,
                subpass: 0,
            })
            .unwrap();

        ctx.begin_capture_frame().unwrap();
        ctx.bind_pipeline(pipeline).unwrap();
        ctx.bind_pipeline(pipeline).unwrap(); // redundant
        ctx.end_capture_frame().unwrap();

        let capture = ctx.capture().unwrap();
        let binds = capture
            .frame_chunks
            .iter()
            .filter(|c| matches!(c.call, ApiCall::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 1);
        // Both reached the driver
        let driver_binds = ctx
            .driver_mut()
            .take_call_log()
            .into_iter()
            .filter(|c| *c == "bind_pipeline")
            .count();
        assert_eq!(driver_binds, 2);
    }

    #[test]
    fn transfer_buffer_upload_is_inlined_and_neutralized() {
        let mut ctx = ctx();
        let staging = ctx
            .create_buffer(SerializedBufferCreateInfo {
                size: 64,
                usage: 0,
                sharing_mode: 0,
            })
            .unwrap();
        ctx.update_buffer(staging, 0, &[0x5A; 64]).unwrap();
        let image = ctx.create_image(rgba8_image(4, 4)).unwrap();

        ctx.begin_capture_frame().unwrap();
        ctx.upload_texture(
            image,
            0,
            0,
            [0; 3],
            [4, 4, 1],
            TexelSource::TransferBuffer {
                buffer: staging,
                offset: 0,
                size: 64,
            },
        )
        .unwrap();
        ctx.end_capture_frame().unwrap();

        let capture = ctx.capture().unwrap();
        let upload = capture
            .frame_chunks
            .iter()
            .find_map(|c| match &c.call {
                ApiCall::UploadTexture {
                    data,
                    source_neutralized,
                    ..
                } => Some((data.clone(), *source_neutralized)),
                _ => None,
            })
            .expect("upload chunk");
        assert_eq!(upload.0, vec![0x5A; 64]);
        assert!(upload.1);
    }

    #[test]
    fn idle_copy_destination_snapshotted_into_initial_state() {
        let mut ctx = ctx();
        let staging = ctx
            .create_buffer(SerializedBufferCreateInfo {
                size: 16,
                usage: 0,
                sharing_mode: 0,
            })
            .unwrap();
        ctx.update_buffer(staging, 0, &[0x5A; 16]).unwrap();
        let vertex = ctx
            .create_buffer(SerializedBufferCreateInfo {
                size: 16,
                usage: 0,
                sharing_mode: 0,
            })
            .unwrap();
        // Copy outside any frame capture: no chunk is recorded, but the
        // destination must still replay with the copied contents
        ctx.copy_buffer(
            staging,
            vertex,
            vec![SerializedBufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 16,
            }],
        )
        .unwrap();

        ctx.begin_capture_frame().unwrap();
        ctx.end_capture_frame().unwrap();

        let vertex_id = ctx.resources().get_id(vertex).unwrap();
        let capture = ctx.capture().unwrap();
        let snapshot = capture
            .initial_chunks
            .iter()
            .find_map(|c| match &c.call {
                ApiCall::UpdateBuffer { buffer, data, .. } if *buffer == vertex_id => {
                    Some(data.clone())
                }
                _ => None,
            })
            .expect("destination snapshot in initial state");
        assert_eq!(snapshot, vec![0x5A; 16]);
    }

    #[test]
    fn bound_descriptor_state_reestablished_at_frame_head() {
        let mut ctx = ctx();
        let dsl = ctx.create_descriptor_set_layout(vec![]).unwrap();
        let layout = ctx.create_pipeline_layout(&[dsl], vec![]).unwrap();
        let set = ctx.create_descriptor_set(dsl).unwrap();
        ctx.bind_descriptor_sets(layout, 0, &[set], &[16]).unwrap();

        ctx.begin_capture_frame().unwrap();
        ctx.end_capture_frame().unwrap();

        let set_id = ctx.resources().get_id(set).unwrap();
        let capture = ctx.capture().unwrap();
        let offsets = capture
            .frame_chunks
            .iter()
            .find_map(|c| match &c.call {
                ApiCall::BindDescriptorSets {
                    sets,
                    dynamic_offsets,
                    ..
                } if sets.contains(&set_id) => Some(dynamic_offsets.clone()),
                _ => None,
            })
            .expect("descriptor bind re-established");
        assert_eq!(offsets, vec![16]);
    }

    #[test]
    fn attempt_capture_triggers_at_frame_boundary() {
        let mut ctx = ctx();
        ctx.attempt_capture();
        assert_eq!(ctx.mode(), Mode::WritingIdle);

        ctx.end_frame().unwrap(); // opens the capture
        assert_eq!(ctx.mode(), Mode::WritingCaptureFrame);
        ctx.draw(3, 1, 0, 0).unwrap();
        ctx.end_frame().unwrap(); // closes it
        assert_eq!(ctx.mode(), Mode::WritingIdle);
        assert!(ctx.has_successful_capture());
    }

    #[test]
    fn unimplemented_call_marks_capture_incomplete() {
        let mut ctx = ctx();
        ctx.begin_capture_frame().unwrap();
        ctx.note_unimplemented("SomeVendorExtensionCall");
        ctx.end_capture_frame().unwrap();
        assert!(ctx.capture().unwrap().header.incomplete);
    }

    #[test]
    fn dirty_resource_refetched_wholesale_at_capture_start() {
        let mut ctx = CaptureContext::new(
            SoftwareDriver::new(),
            CaptureSettings {
                parameter_dirty_threshold: 12,
                upload_dirty_threshold: 2,
            },
        );
        let image = ctx.create_image(rgba8_image(2, 2)).unwrap();
        for fill in 0..5u8 {
            ctx.upload_texture(
                image,
                0,
                0,
                [0; 3],
                [2, 2, 1],
                TexelSource::Inline(&[fill; 16]),
            )
            .unwrap();
        }

        ctx.begin_capture_frame().unwrap();
        ctx.end_capture_frame().unwrap();

        let capture = ctx.capture().unwrap();
        // Creation + 2 recorded uploads were collapsed to creation + one
        // wholesale snapshot carrying the latest contents
        let uploads: Vec<_> = capture
            .initial_chunks
            .iter()
            .filter_map(|c| match &c.call {
                ApiCall::UploadTexture {
                    data,
                    source_neutralized,
                    ..
                } => Some((data.clone(), *source_neutralized)),
                _ => None,
            })
            .collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, vec![4u8; 16]);
        assert!(uploads[0].1);
    }
}
