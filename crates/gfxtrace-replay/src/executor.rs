//! Chunk execution: one recorded call in, one driver call out.
//!
//! Creation chunks establish ID -> live-handle mappings; every other chunk
//! resolves its IDs through the live table before reaching the driver. A
//! missing live mapping means the capture is corrupt or out of order and
//! aborts the replay attempt.

use tracing::{debug, warn};

use gfxtrace_core::driver::ResolvedDescriptorWrite;
use gfxtrace_core::{ReplayDriver, ResourceManager};
use gfxtrace_protocol::{ApiCall, RawHandle, ResourceId};

use crate::error::ReplayError;

pub struct ChunkExecutor<'a, D: ReplayDriver> {
    driver: &'a mut D,
    resources: &'a ResourceManager,
}

impl<'a, D: ReplayDriver> ChunkExecutor<'a, D> {
    pub fn new(driver: &'a mut D, resources: &'a ResourceManager) -> Self {
        Self { driver, resources }
    }

    fn live(&self, id: ResourceId) -> Result<RawHandle, ReplayError> {
        Ok(self.resources.get_live_resource(id)?)
    }

    /// NULL is a legal "nothing bound" value in descriptor payloads.
    fn live_or_null(&self, id: ResourceId) -> Result<RawHandle, ReplayError> {
        if id.is_null() {
            return Ok(0);
        }
        self.live(id)
    }

    fn register(&self, id: ResourceId, handle: RawHandle) {
        debug!(%id, handle, "replay recreated resource");
        self.resources.add_live_resource(id, handle);
    }

    /// Re-issue one recorded call against the live driver.
    pub fn execute(&mut self, call: &ApiCall) -> Result<(), ReplayError> {
        match call {
            // ── Creation: recreate and map ID -> live handle ────
            ApiCall::CreateBuffer { id, info } => {
                let handle = self.driver.create_buffer(info)?;
                self.register(*id, handle);
            }
            ApiCall::CreateImage { id, info } => {
                let handle = self.driver.create_image(info)?;
                self.register(*id, handle);
            }
            ApiCall::CreateImageView { id, info } => {
                let image = self.live(info.image)?;
                let handle = self.driver.create_image_view(image, info)?;
                self.register(*id, handle);
            }
            ApiCall::CreateSampler { id, info } => {
                let handle = self.driver.create_sampler(info)?;
                self.register(*id, handle);
            }
            ApiCall::CreateShaderModule { id, code } => {
                let handle = self.driver.create_shader_module(code)?;
                self.register(*id, handle);
            }
            ApiCall::CreatePipelineLayout {
                id,
                set_layouts,
                push_constant_ranges,
            } => {
                let layouts = set_layouts
                    .iter()
                    .map(|l| self.live(*l))
                    .collect::<Result<Vec<_>, _>>()?;
                let handle = self
                    .driver
                    .create_pipeline_layout(&layouts, push_constant_ranges)?;
                self.register(*id, handle);
            }
            ApiCall::CreateDescriptorSetLayout { id, bindings } => {
                let handle = self.driver.create_descriptor_set_layout(bindings)?;
                self.register(*id, handle);
            }
            ApiCall::CreateDescriptorSet { id, layout } => {
                let layout = self.live(*layout)?;
                let handle = self.driver.create_descriptor_set(layout)?;
                self.register(*id, handle);
            }
            ApiCall::CreateGraphicsPipeline { id, info } => {
                let stage_modules = info
                    .stages
                    .iter()
                    .map(|s| self.live(s.module))
                    .collect::<Result<Vec<_>, _>>()?;
                let layout = self.live(info.layout)?;
                let render_pass = self.live(info.render_pass)?;
                let handle = self.driver.create_graphics_pipeline(
                    info,
                    &stage_modules,
                    layout,
                    render_pass,
                )?;
                self.register(*id, handle);
            }
            ApiCall::CreateRenderPass { id, info } => {
                let handle = self.driver.create_render_pass(info)?;
                self.register(*id, handle);
            }
            ApiCall::CreateFramebuffer { id, info } => {
                let render_pass = self.live(info.render_pass)?;
                let attachments = info
                    .attachments
                    .iter()
                    .map(|a| self.live(*a))
                    .collect::<Result<Vec<_>, _>>()?;
                let handle = self.driver.create_framebuffer(
                    render_pass,
                    &attachments,
                    info.width,
                    info.height,
                    info.layers,
                )?;
                self.register(*id, handle);
            }
            ApiCall::CreateFence { id, signaled } => {
                let handle = self.driver.create_fence(*signaled)?;
                self.register(*id, handle);
            }

            // ── Destruction ─────────────────────────────────────
            ApiCall::DestroyResource { id, resource_type } => {
                match self.resources.remove_live_resource(*id) {
                    Some(handle) => self.driver.destroy_resource(handle, *resource_type)?,
                    // Already gone, e.g. destroyed twice in a damaged capture
                    None => warn!(%id, "destroy for resource with no live handle"),
                }
            }

            // ── Updates ─────────────────────────────────────────
            ApiCall::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                let buffer = self.live(*buffer)?;
                self.driver.update_buffer(buffer, *offset, data)?;
            }
            ApiCall::UploadTexture {
                image,
                mip_level,
                array_layer,
                offset,
                extent,
                data,
                source_neutralized: _,
            } => {
                let image = self.live(*image)?;
                self.driver
                    .upload_texture(image, *mip_level, *array_layer, *offset, *extent, data)?;
            }
            ApiCall::SetTextureParameter {
                image,
                parameter,
                value,
            } => {
                let image = self.live(*image)?;
                self.driver.set_texture_parameter(image, *parameter, *value)?;
            }
            ApiCall::UpdateDescriptorSets { writes } => {
                let resolved = writes
                    .iter()
                    .map(|w| {
                        Ok(ResolvedDescriptorWrite {
                            dst_set: self.live(w.dst_set)?,
                            dst_binding: w.dst_binding,
                            dst_array_element: w.dst_array_element,
                            descriptor_type: w.descriptor_type,
                            buffers: w
                                .buffers
                                .iter()
                                .map(|b| Ok((self.live(b.buffer)?, b.offset, b.range)))
                                .collect::<Result<Vec<_>, ReplayError>>()?,
                            images: w
                                .images
                                .iter()
                                .map(|i| {
                                    Ok((
                                        self.live_or_null(i.sampler)?,
                                        self.live(i.image_view)?,
                                        i.image_layout,
                                    ))
                                })
                                .collect::<Result<Vec<_>, ReplayError>>()?,
                        })
                    })
                    .collect::<Result<Vec<_>, ReplayError>>()?;
                self.driver.update_descriptor_sets(&resolved)?;
            }

            // ── State setting ───────────────────────────────────
            ApiCall::BindPipeline { pipeline } => {
                let pipeline = self.live(*pipeline)?;
                self.driver.bind_pipeline(pipeline)?;
            }
            ApiCall::BindVertexBuffers {
                first_binding,
                buffers,
                offsets,
            } => {
                let handles = buffers
                    .iter()
                    .map(|b| self.live(*b))
                    .collect::<Result<Vec<_>, _>>()?;
                self.driver
                    .bind_vertex_buffers(*first_binding, &handles, offsets)?;
            }
            ApiCall::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                let buffer = self.live(*buffer)?;
                self.driver.bind_index_buffer(buffer, *offset, *index_type)?;
            }
            ApiCall::BindDescriptorSets {
                layout,
                first_set,
                sets,
                dynamic_offsets,
            } => {
                let layout = self.live(*layout)?;
                let handles = sets
                    .iter()
                    .map(|s| self.live(*s))
                    .collect::<Result<Vec<_>, _>>()?;
                self.driver
                    .bind_descriptor_sets(layout, *first_set, &handles, dynamic_offsets)?;
            }
            ApiCall::SetViewport { viewport } => self.driver.set_viewport(viewport)?,
            ApiCall::SetScissor { scissor } => self.driver.set_scissor(scissor)?,

            // ── Scopes ──────────────────────────────────────────
            ApiCall::BeginRenderPass {
                render_pass,
                framebuffer,
                render_area,
                clear_values,
            } => {
                let render_pass = self.live(*render_pass)?;
                let framebuffer = self.live(*framebuffer)?;
                self.driver
                    .begin_render_pass(render_pass, framebuffer, render_area, clear_values)?;
            }
            ApiCall::EndRenderPass => self.driver.end_render_pass()?,
            ApiCall::BeginDebugLabel { label } => self.driver.begin_debug_label(label)?,
            ApiCall::EndDebugLabel => self.driver.end_debug_label()?,

            // ── Actions ─────────────────────────────────────────
            ApiCall::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => self
                .driver
                .draw(*vertex_count, *instance_count, *first_vertex, *first_instance)?,
            ApiCall::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => self.driver.draw_indexed(
                *index_count,
                *instance_count,
                *first_index,
                *vertex_offset,
                *first_instance,
            )?,
            ApiCall::Dispatch {
                group_count_x,
                group_count_y,
                group_count_z,
            } => self
                .driver
                .dispatch(*group_count_x, *group_count_y, *group_count_z)?,
            ApiCall::CopyBuffer { src, dst, regions } => {
                let src = self.live(*src)?;
                let dst = self.live(*dst)?;
                self.driver.copy_buffer(src, dst, regions)?;
            }
            ApiCall::CopyBufferToImage { src, dst, regions } => {
                let src = self.live(*src)?;
                let dst = self.live(*dst)?;
                self.driver.copy_buffer_to_image(src, dst, regions)?;
            }
            ApiCall::ClearAttachments { clear_value, rect } => {
                self.driver.clear_attachments(clear_value, rect)?;
            }

            // The frame marker carries no work
            ApiCall::EndOfFrame => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_core::{CaptureSettings, CoreError, SoftwareDriver};
    use gfxtrace_protocol::types::SerializedBufferCreateInfo;

    #[test]
    fn creation_establishes_live_mapping() {
        let mut driver = SoftwareDriver::new();
        let resources = ResourceManager::new(CaptureSettings::default());
        let mut executor = ChunkExecutor::new(&mut driver, &resources);

        executor
            .execute(&ApiCall::CreateBuffer {
                id: ResourceId(7),
                info: SerializedBufferCreateInfo {
                    size: 16,
                    usage: 0,
                    sharing_mode: 0,
                },
            })
            .unwrap();
        let live = resources.get_live_resource(ResourceId(7)).unwrap();
        assert!(driver.buffer_contents(live).is_some());
    }

    #[test]
    fn unresolvable_reference_aborts() {
        let mut driver = SoftwareDriver::new();
        let resources = ResourceManager::new(CaptureSettings::default());
        let mut executor = ChunkExecutor::new(&mut driver, &resources);

        let err = executor
            .execute(&ApiCall::UpdateBuffer {
                buffer: ResourceId(42),
                offset: 0,
                data: vec![1, 2, 3],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Core(CoreError::UnresolvableId(ResourceId(42)))
        ));
    }
}
