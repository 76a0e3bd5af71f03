use serde::{Deserialize, Serialize};

use crate::resource::{ResourceId, ResourceType};
use crate::types::*;

/// One intercepted API call, with driver handles already translated to
/// stable [`ResourceId`]s. One variant per intercepted entry point.
///
/// This is the payload of a [`Chunk`]; the variant tag doubles as the
/// chunk-type tag in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ApiCall {
    // ── Resource creation ───────────────────────────────────
    CreateBuffer {
        id: ResourceId,
        info: SerializedBufferCreateInfo,
    },
    CreateImage {
        id: ResourceId,
        info: SerializedImageCreateInfo,
    },
    CreateImageView {
        id: ResourceId,
        info: SerializedImageViewCreateInfo,
    },
    CreateSampler {
        id: ResourceId,
        info: SerializedSamplerCreateInfo,
    },
    CreateShaderModule {
        id: ResourceId,
        /// SPIR-V word stream as raw bytes.
        code: Vec<u8>,
    },
    CreatePipelineLayout {
        id: ResourceId,
        set_layouts: Vec<ResourceId>,
        push_constant_ranges: Vec<SerializedPushConstantRange>,
    },
    CreateDescriptorSetLayout {
        id: ResourceId,
        bindings: Vec<SerializedDescriptorSetLayoutBinding>,
    },
    CreateDescriptorSet {
        id: ResourceId,
        layout: ResourceId,
    },
    CreateGraphicsPipeline {
        id: ResourceId,
        info: SerializedGraphicsPipelineCreateInfo,
    },
    CreateRenderPass {
        id: ResourceId,
        info: SerializedRenderPassCreateInfo,
    },
    CreateFramebuffer {
        id: ResourceId,
        info: SerializedFramebufferCreateInfo,
    },
    CreateFence {
        id: ResourceId,
        signaled: bool,
    },

    // ── Resource destruction ────────────────────────────────
    DestroyResource {
        id: ResourceId,
        resource_type: ResourceType,
    },

    // ── Resource updates ────────────────────────────────────
    UpdateBuffer {
        buffer: ResourceId,
        offset: u64,
        data: Vec<u8>,
    },
    /// Texture upload with the payload always inline. If the application
    /// sourced the upload from a bound transfer buffer, capture fetches the
    /// bytes and records them here with `source_neutralized` set, so replay
    /// never depends on transfer-buffer bindings that are not part of this
    /// call's own arguments.
    UploadTexture {
        image: ResourceId,
        mip_level: u32,
        array_layer: u32,
        offset: [i32; 3],
        extent: [u32; 3],
        data: Vec<u8>,
        source_neutralized: bool,
    },
    SetTextureParameter {
        image: ResourceId,
        parameter: u32,
        value: i32,
    },
    UpdateDescriptorSets {
        writes: Vec<SerializedDescriptorWrite>,
    },

    // ── State setting ───────────────────────────────────────
    BindPipeline {
        pipeline: ResourceId,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<ResourceId>,
        offsets: Vec<u64>,
    },
    BindIndexBuffer {
        buffer: ResourceId,
        offset: u64,
        index_type: u32,
    },
    BindDescriptorSets {
        layout: ResourceId,
        first_set: u32,
        sets: Vec<ResourceId>,
        dynamic_offsets: Vec<u32>,
    },
    SetViewport {
        viewport: SerializedViewport,
    },
    SetScissor {
        scissor: SerializedRect2D,
    },

    // ── Scopes ──────────────────────────────────────────────
    BeginRenderPass {
        render_pass: ResourceId,
        framebuffer: ResourceId,
        render_area: SerializedRect2D,
        clear_values: Vec<SerializedClearValue>,
    },
    EndRenderPass,
    BeginDebugLabel {
        label: String,
    },
    EndDebugLabel,

    // ── Actions ─────────────────────────────────────────────
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    CopyBuffer {
        src: ResourceId,
        dst: ResourceId,
        regions: Vec<SerializedBufferCopy>,
    },
    CopyBufferToImage {
        src: ResourceId,
        dst: ResourceId,
        regions: Vec<SerializedBufferImageCopy>,
    },
    ClearAttachments {
        clear_value: SerializedClearValue,
        rect: SerializedRect2D,
    },

    // ── Frame markers ───────────────────────────────────────
    EndOfFrame,
}

/// Broad behavioral class of a call, used by the interception policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallClass {
    /// Creates a driver object; always recorded to the resource record.
    Creation,
    /// Destroys a driver object.
    Destroy,
    /// Mutates resource contents or parameters; subject to dirty diversion.
    ResourceUpdate,
    /// Changes bound state without issuing GPU work.
    StateSet,
    /// Opens or closes a nesting scope (render pass, debug label).
    Scope,
    /// Issues GPU work; produces a Drawcall on replay.
    Action,
    /// Frame boundary marker.
    Marker,
}

impl ApiCall {
    /// Static entry-point name, as shown in event listings.
    pub fn name(&self) -> &'static str {
        match self {
            ApiCall::CreateBuffer { .. } => "CreateBuffer",
            ApiCall::CreateImage { .. } => "CreateImage",
            ApiCall::CreateImageView { .. } => "CreateImageView",
            ApiCall::CreateSampler { .. } => "CreateSampler",
            ApiCall::CreateShaderModule { .. } => "CreateShaderModule",
            ApiCall::CreatePipelineLayout { .. } => "CreatePipelineLayout",
            ApiCall::CreateDescriptorSetLayout { .. } => "CreateDescriptorSetLayout",
            ApiCall::CreateDescriptorSet { .. } => "CreateDescriptorSet",
            ApiCall::CreateGraphicsPipeline { .. } => "CreateGraphicsPipeline",
            ApiCall::CreateRenderPass { .. } => "CreateRenderPass",
            ApiCall::CreateFramebuffer { .. } => "CreateFramebuffer",
            ApiCall::CreateFence { .. } => "CreateFence",
            ApiCall::DestroyResource { .. } => "DestroyResource",
            ApiCall::UpdateBuffer { .. } => "UpdateBuffer",
            ApiCall::UploadTexture { .. } => "UploadTexture",
            ApiCall::SetTextureParameter { .. } => "SetTextureParameter",
            ApiCall::UpdateDescriptorSets { .. } => "UpdateDescriptorSets",
            ApiCall::BindPipeline { .. } => "BindPipeline",
            ApiCall::BindVertexBuffers { .. } => "BindVertexBuffers",
            ApiCall::BindIndexBuffer { .. } => "BindIndexBuffer",
            ApiCall::BindDescriptorSets { .. } => "BindDescriptorSets",
            ApiCall::SetViewport { .. } => "SetViewport",
            ApiCall::SetScissor { .. } => "SetScissor",
            ApiCall::BeginRenderPass { .. } => "BeginRenderPass",
            ApiCall::EndRenderPass => "EndRenderPass",
            ApiCall::BeginDebugLabel { .. } => "BeginDebugLabel",
            ApiCall::EndDebugLabel => "EndDebugLabel",
            ApiCall::Draw { .. } => "Draw",
            ApiCall::DrawIndexed { .. } => "DrawIndexed",
            ApiCall::Dispatch { .. } => "Dispatch",
            ApiCall::CopyBuffer { .. } => "CopyBuffer",
            ApiCall::CopyBufferToImage { .. } => "CopyBufferToImage",
            ApiCall::ClearAttachments { .. } => "ClearAttachments",
            ApiCall::EndOfFrame => "EndOfFrame",
        }
    }

    pub fn class(&self) -> CallClass {
        match self {
            ApiCall::CreateBuffer { .. }
            | ApiCall::CreateImage { .. }
            | ApiCall::CreateImageView { .. }
            | ApiCall::CreateSampler { .. }
            | ApiCall::CreateShaderModule { .. }
            | ApiCall::CreatePipelineLayout { .. }
            | ApiCall::CreateDescriptorSetLayout { .. }
            | ApiCall::CreateDescriptorSet { .. }
            | ApiCall::CreateGraphicsPipeline { .. }
            | ApiCall::CreateRenderPass { .. }
            | ApiCall::CreateFramebuffer { .. }
            | ApiCall::CreateFence { .. } => CallClass::Creation,
            ApiCall::DestroyResource { .. } => CallClass::Destroy,
            ApiCall::UpdateBuffer { .. }
            | ApiCall::UploadTexture { .. }
            | ApiCall::SetTextureParameter { .. }
            | ApiCall::UpdateDescriptorSets { .. } => CallClass::ResourceUpdate,
            ApiCall::BindPipeline { .. }
            | ApiCall::BindVertexBuffers { .. }
            | ApiCall::BindIndexBuffer { .. }
            | ApiCall::BindDescriptorSets { .. }
            | ApiCall::SetViewport { .. }
            | ApiCall::SetScissor { .. } => CallClass::StateSet,
            ApiCall::BeginRenderPass { .. }
            | ApiCall::EndRenderPass
            | ApiCall::BeginDebugLabel { .. }
            | ApiCall::EndDebugLabel => CallClass::Scope,
            ApiCall::Draw { .. }
            | ApiCall::DrawIndexed { .. }
            | ApiCall::Dispatch { .. }
            | ApiCall::CopyBuffer { .. }
            | ApiCall::CopyBufferToImage { .. }
            | ApiCall::ClearAttachments { .. } => CallClass::Action,
            ApiCall::EndOfFrame => CallClass::Marker,
        }
    }

    /// True for calls that open a nesting scope in the drawcall tree.
    pub fn opens_scope(&self) -> bool {
        matches!(
            self,
            ApiCall::BeginRenderPass { .. } | ApiCall::BeginDebugLabel { .. }
        )
    }

    /// True for calls that close a nesting scope.
    pub fn closes_scope(&self) -> bool {
        matches!(self, ApiCall::EndRenderPass | ApiCall::EndDebugLabel)
    }

    /// Human-readable command description shown in the event browser.
    /// Purely informational: replay correctness must not depend on it.
    pub fn describe(&self) -> String {
        match self {
            ApiCall::Draw {
                vertex_count,
                instance_count,
                ..
            } => format!("Draw({vertex_count}, {instance_count})"),
            ApiCall::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => format!("DrawIndexed({index_count}, {instance_count})"),
            ApiCall::Dispatch {
                group_count_x,
                group_count_y,
                group_count_z,
            } => format!("Dispatch({group_count_x}, {group_count_y}, {group_count_z})"),
            ApiCall::CopyBuffer { src, dst, regions } => {
                format!("CopyBuffer({src} -> {dst}, {} regions)", regions.len())
            }
            ApiCall::CopyBufferToImage { src, dst, regions } => {
                format!("CopyBufferToImage({src} -> {dst}, {} regions)", regions.len())
            }
            ApiCall::ClearAttachments { rect, .. } => format!(
                "ClearAttachments({}x{})",
                rect.extent[0], rect.extent[1]
            ),
            ApiCall::BeginRenderPass {
                render_pass,
                framebuffer,
                ..
            } => format!("BeginRenderPass({render_pass}, {framebuffer})"),
            ApiCall::BindPipeline { pipeline } => format!("BindPipeline({pipeline})"),
            ApiCall::BeginDebugLabel { label } => format!("BeginDebugLabel({label:?})"),
            other => other.name().to_string(),
        }
    }

    /// Every ResourceId this call references, in argument order.
    /// Used for referential-integrity checks and destroy retention.
    pub fn referenced_ids(&self) -> Vec<ResourceId> {
        let mut ids = Vec::new();
        match self {
            ApiCall::CreateBuffer { id, .. }
            | ApiCall::CreateImage { id, .. }
            | ApiCall::CreateSampler { id, .. }
            | ApiCall::CreateShaderModule { id, .. }
            | ApiCall::CreateDescriptorSetLayout { id, .. }
            | ApiCall::CreateRenderPass { id, .. }
            | ApiCall::CreateFence { id, .. }
            | ApiCall::DestroyResource { id, .. } => ids.push(*id),
            ApiCall::CreateImageView { id, info } => {
                ids.push(*id);
                ids.push(info.image);
            }
            ApiCall::CreatePipelineLayout {
                id, set_layouts, ..
            } => {
                ids.push(*id);
                ids.extend(set_layouts.iter().copied());
            }
            ApiCall::CreateDescriptorSet { id, layout } => {
                ids.push(*id);
                ids.push(*layout);
            }
            ApiCall::CreateGraphicsPipeline { id, info } => {
                ids.push(*id);
                ids.extend(info.stages.iter().map(|s| s.module));
                ids.push(info.layout);
                ids.push(info.render_pass);
            }
            ApiCall::CreateFramebuffer { id, info } => {
                ids.push(*id);
                ids.push(info.render_pass);
                ids.extend(info.attachments.iter().copied());
            }
            ApiCall::UpdateBuffer { buffer, .. } => ids.push(*buffer),
            ApiCall::UploadTexture { image, .. }
            | ApiCall::SetTextureParameter { image, .. } => ids.push(*image),
            ApiCall::UpdateDescriptorSets { writes } => {
                for w in writes {
                    ids.push(w.dst_set);
                    ids.extend(w.buffers.iter().map(|b| b.buffer));
                    for img in &w.images {
                        ids.push(img.sampler);
                        ids.push(img.image_view);
                    }
                }
            }
            ApiCall::BindPipeline { pipeline } => ids.push(*pipeline),
            ApiCall::BindVertexBuffers { buffers, .. } => {
                ids.extend(buffers.iter().copied())
            }
            ApiCall::BindIndexBuffer { buffer, .. } => ids.push(*buffer),
            ApiCall::BindDescriptorSets { layout, sets, .. } => {
                ids.push(*layout);
                ids.extend(sets.iter().copied());
            }
            ApiCall::BeginRenderPass {
                render_pass,
                framebuffer,
                ..
            } => {
                ids.push(*render_pass);
                ids.push(*framebuffer);
            }
            ApiCall::CopyBuffer { src, dst, .. }
            | ApiCall::CopyBufferToImage { src, dst, .. } => {
                ids.push(*src);
                ids.push(*dst);
            }
            ApiCall::SetViewport { .. }
            | ApiCall::SetScissor { .. }
            | ApiCall::EndRenderPass
            | ApiCall::BeginDebugLabel { .. }
            | ApiCall::EndDebugLabel
            | ApiCall::Draw { .. }
            | ApiCall::DrawIndexed { .. }
            | ApiCall::Dispatch { .. }
            | ApiCall::ClearAttachments { .. }
            | ApiCall::EndOfFrame => {}
        }
        ids.retain(|id| !id.is_null());
        ids
    }

    /// The ID created by this call, if it is a creation call.
    pub fn created_id(&self) -> Option<(ResourceId, ResourceType)> {
        match self {
            ApiCall::CreateBuffer { id, .. } => Some((*id, ResourceType::Buffer)),
            ApiCall::CreateImage { id, .. } => Some((*id, ResourceType::Image)),
            ApiCall::CreateImageView { id, .. } => Some((*id, ResourceType::ImageView)),
            ApiCall::CreateSampler { id, .. } => Some((*id, ResourceType::Sampler)),
            ApiCall::CreateShaderModule { id, .. } => {
                Some((*id, ResourceType::ShaderModule))
            }
            ApiCall::CreatePipelineLayout { id, .. } => {
                Some((*id, ResourceType::PipelineLayout))
            }
            ApiCall::CreateDescriptorSetLayout { id, .. } => {
                Some((*id, ResourceType::DescriptorSetLayout))
            }
            ApiCall::CreateDescriptorSet { id, .. } => {
                Some((*id, ResourceType::DescriptorSet))
            }
            ApiCall::CreateGraphicsPipeline { id, .. } => {
                Some((*id, ResourceType::Pipeline))
            }
            ApiCall::CreateRenderPass { id, .. } => Some((*id, ResourceType::RenderPass)),
            ApiCall::CreateFramebuffer { id, .. } => {
                Some((*id, ResourceType::Framebuffer))
            }
            ApiCall::CreateFence { id, .. } => Some((*id, ResourceType::Fence)),
            _ => None,
        }
    }
}

/// One serialized, replayable unit of recorded API call data.
/// Immutable once finalized; owned by exactly one chunk list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Chunk {
    pub call: ApiCall,
    /// Optional debug string attached by the application at record time.
    pub debug_label: Option<String>,
}

impl Chunk {
    pub fn new(call: ApiCall) -> Self {
        Self {
            call,
            debug_label: None,
        }
    }

    pub fn with_label(call: ApiCall, label: impl Into<String>) -> Self {
        Self {
            call,
            debug_label: Some(label.into()),
        }
    }
}
