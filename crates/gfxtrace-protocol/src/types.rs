use serde::{Deserialize, Serialize};

use crate::resource::ResourceId;

// Serialized state structs. Plain integer fields so the stream stays
// portable across driver versions; enums from the native API travel as
// their raw values.

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedRect2D {
    pub offset: [i32; 2],
    pub extent: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedBufferCreateInfo {
    pub size: u64,
    pub usage: u32,
    pub sharing_mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedImageCreateInfo {
    pub flags: u32,
    pub image_type: i32,
    pub format: i32,
    pub extent: [u32; 3],
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: i32,
    pub usage: u32,
    pub initial_layout: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedImageSubresourceRange {
    pub aspect_mask: u32,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedImageViewCreateInfo {
    pub image: ResourceId,
    pub view_type: i32,
    pub format: i32,
    pub subresource_range: SerializedImageSubresourceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedSamplerCreateInfo {
    pub mag_filter: i32,
    pub min_filter: i32,
    pub mipmap_mode: i32,
    pub address_mode_u: i32,
    pub address_mode_v: i32,
    pub address_mode_w: i32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedAttachmentDescription {
    pub format: i32,
    pub samples: u32,
    pub load_op: i32,
    pub store_op: i32,
    pub initial_layout: i32,
    pub final_layout: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedRenderPassCreateInfo {
    pub color_attachments: Vec<SerializedAttachmentDescription>,
    pub depth_attachment: Option<SerializedAttachmentDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedFramebufferCreateInfo {
    pub render_pass: ResourceId,
    pub attachments: Vec<ResourceId>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedDescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: i32,
    pub descriptor_count: u32,
    pub stage_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedPushConstantRange {
    pub stage_flags: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedShaderStage {
    pub module: ResourceId,
    pub entry_point: String,
    pub stage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedVertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedVertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: i32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedRasterizationState {
    pub polygon_mode: i32,
    pub cull_mode: u32,
    pub front_face: i32,
    pub line_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedDepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedGraphicsPipelineCreateInfo {
    pub stages: Vec<SerializedShaderStage>,
    pub vertex_bindings: Vec<SerializedVertexBinding>,
    pub vertex_attributes: Vec<SerializedVertexAttribute>,
    pub topology: i32,
    pub rasterization: SerializedRasterizationState,
    pub depth_stencil: Option<SerializedDepthStencilState>,
    pub color_write_mask: u32,
    pub layout: ResourceId,
    pub render_pass: ResourceId,
    pub subpass: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedDescriptorWrite {
    pub dst_set: ResourceId,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: i32,
    pub buffers: Vec<SerializedDescriptorBufferInfo>,
    pub images: Vec<SerializedDescriptorImageInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedDescriptorBufferInfo {
    pub buffer: ResourceId,
    pub offset: u64,
    pub range: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedDescriptorImageInfo {
    pub sampler: ResourceId,
    pub image_view: ResourceId,
    pub image_layout: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedBufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedBufferImageCopy {
    pub buffer_offset: u64,
    pub buffer_row_length: u32,
    pub image_offset: [i32; 3],
    pub image_extent: [u32; 3],
    pub mip_level: u32,
    pub array_layer: u32,
}

/// Raw clear value, reinterpreted per attachment format at replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
         bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct SerializedClearValue {
    pub data: [u8; 16],
}

impl SerializedClearValue {
    pub fn from_color(rgba: [f32; 4]) -> Self {
        Self {
            data: bytemuck::cast(rgba),
        }
    }

    pub fn as_color(&self) -> [f32; 4] {
        bytemuck::cast(self.data)
    }

    pub fn from_depth(depth: f32) -> Self {
        let mut data = [0u8; 16];
        data[..4].copy_from_slice(&depth.to_le_bytes());
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_infos_compare_by_float_fields() {
        let a = SerializedSamplerCreateInfo {
            mag_filter: 0,
            min_filter: 0,
            mipmap_mode: 0,
            address_mode_u: 0,
            address_mode_v: 0,
            address_mode_w: 0,
            anisotropy_enable: true,
            max_anisotropy: 16.0,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.max_anisotropy = 8.0;
        assert_ne!(a, b);
    }
}
