use gfxtrace_protocol::types::*;
use gfxtrace_protocol::{RawHandle, ResourceType};

/// Failures from the underlying driver. During replay these are escalated
/// immediately: replay cannot continue past a resource that failed to
/// recreate.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver call {call} failed: {detail}")]
    CallFailed { call: &'static str, detail: String },

    #[error("invalid handle {handle:#x} passed to {call}")]
    InvalidHandle { call: &'static str, handle: RawHandle },

    #[error("out of memory in {call}")]
    OutOfMemory { call: &'static str },

    #[error("no driver support for {0}")]
    Unsupported(&'static str),
}

/// A descriptor write with all IDs resolved to driver handles.
#[derive(Debug, Clone)]
pub struct ResolvedDescriptorWrite {
    pub dst_set: RawHandle,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: i32,
    pub buffers: Vec<(RawHandle, u64, u64)>,
    pub images: Vec<(RawHandle, RawHandle, i32)>,
}

/// An auxiliary image read back from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 texels.
    pub data: Vec<u8>,
}

/// The capability table of real API entry points.
///
/// Both sides of the system sit on this seam: the interception layer always
/// forwards application calls here so behavior is unaffected, and the
/// replay machine re-issues recorded calls here with live handles. The
/// contract mirrors the native API one-to-one; implementations must not
/// reorder or coalesce calls.
///
/// All methods take `&mut self`: interception and replay are
/// single-threaded per context, with GPU-side parallelism owned by the
/// driver below this seam.
pub trait ReplayDriver {
    // ── Resource creation ───────────────────────────────────
    fn create_buffer(&mut self, info: &SerializedBufferCreateInfo)
        -> Result<RawHandle, DriverError>;
    fn create_image(&mut self, info: &SerializedImageCreateInfo)
        -> Result<RawHandle, DriverError>;
    fn create_image_view(
        &mut self,
        image: RawHandle,
        info: &SerializedImageViewCreateInfo,
    ) -> Result<RawHandle, DriverError>;
    fn create_sampler(&mut self, info: &SerializedSamplerCreateInfo)
        -> Result<RawHandle, DriverError>;
    fn create_shader_module(&mut self, code: &[u8]) -> Result<RawHandle, DriverError>;
    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[RawHandle],
        push_constant_ranges: &[SerializedPushConstantRange],
    ) -> Result<RawHandle, DriverError>;
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[SerializedDescriptorSetLayoutBinding],
    ) -> Result<RawHandle, DriverError>;
    fn create_descriptor_set(&mut self, layout: RawHandle) -> Result<RawHandle, DriverError>;
    fn create_graphics_pipeline(
        &mut self,
        info: &SerializedGraphicsPipelineCreateInfo,
        stage_modules: &[RawHandle],
        layout: RawHandle,
        render_pass: RawHandle,
    ) -> Result<RawHandle, DriverError>;
    fn create_render_pass(
        &mut self,
        info: &SerializedRenderPassCreateInfo,
    ) -> Result<RawHandle, DriverError>;
    fn create_framebuffer(
        &mut self,
        render_pass: RawHandle,
        attachments: &[RawHandle],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<RawHandle, DriverError>;
    fn create_fence(&mut self, signaled: bool) -> Result<RawHandle, DriverError>;
    fn destroy_resource(
        &mut self,
        handle: RawHandle,
        resource_type: ResourceType,
    ) -> Result<(), DriverError>;

    // ── Resource updates ────────────────────────────────────
    fn update_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError>;
    fn upload_texture(
        &mut self,
        image: RawHandle,
        mip_level: u32,
        array_layer: u32,
        offset: [i32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> Result<(), DriverError>;
    fn set_texture_parameter(
        &mut self,
        image: RawHandle,
        parameter: u32,
        value: i32,
    ) -> Result<(), DriverError>;
    fn update_descriptor_sets(
        &mut self,
        writes: &[ResolvedDescriptorWrite],
    ) -> Result<(), DriverError>;

    // ── State setting ───────────────────────────────────────
    fn bind_pipeline(&mut self, pipeline: RawHandle) -> Result<(), DriverError>;
    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[RawHandle],
        offsets: &[u64],
    ) -> Result<(), DriverError>;
    fn bind_index_buffer(
        &mut self,
        buffer: RawHandle,
        offset: u64,
        index_type: u32,
    ) -> Result<(), DriverError>;
    fn bind_descriptor_sets(
        &mut self,
        layout: RawHandle,
        first_set: u32,
        sets: &[RawHandle],
        dynamic_offsets: &[u32],
    ) -> Result<(), DriverError>;
    fn set_viewport(&mut self, viewport: &SerializedViewport) -> Result<(), DriverError>;
    fn set_scissor(&mut self, scissor: &SerializedRect2D) -> Result<(), DriverError>;

    // ── Scopes ──────────────────────────────────────────────
    fn begin_render_pass(
        &mut self,
        render_pass: RawHandle,
        framebuffer: RawHandle,
        render_area: &SerializedRect2D,
        clear_values: &[SerializedClearValue],
    ) -> Result<(), DriverError>;
    fn end_render_pass(&mut self) -> Result<(), DriverError>;
    fn begin_debug_label(&mut self, label: &str) -> Result<(), DriverError>;
    fn end_debug_label(&mut self) -> Result<(), DriverError>;

    // ── Actions ─────────────────────────────────────────────
    #[allow(clippy::too_many_arguments)]
    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), DriverError>;
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), DriverError>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DriverError>;
    fn copy_buffer(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferCopy],
    ) -> Result<(), DriverError>;
    fn copy_buffer_to_image(
        &mut self,
        src: RawHandle,
        dst: RawHandle,
        regions: &[SerializedBufferImageCopy],
    ) -> Result<(), DriverError>;
    fn clear_attachments(
        &mut self,
        clear_value: &SerializedClearValue,
        rect: &SerializedRect2D,
    ) -> Result<(), DriverError>;

    // ── Synchronization and readback ────────────────────────
    /// Submit all pending work and block until the GPU is drained.
    /// Overlay passes and readbacks insert these explicitly rather than
    /// relying on implicit ordering.
    fn wait_idle(&mut self) -> Result<(), DriverError>;
    fn read_back_buffer(&mut self, buffer: RawHandle) -> Result<Vec<u8>, DriverError>;
    fn read_back_texture(&mut self, image: RawHandle) -> Result<Vec<u8>, DriverError>;

    // ── Overlay support ─────────────────────────────────────
    /// Create an auxiliary color target sized to match an original target.
    fn create_overlay_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RawHandle, DriverError>;
    /// Read back the auxiliary target as RGBA8.
    fn read_overlay_target(&mut self, target: RawHandle)
        -> Result<ReadbackImage, DriverError>;
    /// Redirect subsequent draws to the auxiliary target, or back to the
    /// replayed framebuffer when `None`.
    fn set_overlay_target(&mut self, target: Option<RawHandle>) -> Result<(), DriverError>;

    /// Driver-visible state digest: bound objects plus a checksum of
    /// render-target contents. Used to verify order preservation and
    /// replay determinism; implementations must be deterministic for
    /// identical call sequences.
    fn state_checksum(&mut self) -> u64;
}
