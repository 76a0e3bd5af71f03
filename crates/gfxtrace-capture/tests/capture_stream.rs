//! End-to-end capture tests: drive an application-shaped call sequence
//! through the interception layer and verify the serialized chunk stream.

use gfxtrace_capture::{CaptureContext, TexelSource};
use gfxtrace_core::{CaptureSettings, SoftwareDriver};
use gfxtrace_protocol::call::ApiCall;
use gfxtrace_protocol::types::*;
use gfxtrace_protocol::wire::{encode_chunk, encode_header, ChunkReader, StreamRecord};
use gfxtrace_protocol::RawHandle;

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

/// Create the minimal objects for a textured draw, returning
/// (pipeline, render pass, framebuffer).
fn build_textured_draw_setup(
    ctx: &mut CaptureContext<SoftwareDriver>,
) -> (RawHandle, RawHandle, RawHandle) {
    let image = ctx.create_image(rgba8_image(4, 4)).unwrap();
    ctx.upload_texture(
        image,
        0,
        0,
        [0; 3],
        [4, 4, 1],
        TexelSource::Inline(&[0xCCu8; 64]),
    )
    .unwrap();

    let module = ctx.create_shader_module(&[0x03, 0x02, 0x23, 0x07]).unwrap();
    let layout = ctx.create_pipeline_layout(&[], vec![]).unwrap();
    let rp = ctx
        .create_render_pass(SerializedRenderPassCreateInfo {
            color_attachments: vec![SerializedAttachmentDescription {
                format: 37,
                samples: 1,
                load_op: 0,
                store_op: 0,
                initial_layout: 0,
                final_layout: 0,
            }],
            depth_attachment: None,
        })
        .unwrap();
    let target = ctx.create_image(rgba8_image(64, 64)).unwrap();
    let view = ctx
        .create_image_view(
            target,
            1,
            37,
            SerializedImageSubresourceRange {
                aspect_mask: 1,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        )
        .unwrap();
    let fb = ctx.create_framebuffer(rp, &[view], 64, 64, 1).unwrap();
    let pipeline = ctx
        .create_graphics_pipeline(gfxtrace_capture::GraphicsPipelineDesc {
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
    (pipeline, rp, fb)
}

fn capture_textured_frame(ctx: &mut CaptureContext<SoftwareDriver>) {
    let (pipeline, rp, fb) = build_textured_draw_setup(ctx);

    ctx.attempt_capture();
    ctx.end_frame().unwrap();

    ctx.begin_render_pass(
        rp,
        fb,
        SerializedRect2D {
            offset: [0, 0],
            extent: [64, 64],
        },
        vec![SerializedClearValue::from_color([0.0, 0.0, 0.0, 1.0])],
    )
    .unwrap();
    ctx.bind_pipeline(pipeline).unwrap();
    ctx.draw(3, 1, 0, 0).unwrap();
    ctx.end_render_pass().unwrap();
    ctx.end_frame().unwrap();
}

#[test]
fn stream_layout_header_then_initial_then_frame() {
    let mut ctx = ctx();
    capture_textured_frame(&mut ctx);

    let bytes = ctx.capture().unwrap().serialize().unwrap();
    let mut reader = ChunkReader::new(&bytes);

    let header = match reader.next_record().unwrap().unwrap() {
        StreamRecord::Header(h) => h,
        other => panic!("stream must open with the scope header, got {other:?}"),
    };
    assert!(header.check_version().is_ok());
    assert!(!header.incomplete);
    assert!(!header.initial_resources.is_empty());

    // All initial-state chunks precede all frame chunks, and the frame run
    // ends with the frame marker.
    let mut calls = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        match record {
            StreamRecord::Chunk(c) => calls.push(c.call),
            StreamRecord::Header(_) => panic!("second scope header in stream"),
        }
    }
    assert!(matches!(calls.last(), Some(ApiCall::EndOfFrame)));

    let first_action = calls
        .iter()
        .position(|c| matches!(c, ApiCall::BeginRenderPass { .. }))
        .expect("frame chunks present");
    let last_creation = calls
        .iter()
        .rposition(|c| c.created_id().is_some())
        .expect("initial chunks present");
    assert!(
        last_creation < first_action,
        "initial-state chunk found after frame chunks began"
    );
}

#[test]
fn decoded_stream_reencodes_to_identical_bytes() {
    let mut ctx = ctx();
    capture_textured_frame(&mut ctx);
    let bytes = ctx.capture().unwrap().serialize().unwrap();

    // Decode every record and re-encode it; the stream must survive the
    // round trip byte for byte.
    let mut reader = ChunkReader::new(&bytes);
    let mut rebuilt = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        match record {
            StreamRecord::Header(h) => rebuilt.extend(encode_header(&h).unwrap()),
            StreamRecord::Chunk(c) => rebuilt.extend(encode_chunk(&c).unwrap()),
        }
    }
    assert_eq!(bytes, rebuilt);
}

#[test]
fn frame_chunk_order_matches_call_order() {
    let mut ctx = ctx();
    let (pipeline, rp, fb) = build_textured_draw_setup(&mut ctx);

    ctx.begin_capture_frame().unwrap();
    ctx.begin_render_pass(
        rp,
        fb,
        SerializedRect2D {
            offset: [0, 0],
            extent: [64, 64],
        },
        vec![],
    )
    .unwrap();
    ctx.bind_pipeline(pipeline).unwrap();
    for i in 1..=4u32 {
        ctx.draw(3 * i, 1, 0, 0).unwrap();
    }
    ctx.end_render_pass().unwrap();
    ctx.end_capture_frame().unwrap();

    let capture = ctx.capture().unwrap();
    let draw_counts: Vec<u32> = capture
        .frame_chunks
        .iter()
        .filter_map(|c| match c.call {
            ApiCall::Draw { vertex_count, .. } => Some(vertex_count),
            _ => None,
        })
        .collect();
    assert_eq!(draw_counts, vec![3, 6, 9, 12]);
}

#[test]
fn capture_frame_reestablishes_bound_state_at_head() {
    let mut ctx = ctx();
    let (pipeline, rp, fb) = build_textured_draw_setup(&mut ctx);

    // Bind before the capture boundary; the frame record must still replay
    // with this pipeline bound.
    ctx.bind_pipeline(pipeline).unwrap();
    ctx.set_viewport(SerializedViewport {
        x: 0.0,
        y: 0.0,
        width: 64.0,
        height: 64.0,
        min_depth: 0.0,
        max_depth: 1.0,
    })
    .unwrap();

    ctx.attempt_capture();
    ctx.end_frame().unwrap();
    ctx.begin_render_pass(
        rp,
        fb,
        SerializedRect2D {
            offset: [0, 0],
            extent: [64, 64],
        },
        vec![],
    )
    .unwrap();
    ctx.draw(3, 1, 0, 0).unwrap();
    ctx.end_render_pass().unwrap();
    ctx.end_frame().unwrap();

    let capture = ctx.capture().unwrap();
    let first_pass = capture
        .frame_chunks
        .iter()
        .position(|c| matches!(c.call, ApiCall::BeginRenderPass { .. }))
        .unwrap();
    let head = &capture.frame_chunks[..first_pass];
    assert!(head
        .iter()
        .any(|c| matches!(c.call, ApiCall::BindPipeline { .. })));
    assert!(head
        .iter()
        .any(|c| matches!(c.call, ApiCall::SetViewport { .. })));
}

#[test]
fn destroyed_but_referenced_resource_survives_in_initial_state() {
    let mut ctx = ctx();
    let buffer = ctx
        .create_buffer(SerializedBufferCreateInfo {
            size: 32,
            usage: 0,
            sharing_mode: 0,
        })
        .unwrap();
    ctx.update_buffer(buffer, 0, &[9u8; 32]).unwrap();

    ctx.begin_capture_frame().unwrap();
    ctx.bind_vertex_buffers(0, &[buffer], &[0]).unwrap();
    ctx.draw(3, 1, 0, 0).unwrap();
    // Destroyed mid-frame while the bind chunk still references it
    ctx.destroy(buffer, gfxtrace_protocol::ResourceType::Buffer)
        .unwrap();
    ctx.end_capture_frame().unwrap();

    let capture = ctx.capture().unwrap();
    let has_creation = capture
        .initial_chunks
        .iter()
        .any(|c| matches!(c.call, ApiCall::CreateBuffer { .. }));
    assert!(has_creation, "record must be retained past the destroy");
    let has_destroy = capture
        .frame_chunks
        .iter()
        .any(|c| matches!(c.call, ApiCall::DestroyResource { .. }));
    assert!(has_destroy);
}
