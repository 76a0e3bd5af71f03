//! Capture-to-replay round trips: application-shaped call sequences are
//! intercepted, serialized, loaded into a fresh driver, and replayed.

use gfxtrace_capture::{CaptureContext, GraphicsPipelineDesc, TexelSource};
use gfxtrace_core::{CaptureSettings, ReplayDriver, ReplaySettings, SoftwareDriver};
use gfxtrace_protocol::call::ApiCall;
use gfxtrace_protocol::types::*;
use gfxtrace_protocol::wire::{encode_chunk, encode_header, ChunkReader, StreamHeader, StreamRecord};
use gfxtrace_protocol::{Chunk, RawHandle, ResourceId};
use gfxtrace_replay::{render_overlay, EventId, OverlayMode, ReplayController, ReplayType};

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
    (pipeline, rp, fb)
}

/// Capture one frame with `draws` draws bound to the textured pipeline
/// and return the serialized stream.
fn captured_textured_stream(draws: u32) -> Vec<u8> {
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
        vec![SerializedClearValue::from_color([0.0, 0.0, 0.0, 1.0])],
    )
    .unwrap();
    ctx.bind_pipeline(pipeline).unwrap();
    for i in 1..=draws {
        ctx.draw(3 * i, 1, 0, 0).unwrap();
    }
    ctx.end_render_pass().unwrap();
    ctx.end_capture_frame().unwrap();

    ctx.capture().unwrap().serialize().unwrap()
}

fn decoded_chunks(bytes: &[u8]) -> Vec<Chunk> {
    let mut reader = ChunkReader::new(bytes);
    let mut chunks = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        if let StreamRecord::Chunk(c) = record {
            chunks.push(c);
        }
    }
    chunks
}

fn image_id_with_extent(chunks: &[Chunk], extent: [u32; 3]) -> ResourceId {
    chunks
        .iter()
        .find_map(|c| match &c.call {
            ApiCall::CreateImage { id, info } if info.extent == extent => Some(*id),
            _ => None,
        })
        .expect("image creation chunk present")
}

#[test]
fn replayed_texture_matches_captured_contents() {
    let bytes = captured_textured_stream(1);
    let texture_id = image_id_with_extent(&decoded_chunks(&bytes), [4, 4, 1]);

    let mut controller =
        ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()).unwrap();
    controller.replay_all().unwrap();

    let handle = controller.resources().get_live_resource(texture_id).unwrap();
    let contents = controller
        .driver_mut()
        .texture_contents(handle, 0, 0)
        .expect("replayed texture has contents");
    assert_eq!(contents, &[0xCCu8; 64][..]);

    let draw_log = controller.driver_mut().draw_log();
    assert_eq!(draw_log.len(), 1);
    assert!(draw_log[0].pipeline.is_some(), "draw replayed with pipeline bound");
}

#[test]
fn two_fresh_drivers_replay_to_identical_state() {
    let bytes = captured_textured_stream(4);

    let run = || {
        let mut controller =
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default())
                .unwrap();
        controller.replay_all().unwrap();
        let counts: Vec<u32> = controller
            .driver_mut()
            .draw_log()
            .iter()
            .map(|d| d.vertex_or_index_count)
            .collect();
        (controller.driver_mut().state_checksum(), counts)
    };

    let (checksum_a, counts_a) = run();
    let (checksum_b, counts_b) = run();
    assert_eq!(counts_a, vec![3, 6, 9, 12], "draw order preserved");
    assert_eq!(checksum_a, checksum_b);
}

#[test]
fn without_draw_then_only_draw_executes_the_draw_once() {
    let bytes = captured_textured_stream(1);
    let mut controller =
        ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()).unwrap();

    let draw_event = controller.frame_log().drawcalls()[0].event;
    controller
        .replay_log(EventId(1), draw_event, ReplayType::WithoutDraw)
        .unwrap();
    assert!(
        controller.driver_mut().draw_log().is_empty(),
        "state primed without executing the draw"
    );

    controller
        .replay_log(draw_event, draw_event, ReplayType::OnlyDraw)
        .unwrap();
    let draw_log = controller.driver_mut().draw_log();
    assert_eq!(draw_log.len(), 1);
    assert!(draw_log[0].overlay_target.is_none());
}

#[test]
fn wireframe_overlay_writes_aux_target_only() {
    let bytes = captured_textured_stream(1);
    let mut controller =
        ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()).unwrap();
    let draw_event = controller.frame_log().drawcalls()[0].event;

    let image = render_overlay(&mut controller, draw_event, OverlayMode::Wireframe).unwrap();
    assert_eq!((image.width, image.height), (64, 64));
    assert!(
        image.data.iter().any(|b| *b != 0),
        "overlay draw produced output"
    );

    // The only draw executed went to the auxiliary target, never to the
    // frame's own framebuffer.
    let draw_log = controller.driver_mut().draw_log();
    assert_eq!(draw_log.len(), 1);
    assert!(draw_log[0].overlay_target.is_some());
    assert!(controller.driver_mut().drain_count() > 0);
}

#[test]
fn repeated_overlays_reuse_one_target() {
    let bytes = captured_textured_stream(1);
    let mut controller =
        ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()).unwrap();
    let draw_event = controller.frame_log().drawcalls()[0].event;

    render_overlay(&mut controller, draw_event, OverlayMode::Wireframe).unwrap();
    render_overlay(&mut controller, draw_event, OverlayMode::Overdraw).unwrap();

    assert_eq!(controller.driver_mut().overlay_target_count(), 1);
    assert!(controller.driver_mut().active_overlay_target().is_none());
}

#[test]
fn failed_overlay_clears_target_redirect() {
    // Hand-built stream whose only action is a copy with a source region
    // past the end of the buffer, so executing it fails at the driver.
    let src = ResourceId(1);
    let dst = ResourceId(2);
    let rp = ResourceId(3);
    let fb = ResourceId(4);
    let buffer_info = SerializedBufferCreateInfo {
        size: 4,
        usage: 0,
        sharing_mode: 0,
    };
    let chunks = [
        Chunk::new(ApiCall::CreateBuffer { id: src, info: buffer_info.clone() }),
        Chunk::new(ApiCall::CreateBuffer { id: dst, info: buffer_info }),
        Chunk::new(ApiCall::CreateRenderPass {
            id: rp,
            info: SerializedRenderPassCreateInfo {
                color_attachments: vec![],
                depth_attachment: None,
            },
        }),
        Chunk::new(ApiCall::CreateFramebuffer {
            id: fb,
            info: SerializedFramebufferCreateInfo {
                render_pass: rp,
                attachments: vec![],
                width: 8,
                height: 8,
                layers: 1,
            },
        }),
        Chunk::new(ApiCall::BeginRenderPass {
            render_pass: rp,
            framebuffer: fb,
            render_area: SerializedRect2D {
                offset: [0, 0],
                extent: [8, 8],
            },
            clear_values: vec![],
        }),
        Chunk::new(ApiCall::CopyBuffer {
            src,
            dst,
            regions: vec![SerializedBufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 64,
            }],
        }),
        Chunk::new(ApiCall::EndRenderPass),
        Chunk::new(ApiCall::EndOfFrame),
    ];
    let mut bytes = encode_header(&StreamHeader::new(0, vec![])).unwrap();
    for chunk in &chunks {
        bytes.extend_from_slice(&encode_chunk(chunk).unwrap());
    }

    let mut controller =
        ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()).unwrap();
    let copy_event = controller.frame_log().drawcalls()[0].event;

    let result = render_overlay(&mut controller, copy_event, OverlayMode::Overdraw);
    assert!(result.is_err());
    // The failed pass must not leave the driver redirected
    assert!(controller.driver_mut().active_overlay_target().is_none());
}

#[test]
fn upload_diversion_replays_to_same_final_contents() {
    let capture_with = |settings: CaptureSettings| {
        let mut ctx = CaptureContext::new(SoftwareDriver::new(), settings);
        let image = ctx.create_image(rgba8_image(4, 4)).unwrap();
        ctx.upload_texture(image, 0, 0, [0; 3], [4, 4, 1], TexelSource::Inline(&[0x11u8; 64]))
            .unwrap();
        ctx.upload_texture(image, 0, 0, [0; 3], [4, 4, 1], TexelSource::Inline(&[0x22u8; 64]))
            .unwrap();
        ctx.begin_capture_frame().unwrap();
        ctx.end_capture_frame().unwrap();
        ctx.capture().unwrap().serialize().unwrap()
    };

    // One capture records both uploads, the other diverts after the first
    // and snapshots the resource wholesale at the capture boundary.
    let verbatim = capture_with(CaptureSettings::default());
    let diverted = capture_with(CaptureSettings {
        upload_dirty_threshold: 1,
        ..CaptureSettings::default()
    });

    let final_contents = |bytes: &[u8]| {
        let id = image_id_with_extent(&decoded_chunks(bytes), [4, 4, 1]);
        let mut controller =
            ReplayController::load(bytes, SoftwareDriver::new(), ReplaySettings::default())
                .unwrap();
        controller.replay_all().unwrap();
        let handle = controller.resources().get_live_resource(id).unwrap();
        controller
            .driver_mut()
            .texture_contents(handle, 0, 0)
            .unwrap()
            .to_vec()
    };

    assert_eq!(final_contents(&verbatim), final_contents(&diverted));
    assert_eq!(final_contents(&diverted), vec![0x22u8; 64]);
}
