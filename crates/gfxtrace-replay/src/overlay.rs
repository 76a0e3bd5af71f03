//! Analysis overlays rendered on top of a replayed drawcall.
//!
//! Every overlay follows the same discipline: replay up to (but not
//! including) the target draw, drain, redirect output to an auxiliary
//! target, execute the draw with patched state, drain again, read the
//! target back, then restore the original bindings. The replayed frame's
//! own render targets are never written by an overlay pass.

use tracing::{debug, warn};

use gfxtrace_core::driver::ReadbackImage;
use gfxtrace_core::{ReplayDriver, ResourceManager};
use gfxtrace_protocol::types::SerializedGraphicsPipelineCreateInfo;
use gfxtrace_protocol::{ApiCall, CallClass, Chunk, RawHandle, ResourceId, ResourceType};

use crate::controller::ReplayController;
use crate::error::ReplayError;
use crate::events::{EventId, ReplayType};
use crate::executor::ChunkExecutor;
use crate::spirv_patch;

/// Which analysis view to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// Geometry outline: the draw re-executed with line polygon mode.
    Wireframe,
    /// Per-pixel shading cost: the draw re-executed as-is into an empty
    /// target, so every covered fragment is visible.
    Overdraw,
    /// Depth-test visualization: one pass with the test disabled, then
    /// the original pass on top, so rejected fragments are
    /// distinguishable from surviving ones.
    DepthTest,
    /// Triangle density: the draw re-executed with a patched fragment
    /// stage whose resource bindings are relocated into the reserved set.
    TriangleSize,
}

/// Descriptor set index reserved for analysis resources; captured
/// applications never bind it.
pub const RESERVED_DESCRIPTOR_SET: u32 = 7;

/// VK_POLYGON_MODE_LINE
const POLYGON_MODE_LINE: i32 = 1;
/// VK_SHADER_STAGE_FRAGMENT_BIT
const STAGE_FRAGMENT: u32 = 0x10;

struct PatchedPipeline {
    pipeline: RawHandle,
    /// Temp shader module, when the mode patches SPIR-V.
    module: Option<RawHandle>,
}

/// Render `mode` for the action at `event` and read the result back.
pub fn render_overlay<D: ReplayDriver>(
    controller: &mut ReplayController<D>,
    event: EventId,
    mode: OverlayMode,
) -> Result<ReadbackImage, ReplayError> {
    let target_event = controller
        .frame_log()
        .event(event)
        .ok_or(ReplayError::EventOutOfRange {
            event,
            last: controller.frame_log().last_event().0,
        })?;
    if target_event.class != CallClass::Action {
        return Err(ReplayError::NotAnAction(event));
    }
    let draw_chunk_index = target_event.chunk_index;

    let (width, height) = enclosing_target_extent(controller, event)?;

    // Prime all state up to the draw, then drain before touching targets
    controller.replay_log(EventId(1), event, ReplayType::WithoutDraw)?;
    controller.drain()?;

    let pipeline_id = last_bound_pipeline(controller.frame_chunks(), draw_chunk_index);
    let patched = match (mode, pipeline_id) {
        (OverlayMode::Overdraw, _) => None,
        (_, Some(id)) => Some(build_patched_pipeline(controller, id, mode)?),
        (_, None) => {
            warn!(%event, "no pipeline bound before draw; overlay runs unpatched");
            None
        }
    };

    let draw_call = controller.frame_chunks()[draw_chunk_index].call.clone();
    let result = run_overlay_draw(
        controller,
        &draw_call,
        mode,
        patched.as_ref(),
        pipeline_id,
        width,
        height,
    );

    // Restore the replayed frame's bindings whatever happened above
    if let Some(p) = &patched {
        restore_after_patch(controller, pipeline_id, p);
    }
    debug!(?mode, %event, "overlay pass finished");
    result
}

fn run_overlay_draw<D: ReplayDriver>(
    controller: &mut ReplayController<D>,
    draw_call: &ApiCall,
    mode: OverlayMode,
    patched: Option<&PatchedPipeline>,
    pipeline_id: Option<ResourceId>,
    width: u32,
    height: u32,
) -> Result<ReadbackImage, ReplayError> {
    let (driver, resources) = controller.driver_and_resources();
    let target = driver.create_overlay_target(width, height)?;
    driver.set_overlay_target(Some(target))?;

    let result = overlay_pass(driver, resources, draw_call, mode, patched, pipeline_id, target);

    // The redirect must not outlive the pass, error or not
    if let Err(e) = driver.set_overlay_target(None) {
        warn!(error = %e, "failed to clear overlay redirect");
    }
    driver.wait_idle()?;
    result
}

fn overlay_pass<D: ReplayDriver>(
    driver: &mut D,
    resources: &ResourceManager,
    draw_call: &ApiCall,
    mode: OverlayMode,
    patched: Option<&PatchedPipeline>,
    pipeline_id: Option<ResourceId>,
    target: RawHandle,
) -> Result<ReadbackImage, ReplayError> {
    if let Some(p) = patched {
        driver.bind_pipeline(p.pipeline)?;
    }
    ChunkExecutor::new(driver, resources).execute(draw_call)?;

    if mode == OverlayMode::DepthTest {
        // Second pass with the original depth state over the first
        if let Some(id) = pipeline_id {
            let original = resources.get_live_resource(id)?;
            driver.bind_pipeline(original)?;
            ChunkExecutor::new(driver, resources).execute(draw_call)?;
        }
    }

    driver.wait_idle()?;
    Ok(driver.read_overlay_target(target)?)
}

fn restore_after_patch<D: ReplayDriver>(
    controller: &mut ReplayController<D>,
    original: Option<ResourceId>,
    patched: &PatchedPipeline,
) {
    let (driver, resources) = controller.driver_and_resources();
    if let Some(id) = original {
        if let Ok(handle) = resources.get_live_resource(id) {
            if let Err(e) = driver.bind_pipeline(handle) {
                warn!(error = %e, "failed to restore original pipeline binding");
            }
        }
    }
    if let Err(e) = driver.destroy_resource(patched.pipeline, ResourceType::Pipeline) {
        warn!(error = %e, "failed to destroy overlay pipeline");
    }
    if let Some(module) = patched.module {
        if let Err(e) = driver.destroy_resource(module, ResourceType::ShaderModule) {
            warn!(error = %e, "failed to destroy overlay shader module");
        }
    }
}

/// Extent of the framebuffer bound by the render pass enclosing `event`.
fn enclosing_target_extent<D: ReplayDriver>(
    controller: &ReplayController<D>,
    event: EventId,
) -> Result<(u32, u32), ReplayError> {
    let chunks = controller.frame_chunks();
    let upto = event.0 as usize - 1;
    let mut closed_below = 0u32;
    let mut framebuffer = None;
    for chunk in chunks[..upto].iter().rev() {
        match &chunk.call {
            ApiCall::EndRenderPass => closed_below += 1,
            ApiCall::BeginRenderPass { framebuffer: fb, .. } => {
                if closed_below == 0 {
                    framebuffer = Some(*fb);
                    break;
                }
                closed_below -= 1;
            }
            _ => {}
        }
    }
    let framebuffer = framebuffer.ok_or(ReplayError::NoEnclosingRenderPass(event))?;

    for chunk in controller
        .initial_chunks()
        .iter()
        .chain(controller.frame_chunks())
    {
        if let ApiCall::CreateFramebuffer { id, info } = &chunk.call {
            if *id == framebuffer {
                return Ok((info.width, info.height));
            }
        }
    }
    Err(ReplayError::UnresolvedReference(framebuffer))
}

/// The pipeline bound at the time of the chunk at `draw_index`, if any.
fn last_bound_pipeline(chunks: &[Chunk], draw_index: usize) -> Option<ResourceId> {
    chunks[..draw_index].iter().rev().find_map(|c| match c.call {
        ApiCall::BindPipeline { pipeline } => Some(pipeline),
        _ => None,
    })
}

/// Locate the creation info for `pipeline` in the chunk lists.
fn pipeline_create_info<D: ReplayDriver>(
    controller: &ReplayController<D>,
    pipeline: ResourceId,
) -> Result<SerializedGraphicsPipelineCreateInfo, ReplayError> {
    controller
        .initial_chunks()
        .iter()
        .chain(controller.frame_chunks())
        .find_map(|c| match &c.call {
            ApiCall::CreateGraphicsPipeline { id, info } if *id == pipeline => {
                Some(info.clone())
            }
            _ => None,
        })
        .ok_or(ReplayError::UnresolvedReference(pipeline))
}

/// Shader module bytes for `module` from its creation chunk.
fn module_code<D: ReplayDriver>(
    controller: &ReplayController<D>,
    module: ResourceId,
) -> Result<Vec<u8>, ReplayError> {
    controller
        .initial_chunks()
        .iter()
        .chain(controller.frame_chunks())
        .find_map(|c| match &c.call {
            ApiCall::CreateShaderModule { id, code } if *id == module => Some(code.clone()),
            _ => None,
        })
        .ok_or(ReplayError::UnresolvedReference(module))
}

/// Build the mode's variant of the bound pipeline. State patches stay in
/// the create info; TriangleSize additionally rewrites the fragment
/// stage's SPIR-V words.
fn build_patched_pipeline<D: ReplayDriver>(
    controller: &mut ReplayController<D>,
    pipeline: ResourceId,
    mode: OverlayMode,
) -> Result<PatchedPipeline, ReplayError> {
    let mut info = pipeline_create_info(controller, pipeline)?;

    match mode {
        OverlayMode::Wireframe => {
            info.rasterization.polygon_mode = POLYGON_MODE_LINE;
        }
        OverlayMode::DepthTest => {
            if let Some(ds) = &mut info.depth_stencil {
                ds.depth_test_enable = false;
                ds.depth_write_enable = false;
            }
        }
        OverlayMode::TriangleSize | OverlayMode::Overdraw => {}
    }

    // TriangleSize patches the fragment stage: application descriptor
    // sets are relocated into the reserved set so the analysis bindings
    // do not collide with them.
    let mut patched_fragment = None;
    if mode == OverlayMode::TriangleSize {
        if let Some(pos) = info.stages.iter().position(|s| s.stage & STAGE_FRAGMENT != 0) {
            let code = module_code(controller, info.stages[pos].module)?;
            let mut words = spirv_patch::words_from_bytes(&code)?;
            spirv_patch::validate(&words)?;
            let mut relocated = 0;
            for set in 0..RESERVED_DESCRIPTOR_SET {
                relocated +=
                    spirv_patch::patch_descriptor_set(&mut words, set, RESERVED_DESCRIPTOR_SET);
            }
            debug!(relocated, "fragment stage descriptor sets relocated");
            let patched_bytes = spirv_patch::words_to_bytes(&words);
            let (driver, _) = controller.driver_and_resources();
            let handle = driver.create_shader_module(&patched_bytes)?;
            patched_fragment = Some((pos, handle));
        }
    }

    // Resolve stage modules and fixed references through the live table,
    // substituting the patched module where applicable
    let mut stage_modules = Vec::with_capacity(info.stages.len());
    for (i, stage) in info.stages.iter().enumerate() {
        let handle = match patched_fragment {
            Some((pos, patched)) if pos == i => patched,
            _ => controller.resources().get_live_resource(stage.module)?,
        };
        stage_modules.push(handle);
    }
    let layout = controller.resources().get_live_resource(info.layout)?;
    let render_pass = controller.resources().get_live_resource(info.render_pass)?;

    let (driver, _) = controller.driver_and_resources();
    let handle = driver.create_graphics_pipeline(&info, &stage_modules, layout, render_pass)?;
    Ok(PatchedPipeline {
        pipeline: handle,
        module: patched_fragment.map(|(_, h)| h),
    })
}
