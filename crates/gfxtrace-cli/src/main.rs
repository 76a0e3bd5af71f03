use std::fs;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use gfxtrace_core::{GfxtraceConfig, ReplayDriver, SoftwareDriver};
use gfxtrace_replay::{
    render_overlay, EventId, OverlayMode, ReplayController, ReplayType, VulkanDriver,
};

#[derive(Parser)]
#[command(name = "gfxtrace")]
#[command(about = "gfxtrace - capture inspection and replay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show capture metadata (format version, frame, resource counts)
    Info {
        /// Capture file to inspect
        capture: String,
    },

    /// List the captured frame's events, indented by scope depth
    Events {
        /// Capture file to inspect
        capture: String,

        /// Only list action events (draws, dispatches, clears)
        #[arg(long)]
        drawcalls: bool,
    },

    /// Replay the capture and report final driver state
    Replay {
        /// Capture file to replay
        capture: String,

        /// Replay up to this event instead of the whole frame
        #[arg(short, long)]
        event: Option<u32>,

        /// Replay on the real GPU instead of the software tracker
        #[arg(long)]
        gpu: bool,

        /// Configuration file path
        #[arg(short, long, default_value = "gfxtrace.toml")]
        config: String,
    },

    /// Render an analysis overlay for one drawcall
    Overlay {
        /// Capture file to replay
        capture: String,

        /// Event of the target drawcall
        #[arg(short, long)]
        event: u32,

        /// Overlay mode: wireframe, overdraw, depth-test, triangle-size
        #[arg(short, long, default_value = "wireframe")]
        mode: String,

        /// Write the overlay image here as binary PPM
        #[arg(short, long)]
        output: Option<String>,

        /// Configuration file path
        #[arg(short, long, default_value = "gfxtrace.toml")]
        config: String,
    },
}

fn main() -> anyhow::Result<()> {
    gfxtrace_common::logging::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { capture } => {
            let bytes = read_capture(&capture)?;
            let controller = ReplayController::load(
                &bytes,
                SoftwareDriver::new(),
                GfxtraceConfig::default().replay,
            )?;
            let header = controller.header();
            println!("capture:           {capture}");
            println!(
                "format version:    {}.{}",
                header.version_major, header.version_minor
            );
            println!("frame number:      {}", header.frame_number);
            println!("initial resources: {}", header.initial_resources.len());
            println!("initial chunks:    {}", header.initial_chunk_count);
            println!("frame events:      {}", controller.events().len());
            println!(
                "drawcalls:         {}",
                controller.frame_log().drawcalls().len()
            );
            println!("incomplete:        {}", header.incomplete);
        }

        Commands::Events { capture, drawcalls } => {
            let bytes = read_capture(&capture)?;
            let controller = ReplayController::load(
                &bytes,
                SoftwareDriver::new(),
                GfxtraceConfig::default().replay,
            )?;
            if drawcalls {
                for draw in controller.frame_log().drawcalls() {
                    let path = if draw.marker_path.is_empty() {
                        String::new()
                    } else {
                        format!("  [{}]", draw.marker_path.join(" > "))
                    };
                    println!("{:>6}  #{} {}{path}", draw.event, draw.index, draw.description);
                }
            } else {
                for event in controller.events() {
                    let indent = "  ".repeat(event.depth as usize);
                    println!("{:>6}  {indent}{}", event.id, event.description);
                }
            }
        }

        Commands::Replay {
            capture,
            event,
            gpu,
            config,
        } => {
            let bytes = read_capture(&capture)?;
            let settings = GfxtraceConfig::load_or_default(&config).replay;
            if gpu {
                let driver = VulkanDriver::new()?;
                run_replay(&bytes, driver, settings, event)?;
            } else {
                run_replay(&bytes, SoftwareDriver::new(), settings, event)?;
            }
        }

        Commands::Overlay {
            capture,
            event,
            mode,
            output,
            config,
        } => {
            let bytes = read_capture(&capture)?;
            let settings = GfxtraceConfig::load_or_default(&config).replay;
            let mode = parse_overlay_mode(&mode)?;
            let mut controller =
                ReplayController::load(&bytes, SoftwareDriver::new(), settings)?;
            let image = render_overlay(&mut controller, EventId(event), mode)?;
            info!(width = image.width, height = image.height, "overlay rendered");
            match output {
                Some(path) => {
                    fs::write(&path, ppm_bytes(image.width, image.height, &image.data))
                        .with_context(|| format!("writing {path}"))?;
                    println!("wrote {}x{} overlay to {path}", image.width, image.height);
                }
                None => {
                    println!("rendered {}x{} overlay (no --output given)", image.width, image.height);
                }
            }
        }
    }

    Ok(())
}

fn read_capture(path: &str) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading capture {path}"))
}

fn run_replay<D: ReplayDriver>(
    bytes: &[u8],
    driver: D,
    settings: gfxtrace_core::ReplaySettings,
    event: Option<u32>,
) -> anyhow::Result<()> {
    let mut controller = ReplayController::load(bytes, driver, settings)?;
    match event {
        Some(e) => controller.replay_log(EventId(1), EventId(e), ReplayType::Full)?,
        None => controller.replay_all()?,
    }
    controller.drain()?;
    println!("replayed to {}", controller.position());
    println!("state checksum: {:#018x}", controller.driver_mut().state_checksum());
    Ok(())
}

fn parse_overlay_mode(mode: &str) -> anyhow::Result<OverlayMode> {
    match mode {
        "wireframe" => Ok(OverlayMode::Wireframe),
        "overdraw" => Ok(OverlayMode::Overdraw),
        "depth-test" => Ok(OverlayMode::DepthTest),
        "triangle-size" => Ok(OverlayMode::TriangleSize),
        other => anyhow::bail!("unknown overlay mode '{other}'"),
    }
}

/// Binary PPM (P6), dropping the alpha channel.
fn ppm_bytes(width: u32, height: u32, rgba: &[u8]) -> Vec<u8> {
    let mut out = format!("P6\n{width} {height}\n255\n").into_bytes();
    for texel in rgba.chunks_exact(4) {
        out.extend_from_slice(&texel[..3]);
    }
    out
}
