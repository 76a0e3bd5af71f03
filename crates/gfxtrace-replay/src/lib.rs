//! Capture loading, the replay state machine, and analysis overlays.
//!
//! A serialized capture goes through a reading pass first (version gate,
//! event/drawcall arena construction, referential integrity), then
//! executes against any [`gfxtrace_core::ReplayDriver`]: the software
//! state tracker for headless analysis, or the Vulkan driver for real
//! GPU replay.

pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod overlay;
pub mod spirv_patch;
pub mod vulkan;

pub use controller::ReplayController;
pub use error::ReplayError;
pub use events::{Drawcall, Event, EventId, FrameLog, ReplayType};
pub use executor::ChunkExecutor;
pub use overlay::{render_overlay, OverlayMode, RESERVED_DESCRIPTOR_SET};
pub use vulkan::VulkanDriver;
