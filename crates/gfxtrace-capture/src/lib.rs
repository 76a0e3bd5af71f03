//! Call interception and frame capture.
//!
//! Every application-facing entry point forwards to the real driver first,
//! so application behavior is unaffected, then consults the current
//! [`gfxtrace_core::Mode`] and the per-call policy table to decide whether
//! the call contributes a chunk and to which chunk list.

pub mod context;
pub mod error;
pub mod policy;
pub mod recorder;

pub use context::{CaptureContext, DescriptorWriteDesc, GraphicsPipelineDesc, TexelSource};
pub use error::CaptureError;
pub use policy::{record_policy, RecordPolicy};
pub use recorder::FrameRecorder;
