//! The one place where per-call recording decisions live.
//!
//! Hundreds of wrapper entry points all funnel into [`record_policy`]
//! rather than repeating mode-branching logic per wrapper. Each call's
//! class plus the active mode determines whether a chunk is produced and
//! which list owns it.

use gfxtrace_core::Mode;
use gfxtrace_protocol::{ApiCall, CallClass};

/// Where an intercepted call's chunk goes, if anywhere.
/// The real driver call is issued regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// No chunk produced.
    Skip,
    /// Chunk appended to the owning resource's record (creation/update
    /// history replayed as initial state).
    ResourceRecord,
    /// Chunk appended to the open frame record, in strict call order.
    FrameRecord,
}

/// Decide the chunk destination for `call` under `mode`.
pub fn record_policy(mode: Mode, call: &ApiCall) -> RecordPolicy {
    match mode {
        // Replay-side modes never serialize
        Mode::Reading | Mode::Executing => RecordPolicy::Skip,

        // Everything relevant to frame replay lands in the frame record.
        // Creations mid-frame also go there: the initial-state list only
        // covers resources alive when the frame opened.
        Mode::WritingCaptureFrame => RecordPolicy::FrameRecord,

        // Outside a frame capture only persistent resource state is kept:
        // creation, parameter sets, and content updates. Transient binds,
        // scopes and actions leave no trace beyond shadow-state tracking.
        Mode::Idle | Mode::WritingIdle => match call.class() {
            CallClass::Creation | CallClass::ResourceUpdate => RecordPolicy::ResourceRecord,
            CallClass::Destroy
            | CallClass::StateSet
            | CallClass::Scope
            | CallClass::Action
            | CallClass::Marker => RecordPolicy::Skip,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_protocol::ResourceId;

    #[test]
    fn idle_records_only_persistent_state() {
        let draw = ApiCall::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        };
        let bind = ApiCall::BindPipeline {
            pipeline: ResourceId(1),
        };
        let poke = ApiCall::SetTextureParameter {
            image: ResourceId(1),
            parameter: 0,
            value: 0,
        };
        assert_eq!(record_policy(Mode::WritingIdle, &draw), RecordPolicy::Skip);
        assert_eq!(record_policy(Mode::WritingIdle, &bind), RecordPolicy::Skip);
        assert_eq!(
            record_policy(Mode::WritingIdle, &poke),
            RecordPolicy::ResourceRecord
        );
    }

    #[test]
    fn capture_frame_records_everything() {
        let draw = ApiCall::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        };
        assert_eq!(
            record_policy(Mode::WritingCaptureFrame, &draw),
            RecordPolicy::FrameRecord
        );
        assert_eq!(
            record_policy(Mode::WritingCaptureFrame, &ApiCall::EndOfFrame),
            RecordPolicy::FrameRecord
        );
    }

    #[test]
    fn replay_modes_never_serialize() {
        let poke = ApiCall::SetTextureParameter {
            image: ResourceId(1),
            parameter: 0,
            value: 0,
        };
        assert_eq!(record_policy(Mode::Reading, &poke), RecordPolicy::Skip);
        assert_eq!(record_policy(Mode::Executing, &poke), RecordPolicy::Skip);
    }
}
