use serde::{Deserialize, Serialize};

/// Per-context capture/replay mode. Exactly one mode is active at a time;
/// transitions are driven by start-capture/end-capture/begin-replay
/// operations, never by individual intercepted calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Not capturing and not replaying; calls pass straight through.
    Idle,
    /// Background capture: persistent resource state is recorded to
    /// resource records, frame-transient calls are not.
    WritingIdle,
    /// A frame capture is open: every replay-relevant call is recorded to
    /// the frame record in strict call order.
    WritingCaptureFrame,
    /// Replay side: chunks are being read to build events; no driver calls.
    Reading,
    /// Replay side: chunks are being executed against live handles.
    Executing,
}

impl Mode {
    /// Writing modes record chunks; Idle only tracks identity.
    pub fn is_writing(&self) -> bool {
        matches!(self, Mode::WritingIdle | Mode::WritingCaptureFrame)
    }

    pub fn is_capturing_frame(&self) -> bool {
        *self == Mode::WritingCaptureFrame
    }

    pub fn is_reading(&self) -> bool {
        matches!(self, Mode::Reading | Mode::Executing)
    }

    /// Reading-side modes that actually issue driver calls.
    pub fn is_executing(&self) -> bool {
        *self == Mode::Executing
    }
}
