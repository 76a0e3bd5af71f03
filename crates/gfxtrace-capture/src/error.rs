use gfxtrace_core::{CoreError, DriverError};
use gfxtrace_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no capture frame is open")]
    NoOpenFrame,

    #[error("a capture frame is already open")]
    FrameAlreadyOpen,
}
