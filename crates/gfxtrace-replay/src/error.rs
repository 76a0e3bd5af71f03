use gfxtrace_core::{CoreError, DriverError};
use gfxtrace_protocol::{ProtocolError, ResourceId};

use crate::events::EventId;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("malformed capture stream: {0}")]
    MalformedStream(String),

    #[error("unbalanced scope at event {event}")]
    UnbalancedScope { event: EventId },

    #[error("event {event} out of range, frame has {last} events")]
    EventOutOfRange { event: EventId, last: u32 },

    #[error("event {0} is not an action")]
    NotAnAction(EventId),

    #[error("event {0} is not inside a render pass")]
    NoEnclosingRenderPass(EventId),

    #[error("chunk references {0} but no creation precedes it")]
    UnresolvedReference(ResourceId),

    #[error("invalid SPIR-V: {0}")]
    InvalidSpirv(String),
}
