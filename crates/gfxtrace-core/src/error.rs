use gfxtrace_protocol::{RawHandle, ResourceId};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Programming error: a handle was registered twice without an
    /// intervening unregister.
    #[error("handle {0:#x} is already registered")]
    AlreadyRegistered(RawHandle),

    /// Corrupt-capture class: an ID referenced by a chunk has no live
    /// handle on the replay side.
    #[error("no live resource for {0}; capture is corrupt or out of order")]
    UnresolvableId(ResourceId),

    #[error("no record for {0}")]
    NoRecord(ResourceId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
