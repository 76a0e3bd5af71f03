//! Capture stream protocol: stable resource identity, the per-call chunk
//! payload model, and the versioned binary chunk-stream format.

pub mod call;
pub mod error;
pub mod resource;
pub mod types;
pub mod wire;

pub use call::{ApiCall, CallClass, Chunk};
pub use error::ProtocolError;
pub use resource::{RawHandle, ResourceId, ResourceType};
