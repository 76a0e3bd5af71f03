/// Errors raised while encoding or decoding the chunk stream.
///
/// `VersionMismatch` and `UnknownChunk` are corrupt-capture class: the
/// reader must refuse the stream rather than degrade silently.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("chunk too large: {0} bytes")]
    ChunkTooLarge(u32),

    #[error("truncated stream: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("format version mismatch: stream is {stream_major}.{stream_minor}, reader supports {reader_major}.x")]
    VersionMismatch {
        stream_major: u16,
        stream_minor: u16,
        reader_major: u16,
    },

    #[error("unrecognized chunk at offset {offset}: {detail}")]
    UnknownChunk { offset: usize, detail: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("decompression error: {0}")]
    Decompression(String),
}
