use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::call::Chunk;
use crate::error::ProtocolError;
use crate::resource::ResourceId;

/// Chunk stream magic bytes: "GT"
pub const MAGIC: [u8; 2] = [0x47, 0x54];

/// Stream format version. Major mismatches are fatal; minor skew is
/// tolerated with reader-side workarounds.
pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 2;

/// Maximum chunk payload size: 256 MB
pub const MAX_CHUNK_SIZE: u32 = 256 * 1024 * 1024;

/// Chunk frame header size in bytes: magic(2) + flags(1) + length(4) = 7
pub const HEADER_SIZE: usize = 7;

/// Minimum payload size to attempt LZ4 compression (bytes).
/// Payloads smaller than this are written uncompressed to avoid overhead.
pub const COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Chunk frame flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        const COMPRESSED   = 0b0000_0001;
        /// Payload is a capture-scope [`StreamHeader`], not a [`Chunk`].
        const SCOPE_HEADER = 0b0000_0010;
    }
}

/// Capture-scope header preceding one captured frame's chunk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StreamHeader {
    pub version_major: u16,
    pub version_minor: u16,
    /// Application frame number at which capture triggered.
    pub frame_number: u64,
    /// Resources whose initial-state records must replay before the frame.
    pub initial_resources: Vec<ResourceId>,
    /// Number of initial-state chunks preceding the frame's chunk run.
    pub initial_chunk_count: u32,
    /// Set when capture-time issues mean the frame may have gaps.
    pub incomplete: bool,
}

impl StreamHeader {
    pub fn new(frame_number: u64, initial_resources: Vec<ResourceId>) -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            frame_number,
            initial_resources,
            initial_chunk_count: 0,
            incomplete: false,
        }
    }

    /// Gate the reader on the embedded format version.
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version_major != FORMAT_VERSION_MAJOR {
            return Err(ProtocolError::VersionMismatch {
                stream_major: self.version_major,
                stream_minor: self.version_minor,
                reader_major: FORMAT_VERSION_MAJOR,
            });
        }
        Ok(())
    }

    /// Minor skew is compatible but worth surfacing to the caller.
    pub fn minor_version_skew(&self) -> bool {
        self.version_minor != FORMAT_VERSION_MINOR
    }
}

fn encode_frame(payload: &[u8], mut flags: ChunkFlags) -> Vec<u8> {
    let (final_payload, compression_flag) = if payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(payload);
        if compressed.len() < payload.len() {
            (Cow::Owned(compressed), ChunkFlags::COMPRESSED)
        } else {
            // Compression didn't help, write uncompressed
            (Cow::Borrowed(payload), ChunkFlags::empty())
        }
    } else {
        (Cow::Borrowed(payload), ChunkFlags::empty())
    };

    flags |= compression_flag;
    let payload_len = final_payload.len() as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(flags.bits());
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&final_payload);
    frame
}

/// Encode one chunk into a length-prefixed frame.
pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, ProtocolError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(chunk)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(encode_frame(&payload, ChunkFlags::empty()))
}

/// Encode a capture-scope header frame.
pub fn encode_header(header: &StreamHeader) -> Result<Vec<u8>, ProtocolError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(header)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(encode_frame(&payload, ChunkFlags::SCOPE_HEADER))
}

/// Decompress if flagged, then copy into an [`rkyv::util::AlignedVec`].
/// The 7-byte frame header means in-place payload slices never satisfy the
/// archived types' alignment, so decoding always goes through an aligned
/// buffer.
fn payload_aligned(
    payload: &[u8],
    flags: ChunkFlags,
) -> Result<rkyv::util::AlignedVec, ProtocolError> {
    let raw: Cow<'_, [u8]> = if flags.contains(ChunkFlags::COMPRESSED) {
        Cow::Owned(
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| ProtocolError::Decompression(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(payload)
    };
    let mut aligned = rkyv::util::AlignedVec::with_capacity(raw.len());
    aligned.extend_from_slice(&raw);
    Ok(aligned)
}

/// One decoded frame from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Header(StreamHeader),
    Chunk(Chunk),
}

/// Cursor-based reader over a chunk stream byte slice.
pub struct ChunkReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Byte offset of the next unread frame, for error context.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decode the next frame, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<StreamRecord>, ProtocolError> {
        if self.offset == self.data.len() {
            return Ok(None);
        }
        let remaining = &self.data[self.offset..];
        if remaining.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: remaining.len(),
            });
        }

        if remaining[0] != MAGIC[0] || remaining[1] != MAGIC[1] {
            return Err(ProtocolError::InvalidMagic);
        }
        let flags = ChunkFlags::from_bits_truncate(remaining[2]);
        let length =
            u32::from_le_bytes([remaining[3], remaining[4], remaining[5], remaining[6]]);
        if length > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ChunkTooLarge(length));
        }
        let length = length as usize;
        if remaining.len() < HEADER_SIZE + length {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE + length,
                available: remaining.len(),
            });
        }

        let frame_offset = self.offset;
        let payload = &remaining[HEADER_SIZE..HEADER_SIZE + length];
        let data = payload_aligned(payload, flags)?;

        let record = if flags.contains(ChunkFlags::SCOPE_HEADER) {
            let header = rkyv::from_bytes::<StreamHeader, rkyv::rancor::Error>(&data)
                .map_err(|e| ProtocolError::UnknownChunk {
                    offset: frame_offset,
                    detail: e.to_string(),
                })?;
            StreamRecord::Header(header)
        } else {
            let chunk = rkyv::from_bytes::<Chunk, rkyv::rancor::Error>(&data).map_err(
                |e| ProtocolError::UnknownChunk {
                    offset: frame_offset,
                    detail: e.to_string(),
                },
            )?;
            StreamRecord::Chunk(chunk)
        };

        self.offset += HEADER_SIZE + length;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ApiCall;

    #[test]
    fn chunk_frame_round_trip() {
        let chunk = Chunk::new(ApiCall::Draw {
            vertex_count: 6,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        });
        let bytes = encode_chunk(&chunk).unwrap();
        assert_eq!(&bytes[..2], &MAGIC);

        let mut reader = ChunkReader::new(&bytes);
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record, StreamRecord::Chunk(chunk));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn large_payload_is_compressed() {
        // A zero-filled texture payload compresses far below the original
        let chunk = Chunk::new(ApiCall::UploadTexture {
            image: ResourceId(7),
            mip_level: 0,
            array_layer: 0,
            offset: [0; 3],
            extent: [64, 64, 1],
            data: vec![0u8; 64 * 64 * 4],
            source_neutralized: false,
        });
        let bytes = encode_chunk(&chunk).unwrap();
        assert!(bytes.len() < 64 * 64 * 4);
        let flags = ChunkFlags::from_bits_truncate(bytes[2]);
        assert!(flags.contains(ChunkFlags::COMPRESSED));

        let mut reader = ChunkReader::new(&bytes);
        match reader.next_record().unwrap().unwrap() {
            StreamRecord::Chunk(decoded) => assert_eq!(decoded, chunk),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn records_decode_at_unaligned_offsets() {
        // Frames start at offsets 0, 7, 14, ... in a packed stream; none
        // of the payload slices is aligned for the archived types.
        let header = StreamHeader::new(9, vec![]);
        let chunks = [
            Chunk::new(ApiCall::EndOfFrame),
            Chunk::new(ApiCall::Draw {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            }),
        ];
        let mut bytes = encode_header(&header).unwrap();
        for chunk in &chunks {
            bytes.extend_from_slice(&encode_chunk(chunk).unwrap());
        }

        let mut reader = ChunkReader::new(&bytes);
        assert_eq!(
            reader.next_record().unwrap().unwrap(),
            StreamRecord::Header(header)
        );
        for chunk in chunks {
            assert_eq!(
                reader.next_record().unwrap().unwrap(),
                StreamRecord::Chunk(chunk)
            );
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn header_version_gate() {
        let mut header = StreamHeader::new(42, vec![ResourceId(1)]);
        assert!(header.check_version().is_ok());

        header.version_major += 1;
        match header.check_version() {
            Err(ProtocolError::VersionMismatch { stream_major, .. }) => {
                assert_eq!(stream_major, FORMAT_VERSION_MAJOR + 1)
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let chunk = Chunk::new(ApiCall::EndOfFrame);
        let bytes = encode_chunk(&chunk).unwrap();
        let mut reader = ChunkReader::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            reader.next_record(),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_chunk(&Chunk::new(ApiCall::EndOfFrame)).unwrap();
        bytes[0] = 0xFF;
        let mut reader = ChunkReader::new(&bytes);
        assert!(matches!(
            reader.next_record(),
            Err(ProtocolError::InvalidMagic)
        ));
    }
}
