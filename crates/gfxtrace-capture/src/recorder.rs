use tracing::{debug, info};

use gfxtrace_protocol::wire::{encode_chunk, encode_header, StreamHeader};
use gfxtrace_protocol::{Chunk, ProtocolError, ResourceId};

use crate::error::CaptureError;

/// A finished frame capture, ready to serialize to the container format.
#[derive(Debug, Clone)]
pub struct CompletedCapture {
    pub header: StreamHeader,
    /// Initial-state chunks, fully replayed before any frame chunk.
    pub initial_chunks: Vec<Chunk>,
    /// The frame's calls, in the exact order they occurred.
    pub frame_chunks: Vec<Chunk>,
}

impl CompletedCapture {
    /// Serialize to the chunk stream format: scope header, then initial
    /// state, then the frame run.
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = encode_header(&self.header)?;
        for chunk in self.initial_chunks.iter().chain(self.frame_chunks.iter()) {
            out.extend_from_slice(&encode_chunk(chunk)?);
        }
        Ok(out)
    }
}

struct OpenFrame {
    frame_number: u64,
    chunks: Vec<Chunk>,
}

/// Buffers the ordered chunk sequence for the frame being captured.
///
/// Chunk order is the ground truth for replay determinism: appends happen
/// in call order and are never reordered, including across command-scope
/// boundaries.
pub struct FrameRecorder {
    requested: bool,
    open: Option<OpenFrame>,
    completed: Option<CompletedCapture>,
    incomplete: bool,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self {
            requested: false,
            open: None,
            completed: None,
            incomplete: false,
        }
    }

    /// Ask for a capture starting at the next frame boundary. May never
    /// trigger if the boundary never occurs; see
    /// [`FrameRecorder::has_successful_capture`].
    pub fn attempt_capture(&mut self) {
        info!("capture requested for next frame boundary");
        self.requested = true;
    }

    pub fn is_capture_requested(&self) -> bool {
        self.requested
    }

    pub fn is_frame_open(&self) -> bool {
        self.open.is_some()
    }

    /// Open a new ordered chunk list for `frame_number`.
    pub fn begin_capture_frame(&mut self, frame_number: u64) -> Result<(), CaptureError> {
        if self.open.is_some() {
            return Err(CaptureError::FrameAlreadyOpen);
        }
        self.requested = false;
        self.incomplete = false;
        info!(frame_number, "capture frame opened");
        self.open = Some(OpenFrame {
            frame_number,
            chunks: Vec::new(),
        });
        Ok(())
    }

    /// Append one chunk in call order. Only valid while a frame is open.
    pub fn append(&mut self, chunk: Chunk) -> Result<(), CaptureError> {
        let frame = self.open.as_mut().ok_or(CaptureError::NoOpenFrame)?;
        frame.chunks.push(chunk);
        Ok(())
    }

    /// Flag that recording logic was missing for some intercepted call:
    /// capture proceeds but the frame is marked potentially incomplete.
    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    /// Close the open list and finalize the capture-scope header.
    pub fn end_capture_frame(
        &mut self,
        initial_resources: Vec<ResourceId>,
        initial_chunks: Vec<Chunk>,
    ) -> Result<(), CaptureError> {
        let frame = self.open.take().ok_or(CaptureError::NoOpenFrame)?;
        let mut header = StreamHeader::new(frame.frame_number, initial_resources);
        header.initial_chunk_count = initial_chunks.len() as u32;
        header.incomplete = self.incomplete;
        debug!(
            frame_number = frame.frame_number,
            chunks = frame.chunks.len(),
            initial = initial_chunks.len(),
            incomplete = self.incomplete,
            "capture frame closed"
        );
        self.completed = Some(CompletedCapture {
            header,
            initial_chunks,
            frame_chunks: frame.chunks,
        });
        Ok(())
    }

    /// Whether a requested capture actually produced a usable frame record.
    pub fn has_successful_capture(&self) -> bool {
        self.completed.is_some()
    }

    pub fn capture(&self) -> Option<&CompletedCapture> {
        self.completed.as_ref()
    }

    pub fn take_capture(&mut self) -> Option<CompletedCapture> {
        self.completed.take()
    }
}

impl Default for FrameRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_protocol::call::ApiCall;

    #[test]
    fn chunks_keep_call_order() {
        let mut recorder = FrameRecorder::new();
        recorder.begin_capture_frame(3).unwrap();
        for i in 0..5u32 {
            recorder
                .append(Chunk::new(ApiCall::Draw {
                    vertex_count: i,
                    instance_count: 1,
                    first_vertex: 0,
                    first_instance: 0,
                }))
                .unwrap();
        }
        recorder.end_capture_frame(vec![], vec![]).unwrap();

        let capture = recorder.capture().unwrap();
        let counts: Vec<u32> = capture
            .frame_chunks
            .iter()
            .map(|c| match &c.call {
                ApiCall::Draw { vertex_count, .. } => *vertex_count,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(counts, vec![0, 1, 2, 3, 4]);
        assert_eq!(capture.header.frame_number, 3);
    }

    #[test]
    fn append_outside_frame_fails() {
        let mut recorder = FrameRecorder::new();
        assert!(matches!(
            recorder.append(Chunk::new(ApiCall::EndOfFrame)),
            Err(CaptureError::NoOpenFrame)
        ));
    }

    #[test]
    fn capture_only_succeeds_after_frame_closes() {
        let mut recorder = FrameRecorder::new();
        recorder.attempt_capture();
        assert!(recorder.is_capture_requested());
        assert!(!recorder.has_successful_capture());

        recorder.begin_capture_frame(0).unwrap();
        assert!(!recorder.is_capture_requested());
        assert!(!recorder.has_successful_capture());

        recorder.end_capture_frame(vec![], vec![]).unwrap();
        assert!(recorder.has_successful_capture());
    }

    #[test]
    fn incomplete_flag_lands_in_header() {
        let mut recorder = FrameRecorder::new();
        recorder.begin_capture_frame(0).unwrap();
        recorder.mark_incomplete();
        recorder.end_capture_frame(vec![], vec![]).unwrap();
        assert!(recorder.capture().unwrap().header.incomplete);
    }
}
