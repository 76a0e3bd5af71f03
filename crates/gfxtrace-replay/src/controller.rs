//! The replay state machine.
//!
//! Loading runs the reading pass: gate the format version, split the
//! stream into initial-state and frame chunk lists, build the event and
//! drawcall arenas, and optionally validate referential integrity, all
//! before a single driver call is issued. Execution then applies initial
//! state once and walks forward through frame events; jumping backwards
//! tears the live state down and rebuilds it from the start.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use gfxtrace_core::{CaptureSettings, Mode, ReplayDriver, ReplaySettings, ResourceManager};
use gfxtrace_protocol::wire::{ChunkReader, StreamHeader, StreamRecord};
use gfxtrace_protocol::{ApiCall, Chunk, ResourceId};

use crate::error::ReplayError;
use crate::events::{Event, EventId, FrameLog, ReplayType};
use crate::executor::ChunkExecutor;

pub struct ReplayController<D: ReplayDriver> {
    driver: D,
    resources: ResourceManager,
    settings: ReplaySettings,
    header: StreamHeader,
    initial_chunks: Vec<Chunk>,
    frame_chunks: Vec<Chunk>,
    log: FrameLog,
    mode: Mode,
    /// Last frame event executed; NONE when only initial state is applied.
    position: EventId,
    initial_applied: bool,
}

impl<D: ReplayDriver> ReplayController<D> {
    /// Reading pass over a serialized capture. No driver calls are made.
    pub fn load(bytes: &[u8], driver: D, settings: ReplaySettings) -> Result<Self, ReplayError> {
        let mut reader = ChunkReader::new(bytes);
        let header = match reader.next_record()? {
            Some(StreamRecord::Header(h)) => h,
            Some(StreamRecord::Chunk(_)) => {
                return Err(ReplayError::MalformedStream(
                    "stream does not begin with a capture-scope header".to_string(),
                ))
            }
            None => return Err(ReplayError::MalformedStream("empty stream".to_string())),
        };
        header.check_version()?;
        if header.minor_version_skew() {
            warn!(
                stream_minor = header.version_minor,
                "minor format version skew; applying reader-side compatibility"
            );
        }
        if header.incomplete {
            warn!("capture is flagged incomplete; replay may have gaps");
        }

        let mut chunks = Vec::new();
        while let Some(record) = reader.next_record()? {
            match record {
                StreamRecord::Chunk(c) => chunks.push(c),
                StreamRecord::Header(_) => {
                    return Err(ReplayError::MalformedStream(format!(
                        "second scope header at offset {}",
                        reader.offset()
                    )))
                }
            }
        }

        let split = header.initial_chunk_count as usize;
        if split > chunks.len() {
            return Err(ReplayError::MalformedStream(format!(
                "header claims {split} initial chunks, stream has {}",
                chunks.len()
            )));
        }
        let frame_chunks = chunks.split_off(split);
        let initial_chunks = chunks;

        let log = FrameLog::build(&frame_chunks)?;
        if settings.validate_references {
            validate_references(&initial_chunks, &frame_chunks)?;
        }

        info!(
            frame = header.frame_number,
            initial = initial_chunks.len(),
            events = log.events().len(),
            drawcalls = log.drawcalls().len(),
            "capture loaded"
        );

        Ok(Self {
            driver,
            resources: ResourceManager::new(CaptureSettings::default()),
            settings,
            header,
            initial_chunks,
            frame_chunks,
            log,
            mode: Mode::Reading,
            position: EventId::NONE,
            initial_applied: false,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    pub fn events(&self) -> &[Event] {
        &self.log.events()[..]
    }

    pub fn frame_log(&self) -> &FrameLog {
        &self.log
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn position(&self) -> EventId {
        self.position
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    pub(crate) fn frame_chunks(&self) -> &[Chunk] {
        &self.frame_chunks
    }

    pub(crate) fn initial_chunks(&self) -> &[Chunk] {
        &self.initial_chunks
    }

    /// Current-to-live identity tables; lets callers map captured IDs to
    /// the handles this replay created.
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub(crate) fn driver_and_resources(&mut self) -> (&mut D, &ResourceManager) {
        (&mut self.driver, &self.resources)
    }

    /// Recreate every captured resource and replay its record, then drain.
    /// Idempotent at the state-machine level: applying twice resets first.
    pub fn apply_initial_state(&mut self) -> Result<(), ReplayError> {
        if self.initial_applied {
            self.teardown_live_state()?;
        }
        self.mode = Mode::Executing;
        debug!(chunks = self.initial_chunks.len(), "applying initial state");
        let mut executor = ChunkExecutor::new(&mut self.driver, &self.resources);
        for chunk in &self.initial_chunks {
            executor.execute(&chunk.call)?;
        }
        self.driver.wait_idle()?;
        self.initial_applied = true;
        self.position = EventId::NONE;
        Ok(())
    }

    /// Destroy all live resources and clear the live table. Creation
    /// chunks are the authority on what exists and with which type.
    fn teardown_live_state(&mut self) -> Result<(), ReplayError> {
        debug!("tearing down live replay state");
        self.driver.wait_idle()?;
        for chunk in self.initial_chunks.iter().chain(self.frame_chunks.iter()) {
            let Some((id, resource_type)) = chunk.call.created_id() else {
                continue;
            };
            let Ok(handle) = self.resources.get_live_resource(id) else {
                continue;
            };
            // Best effort: a resource the frame already destroyed is fine
            if let Err(e) = self.driver.destroy_resource(handle, resource_type) {
                debug!(%id, error = %e, "teardown destroy skipped");
            }
        }
        self.resources.clear_live();
        self.initial_applied = false;
        self.position = EventId::NONE;
        Ok(())
    }

    fn check_event(&self, event: EventId) -> Result<(), ReplayError> {
        if event.0 == 0 || event > self.log.last_event() {
            return Err(ReplayError::EventOutOfRange {
                event,
                last: self.log.last_event().0,
            });
        }
        Ok(())
    }

    fn execute_event(&mut self, event: EventId) -> Result<(), ReplayError> {
        let chunk_index = event.0 as usize - 1;
        let call = self.frame_chunks[chunk_index].call.clone();
        let mut executor = ChunkExecutor::new(&mut self.driver, &self.resources);
        executor.execute(&call)?;
        Ok(())
    }

    /// Replay frame events `start..=end` under `replay_type`.
    ///
    /// Forward progress is incremental: events already executed are not
    /// re-run, and a gap between the current position and `start` is
    /// caught up in full so intervening state is never skipped. Jumping
    /// backwards rebuilds from initial state first, which makes replaying
    /// an already-covered range a no-op and keeps partial replay
    /// idempotent.
    pub fn replay_log(
        &mut self,
        start: EventId,
        end: EventId,
        replay_type: ReplayType,
    ) -> Result<(), ReplayError> {
        self.check_event(end)?;
        if start.0 != 0 {
            self.check_event(start)?;
        }
        if !self.initial_applied {
            self.apply_initial_state()?;
        }
        self.mode = Mode::Executing;

        if replay_type == ReplayType::OnlyDraw {
            // The caller primed state with WithoutDraw over the same range
            debug!(%end, "replaying single event");
            self.execute_event(end)?;
            self.position = end;
            return Ok(());
        }

        if end <= self.position {
            // Backwards jump: rebuild from the start of the frame
            debug!(%end, position = %self.position, "backwards replay, rebuilding state");
            self.apply_initial_state()?;
        }

        let first = self.position.0 + 1;
        let last_full = match replay_type {
            ReplayType::WithoutDraw => end.0 - 1,
            ReplayType::Full => end.0,
            ReplayType::OnlyDraw => unreachable!(),
        };
        for ev in first..=last_full {
            self.execute_event(EventId(ev))?;
        }
        self.position = EventId(last_full.max(self.position.0));
        Ok(())
    }

    /// Replay the whole frame from initial state.
    pub fn replay_all(&mut self) -> Result<(), ReplayError> {
        let last = self.log.last_event();
        if last == EventId::NONE {
            return self.apply_initial_state();
        }
        self.replay_log(EventId(1), last, ReplayType::Full)
    }

    /// Drain the driver; used around readbacks and overlay passes.
    pub fn drain(&mut self) -> Result<(), ReplayError> {
        Ok(self.driver.wait_idle()?)
    }
}

/// Referential integrity over the whole stream: every ID a chunk consumes
/// must be created by an earlier chunk. Runs during reading, so damage is
/// reported before any driver work starts.
fn validate_references(
    initial_chunks: &[Chunk],
    frame_chunks: &[Chunk],
) -> Result<(), ReplayError> {
    let mut created: HashSet<ResourceId> = HashSet::new();
    let mut check = |call: &ApiCall| -> Result<(), ReplayError> {
        if let Some((id, _)) = call.created_id() {
            created.insert(id);
            // A creation's own references (views, framebuffers) still need
            // their dependencies, which referenced_ids also yields
        }
        for id in call.referenced_ids() {
            if !created.contains(&id) {
                return Err(ReplayError::UnresolvedReference(id));
            }
        }
        Ok(())
    };
    for chunk in initial_chunks.iter().chain(frame_chunks) {
        check(&chunk.call)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_core::SoftwareDriver;
    use gfxtrace_protocol::types::SerializedBufferCreateInfo;
    use gfxtrace_protocol::wire::{encode_chunk, encode_header};

    fn stream_with(initial: Vec<Chunk>, frame: Vec<Chunk>) -> Vec<u8> {
        let mut header = StreamHeader::new(0, vec![]);
        header.initial_chunk_count = initial.len() as u32;
        let mut out = encode_header(&header).unwrap();
        for c in initial.iter().chain(frame.iter()) {
            out.extend(encode_chunk(c).unwrap());
        }
        out
    }

    fn create_buffer(id: u64) -> Chunk {
        Chunk::new(ApiCall::CreateBuffer {
            id: ResourceId(id),
            info: SerializedBufferCreateInfo {
                size: 16,
                usage: 0,
                sharing_mode: 0,
            },
        })
    }

    #[test]
    fn load_splits_initial_and_frame_chunks() {
        let bytes = stream_with(
            vec![create_buffer(1)],
            vec![
                Chunk::new(ApiCall::BindVertexBuffers {
                    first_binding: 0,
                    buffers: vec![ResourceId(1)],
                    offsets: vec![0],
                }),
                Chunk::new(ApiCall::EndOfFrame),
            ],
        );
        let controller =
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default())
                .unwrap();
        assert_eq!(controller.initial_chunks().len(), 1);
        assert_eq!(controller.events().len(), 2);
        assert_eq!(controller.mode(), Mode::Reading);
    }

    #[test]
    fn missing_header_is_rejected() {
        let bytes = encode_chunk(&create_buffer(1)).unwrap();
        assert!(matches!(
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()),
            Err(ReplayError::MalformedStream(_))
        ));
    }

    #[test]
    fn dangling_reference_fails_reading_pass() {
        let bytes = stream_with(
            vec![],
            vec![Chunk::new(ApiCall::BindVertexBuffers {
                first_binding: 0,
                buffers: vec![ResourceId(99)],
                offsets: vec![0],
            })],
        );
        assert!(matches!(
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default()),
            Err(ReplayError::UnresolvedReference(ResourceId(99)))
        ));
    }

    #[test]
    fn replaying_a_covered_range_again_is_a_no_op() {
        let bytes = stream_with(
            vec![create_buffer(1)],
            vec![
                Chunk::new(ApiCall::UpdateBuffer {
                    buffer: ResourceId(1),
                    offset: 0,
                    data: vec![7; 8],
                }),
                Chunk::new(ApiCall::EndOfFrame),
            ],
        );
        let mut controller =
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default())
                .unwrap();
        controller
            .replay_log(EventId(1), EventId(1), ReplayType::Full)
            .unwrap();
        let checksum = controller.driver_mut().state_checksum();
        controller
            .replay_log(EventId(1), EventId(1), ReplayType::Full)
            .unwrap();
        assert_eq!(controller.driver_mut().state_checksum(), checksum);
    }

    #[test]
    fn event_out_of_range_is_rejected() {
        let bytes = stream_with(vec![], vec![Chunk::new(ApiCall::EndOfFrame)]);
        let mut controller =
            ReplayController::load(&bytes, SoftwareDriver::new(), ReplaySettings::default())
                .unwrap();
        assert!(matches!(
            controller.replay_log(EventId(1), EventId(9), ReplayType::Full),
            Err(ReplayError::EventOutOfRange { .. })
        ));
    }
}
