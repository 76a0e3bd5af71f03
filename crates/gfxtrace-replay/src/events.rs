//! The event and drawcall arenas built during the reading pass.
//!
//! Every frame chunk becomes exactly one [`Event`]; action-class chunks
//! additionally become a [`Drawcall`]. Both arenas are immutable once
//! built and index straight back into the frame chunk list, so partial
//! replay can translate event ranges to chunk ranges without re-parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

use gfxtrace_protocol::{ApiCall, CallClass, Chunk};

use crate::error::ReplayError;

/// 1-based position of a chunk within the captured frame.
/// Event 0 means "initial state only, no frame chunk executed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
         Serialize, Deserialize)]
pub struct EventId(pub u32);

impl EventId {
    pub const NONE: EventId = EventId(0);
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// How much of a replayed range actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayType {
    /// Every event in the range.
    Full,
    /// Only the final event. Assumes the preceding state is already in
    /// place from an earlier `WithoutDraw` replay of the same range.
    OnlyDraw,
    /// Everything except the final event, leaving state primed for it.
    WithoutDraw,
}

/// One frame chunk, annotated for browsing.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    /// Index into the frame chunk list.
    pub chunk_index: usize,
    pub name: &'static str,
    pub description: String,
    pub class: CallClass,
    /// Scope nesting depth at this event (render passes + debug labels).
    pub depth: u32,
}

/// One action in the frame, in issue order.
#[derive(Debug, Clone)]
pub struct Drawcall {
    pub event: EventId,
    /// 0-based index among the frame's drawcalls.
    pub index: u32,
    pub description: String,
    /// Innermost-last stack of debug labels enclosing this action.
    pub marker_path: Vec<String>,
}

/// The arenas for one captured frame.
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    events: Vec<Event>,
    drawcalls: Vec<Drawcall>,
}

impl FrameLog {
    /// One pass over the frame chunks: assign event IDs, validate scope
    /// nesting, and collect the drawcall list.
    pub fn build(frame_chunks: &[Chunk]) -> Result<FrameLog, ReplayError> {
        let mut events = Vec::with_capacity(frame_chunks.len());
        let mut drawcalls = Vec::new();
        let mut depth: u32 = 0;
        let mut labels: Vec<String> = Vec::new();

        for (chunk_index, chunk) in frame_chunks.iter().enumerate() {
            let id = EventId(chunk_index as u32 + 1);
            let call = &chunk.call;

            if call.closes_scope() {
                if depth == 0 {
                    return Err(ReplayError::UnbalancedScope { event: id });
                }
                depth -= 1;
                if matches!(call, ApiCall::EndDebugLabel) {
                    labels.pop();
                }
            }

            events.push(Event {
                id,
                chunk_index,
                name: call.name(),
                description: chunk
                    .debug_label
                    .clone()
                    .unwrap_or_else(|| call.describe()),
                class: call.class(),
                depth,
            });

            if call.class() == CallClass::Action {
                drawcalls.push(Drawcall {
                    event: id,
                    index: drawcalls.len() as u32,
                    description: call.describe(),
                    marker_path: labels.clone(),
                });
            }

            if call.opens_scope() {
                depth += 1;
                if let ApiCall::BeginDebugLabel { label } = call {
                    labels.push(label.clone());
                }
            }
        }

        if depth != 0 {
            return Err(ReplayError::UnbalancedScope {
                event: EventId(frame_chunks.len() as u32),
            });
        }
        Ok(FrameLog { events, drawcalls })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn drawcalls(&self) -> &[Drawcall] {
        &self.drawcalls
    }

    /// Last event ID in the frame, or `EventId::NONE` for an empty frame.
    pub fn last_event(&self) -> EventId {
        EventId(self.events.len() as u32)
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        if id.0 == 0 {
            return None;
        }
        self.events.get(id.0 as usize - 1)
    }

    /// The drawcall at or most recently before `id`, if any.
    pub fn drawcall_at_or_before(&self, id: EventId) -> Option<&Drawcall> {
        self.drawcalls.iter().rev().find(|d| d.event <= id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_protocol::types::SerializedRect2D;
    use gfxtrace_protocol::ResourceId;

    fn draw() -> Chunk {
        Chunk::new(ApiCall::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    fn pass_begin() -> Chunk {
        Chunk::new(ApiCall::BeginRenderPass {
            render_pass: ResourceId(1),
            framebuffer: ResourceId(2),
            render_area: SerializedRect2D {
                offset: [0, 0],
                extent: [4, 4],
            },
            clear_values: vec![],
        })
    }

    #[test]
    fn events_number_sequentially_and_track_depth() {
        let chunks = vec![
            pass_begin(),
            draw(),
            draw(),
            Chunk::new(ApiCall::EndRenderPass),
            Chunk::new(ApiCall::EndOfFrame),
        ];
        let log = FrameLog::build(&chunks).unwrap();

        assert_eq!(log.events().len(), 5);
        assert_eq!(log.events()[0].id, EventId(1));
        assert_eq!(log.events()[0].depth, 0);
        assert_eq!(log.events()[1].depth, 1);
        assert_eq!(log.events()[3].depth, 0);
        assert_eq!(log.last_event(), EventId(5));
    }

    #[test]
    fn drawcalls_carry_marker_path() {
        let chunks = vec![
            pass_begin(),
            Chunk::new(ApiCall::BeginDebugLabel {
                label: "shadow pass".to_string(),
            }),
            draw(),
            Chunk::new(ApiCall::EndDebugLabel),
            draw(),
            Chunk::new(ApiCall::EndRenderPass),
        ];
        let log = FrameLog::build(&chunks).unwrap();

        assert_eq!(log.drawcalls().len(), 2);
        assert_eq!(log.drawcalls()[0].marker_path, vec!["shadow pass"]);
        assert!(log.drawcalls()[1].marker_path.is_empty());
        assert_eq!(log.drawcalls()[1].index, 1);
    }

    #[test]
    fn unbalanced_scope_is_rejected() {
        let chunks = vec![Chunk::new(ApiCall::EndRenderPass)];
        assert!(matches!(
            FrameLog::build(&chunks),
            Err(ReplayError::UnbalancedScope { event: EventId(1) })
        ));

        let chunks = vec![pass_begin(), draw()];
        assert!(matches!(
            FrameLog::build(&chunks),
            Err(ReplayError::UnbalancedScope { .. })
        ));
    }
}
