use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

use gfxtrace_protocol::{Chunk, RawHandle, ResourceId, ResourceType};

use crate::config::CaptureSettings;
use crate::error::CoreError;

/// Which update stream a resource-record chunk belongs to. The two streams
/// have independent dirty-diversion thresholds: parameter pokes escalate
/// much faster than data uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Parameter,
    Upload,
}

/// Outcome of recording an update chunk into a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Chunk appended to the record's history.
    Recorded,
    /// Update count crossed the threshold: per-update chunking stopped and
    /// the resource is marked dirty for wholesale refetch at the next
    /// capture boundary.
    Diverted,
}

/// Per-resource container of chunks describing its creation and mutation
/// history, used to replay initial state independent of frame capture.
struct ResourceRecord {
    resource_type: ResourceType,
    /// Creation chunk followed by recorded update chunks, in order.
    chunks: Vec<Chunk>,
    parameter_updates: u32,
    upload_updates: u32,
    dirty: bool,
    /// Referenced by a chunk in the frame record being captured.
    frame_referenced: bool,
}

/// Maps live driver handles to portable resource IDs and back, across the
/// two handle spaces: "current" (the process issuing calls right now) and
/// "live" (handles recreated during replay). The two tables are keyed by
/// the same ID type but never merged; capture-time and replay-time identity
/// must not cross-talk.
pub struct ResourceManager {
    /// Current handle -> ID
    current: DashMap<RawHandle, ResourceId>,
    /// ID -> current handle (reverse direction of `current`)
    current_rev: DashMap<ResourceId, RawHandle>,
    /// ID -> handle valid during replay only
    live: DashMap<ResourceId, RawHandle>,
    records: DashMap<ResourceId, ResourceRecord>,
    /// Destroyed while still referenced by frame chunks: record retained.
    pending_destroy: DashMap<ResourceId, ()>,
    next_id: AtomicU64,
    settings: CaptureSettings,
}

impl ResourceManager {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            current: DashMap::new(),
            current_rev: DashMap::new(),
            live: DashMap::new(),
            records: DashMap::new(),
            pending_destroy: DashMap::new(),
            // Start from 1 so ResourceId::NULL never collides
            next_id: AtomicU64::new(1),
            settings,
        }
    }

    // ── Current (capture-side) identity ─────────────────────

    /// Allocate a fresh ID for a newly created handle.
    /// Registering a handle twice is a programming error.
    pub fn register_resource(
        &self,
        handle: RawHandle,
        resource_type: ResourceType,
    ) -> Result<ResourceId, CoreError> {
        if self.current.contains_key(&handle) {
            return Err(CoreError::AlreadyRegistered(handle));
        }
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.current.insert(handle, id);
        self.current_rev.insert(id, handle);
        self.records.insert(
            id,
            ResourceRecord {
                resource_type,
                chunks: Vec::new(),
                parameter_updates: 0,
                upload_updates: 0,
                dirty: false,
                frame_referenced: false,
            },
        );
        debug!(%id, handle, ?resource_type, "registered resource");
        Ok(id)
    }

    /// ID for a currently-registered handle. `None` means "not tracked":
    /// callers skip serialization for this handle, they do not fail.
    pub fn get_id(&self, handle: RawHandle) -> Option<ResourceId> {
        self.current.get(&handle).map(|v| *v)
    }

    /// Current handle for an ID, if the resource is still alive.
    pub fn get_current_resource(&self, id: ResourceId) -> Option<RawHandle> {
        self.current_rev.get(&id).map(|v| *v)
    }

    /// Invalidate the ID mapping on destroy. If frame chunks still
    /// reference the resource its record is retained until the frame
    /// record that references it is dropped.
    pub fn unregister_resource(&self, handle: RawHandle) -> Option<ResourceId> {
        let (_, id) = self.current.remove(&handle)?;
        self.current_rev.remove(&id);
        let referenced = self
            .records
            .get(&id)
            .map(|r| r.frame_referenced)
            .unwrap_or(false);
        if referenced {
            self.pending_destroy.insert(id, ());
            warn!(%id, "destroy while frame chunks still reference it; record retained");
        } else {
            self.records.remove(&id);
        }
        debug!(%id, handle, "unregistered resource");
        Some(id)
    }

    // ── Live (replay-side) identity ─────────────────────────

    /// Establish the id -> live-handle mapping when replay recreates a
    /// resource.
    pub fn add_live_resource(&self, id: ResourceId, handle: RawHandle) {
        self.live.insert(id, handle);
    }

    /// Handle created on the replay side for the original ID.
    /// Missing IDs indicate a corrupt or out-of-order capture and are fatal
    /// for the replay attempt.
    pub fn get_live_resource(&self, id: ResourceId) -> Result<RawHandle, CoreError> {
        self.live
            .get(&id)
            .map(|v| *v)
            .ok_or(CoreError::UnresolvableId(id))
    }

    pub fn has_live_resource(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn remove_live_resource(&self, id: ResourceId) -> Option<RawHandle> {
        self.live.remove(&id).map(|(_, h)| h)
    }

    /// Drop all live mappings, e.g. when the replay context is reset.
    pub fn clear_live(&self) {
        self.live.clear();
    }

    // ── Resource records ────────────────────────────────────

    /// Append a creation chunk to the record. Always recorded.
    pub fn record_creation_chunk(&self, id: ResourceId, chunk: Chunk) -> Result<(), CoreError> {
        let mut record = self.records.get_mut(&id).ok_or(CoreError::NoRecord(id))?;
        record.chunks.push(chunk);
        Ok(())
    }

    /// Append an update chunk, subject to the dirty-diversion threshold:
    /// after N updates of the same kind the record stops growing and the
    /// resource is refetched wholesale at the next capture boundary.
    pub fn record_update_chunk(
        &self,
        id: ResourceId,
        kind: UpdateKind,
        chunk: Chunk,
    ) -> Result<RecordOutcome, CoreError> {
        let mut record = self.records.get_mut(&id).ok_or(CoreError::NoRecord(id))?;
        let (count, threshold) = match kind {
            UpdateKind::Parameter => (
                &mut record.parameter_updates,
                self.settings.parameter_dirty_threshold,
            ),
            UpdateKind::Upload => (
                &mut record.upload_updates,
                self.settings.upload_dirty_threshold,
            ),
        };
        if *count >= threshold {
            if !record.dirty {
                debug!(%id, ?kind, "update threshold crossed; marking dirty");
            }
            record.dirty = true;
            return Ok(RecordOutcome::Diverted);
        }
        *count += 1;
        record.chunks.push(chunk);
        Ok(RecordOutcome::Recorded)
    }

    /// Force a wholesale refetch of `id` at the next capture boundary,
    /// regardless of update counters. Used when a resource's contents
    /// change through a path that leaves no chunk in its record, e.g. a
    /// copy executed outside a frame capture.
    pub fn mark_dirty(&self, id: ResourceId) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if !record.dirty {
                debug!(%id, "marked dirty outside the update-count path");
            }
            record.dirty = true;
        }
    }

    /// Dirty resources, clearing the flags. The capture boundary replaces
    /// each one's accumulated update history with a wholesale snapshot.
    pub fn take_dirty(&self) -> Vec<ResourceId> {
        let dirty: Vec<ResourceId> = self
            .records
            .iter()
            .filter(|r| r.value().dirty)
            .map(|r| *r.key())
            .collect();
        for id in &dirty {
            if let Some(mut record) = self.records.get_mut(id) {
                record.dirty = false;
            }
        }
        dirty
    }

    /// Replace a dirty record's update history with one wholesale snapshot
    /// chunk, keeping the creation chunk. Update counters restart.
    pub fn reset_record_with_snapshot(
        &self,
        id: ResourceId,
        snapshot: Chunk,
    ) -> Result<(), CoreError> {
        let mut record = self.records.get_mut(&id).ok_or(CoreError::NoRecord(id))?;
        record
            .chunks
            .retain(|c| c.call.class() == gfxtrace_protocol::CallClass::Creation);
        record.chunks.push(snapshot);
        record.parameter_updates = 0;
        record.upload_updates = 0;
        Ok(())
    }

    /// The resource's initial-state chunk history, in record order.
    pub fn initial_chunks(&self, id: ResourceId) -> Result<Vec<Chunk>, CoreError> {
        self.records
            .get(&id)
            .map(|r| r.chunks.clone())
            .ok_or(CoreError::NoRecord(id))
    }

    pub fn resource_type(&self, id: ResourceId) -> Option<ResourceType> {
        self.records.get(&id).map(|r| r.resource_type)
    }

    /// Mark resources as referenced by the frame record being captured, so
    /// a later destroy retains their records instead of dangling.
    pub fn mark_frame_referenced(&self, ids: &[ResourceId]) {
        for id in ids {
            if let Some(mut record) = self.records.get_mut(id) {
                record.frame_referenced = true;
            }
        }
    }

    /// All resources with records, in ID order. Used when assembling the
    /// capture-scope header's initial-state list.
    pub fn tracked_resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxtrace_protocol::call::ApiCall;
    use gfxtrace_protocol::types::SerializedBufferCreateInfo;

    fn manager() -> ResourceManager {
        ResourceManager::new(CaptureSettings {
            parameter_dirty_threshold: 3,
            upload_dirty_threshold: 5,
        })
    }

    fn buffer_chunk(id: ResourceId) -> Chunk {
        Chunk::new(ApiCall::CreateBuffer {
            id,
            info: SerializedBufferCreateInfo {
                size: 64,
                usage: 0,
                sharing_mode: 0,
            },
        })
    }

    #[test]
    fn ids_are_unique_across_session() {
        let rm = manager();
        let a = rm.register_resource(0x100, ResourceType::Buffer).unwrap();
        let b = rm.register_resource(0x200, ResourceType::Buffer).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());

        // Re-registering a freed handle value still yields a fresh ID
        rm.unregister_resource(0x100);
        let c = rm.register_resource(0x100, ResourceType::Image).unwrap();
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn double_registration_is_rejected() {
        let rm = manager();
        rm.register_resource(0x100, ResourceType::Buffer).unwrap();
        assert!(matches!(
            rm.register_resource(0x100, ResourceType::Buffer),
            Err(CoreError::AlreadyRegistered(0x100))
        ));
    }

    #[test]
    fn untracked_handle_yields_none() {
        let rm = manager();
        assert_eq!(rm.get_id(0xDEAD), None);
    }

    #[test]
    fn live_and_current_tables_are_independent() {
        let rm = manager();
        let id = rm.register_resource(0x100, ResourceType::Buffer).unwrap();
        assert!(rm.get_live_resource(id).is_err());

        rm.add_live_resource(id, 0x9900);
        assert_eq!(rm.get_live_resource(id).unwrap(), 0x9900);
        // Current side unchanged by the live mapping
        assert_eq!(rm.get_current_resource(id), Some(0x100));
    }

    #[test]
    fn unresolvable_live_id_is_fatal() {
        let rm = manager();
        match rm.get_live_resource(ResourceId(999)) {
            Err(CoreError::UnresolvableId(id)) => assert_eq!(id, ResourceId(999)),
            other => panic!("expected UnresolvableId, got {other:?}"),
        }
    }

    #[test]
    fn update_chunks_divert_after_threshold() {
        let rm = manager();
        let id = rm.register_resource(0x100, ResourceType::Image).unwrap();
        rm.record_creation_chunk(id, buffer_chunk(id)).unwrap();

        let poke = Chunk::new(ApiCall::SetTextureParameter {
            image: id,
            parameter: 1,
            value: 2,
        });
        for _ in 0..3 {
            assert_eq!(
                rm.record_update_chunk(id, UpdateKind::Parameter, poke.clone())
                    .unwrap(),
                RecordOutcome::Recorded
            );
        }
        assert_eq!(
            rm.record_update_chunk(id, UpdateKind::Parameter, poke.clone())
                .unwrap(),
            RecordOutcome::Diverted
        );
        assert_eq!(rm.take_dirty(), vec![id]);
        // Flags cleared by take_dirty
        assert!(rm.take_dirty().is_empty());

        // 1 creation + 3 recorded pokes
        assert_eq!(rm.initial_chunks(id).unwrap().len(), 4);
    }

    #[test]
    fn snapshot_reset_collapses_update_history() {
        let rm = manager();
        let id = rm.register_resource(0x100, ResourceType::Image).unwrap();
        rm.record_creation_chunk(id, buffer_chunk(id)).unwrap();
        let poke = Chunk::new(ApiCall::SetTextureParameter {
            image: id,
            parameter: 1,
            value: 2,
        });
        for _ in 0..3 {
            rm.record_update_chunk(id, UpdateKind::Parameter, poke.clone())
                .unwrap();
        }

        let snapshot = Chunk::new(ApiCall::UploadTexture {
            image: id,
            mip_level: 0,
            array_layer: 0,
            offset: [0; 3],
            extent: [4, 4, 1],
            data: vec![0xAB; 64],
            source_neutralized: true,
        });
        rm.reset_record_with_snapshot(id, snapshot).unwrap();

        let chunks = rm.initial_chunks(id).unwrap();
        assert_eq!(chunks.len(), 2); // creation + snapshot
        // Counter restarted: updates record again
        assert_eq!(
            rm.record_update_chunk(id, UpdateKind::Parameter, poke).unwrap(),
            RecordOutcome::Recorded
        );
    }

    #[test]
    fn destroy_while_frame_referenced_retains_record() {
        let rm = manager();
        let id = rm.register_resource(0x100, ResourceType::Buffer).unwrap();
        rm.record_creation_chunk(id, buffer_chunk(id)).unwrap();
        rm.mark_frame_referenced(&[id]);

        rm.unregister_resource(0x100);
        // Record still available for initial-state replay
        assert_eq!(rm.initial_chunks(id).unwrap().len(), 1);
        // But the handle is no longer tracked
        assert_eq!(rm.get_id(0x100), None);
    }
}
