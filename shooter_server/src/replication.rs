//! Delta replication.
//!
//! Once per tick, after simulation:
//! 1. [`Replicator::bake`] re-renders the partial and full snapshot of every
//!    object marked dirty this tick.
//! 2. [`Replicator::serve_viewers`] builds one [`UpdatePacket`] per viewer
//!    from the difference between what it saw last tick and what it sees
//!    now, copying the cached snapshot bytes into the viewer's buffer.
//! 3. [`Replicator::end_tick`] clears the dirty and deleted bookkeeping.
//!
//! Per viewer and object the rules are:
//! - left the view, or deleted while visible: listed as deleted
//! - entered the view, or full-dirty: full snapshot
//! - partial-dirty and not already sent full: partial snapshot
//! - otherwise nothing is sent

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use shooter_shared::{
    bitstream::{BitStream, BitStreamError},
    config::PayloadSizes,
    object::{ObjectId, ObjectKind, MAX_OBJECT_ID},
    packets::{BulletEvent, ObjectEntry, ObjectPayload, PlayerData, UpdatePacket},
    protocol::{PacketRegistry, PacketStream},
};
use tracing::{debug, warn};

use crate::objects::{NetObject, ObjectArena};

bitflags! {
    /// What changed about an object this tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u8 {
        const PARTIAL = 1 << 0;
        const FULL = 1 << 1;
    }
}

/// Replication errors. All of them are local to one viewer or object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The update did not fit the viewer's outgoing buffer. The viewer gets
    /// a full resend next tick.
    BufferOverflow { needed: usize, available: usize },
    /// An object's snapshot did not fit its configured payload size.
    SnapshotTooLarge { id: ObjectId, kind: ObjectKind },
    Stream(BitStreamError),
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::BufferOverflow { needed, available } => write!(
                f,
                "update overflowed viewer buffer: needed {needed} bits, {available} available"
            ),
            ReplicationError::SnapshotTooLarge { id, kind } => {
                write!(f, "snapshot of {kind:?} {id} exceeds its payload size")
            }
            ReplicationError::Stream(e) => write!(f, "replication stream error: {e}"),
        }
    }
}

impl std::error::Error for ReplicationError {}

/// Pre-rendered snapshots of one object, rebuilt only when dirty.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    pub kind: ObjectKind,
    /// Partial fields, byte aligned.
    pub partial: Bytes,
    /// Partial then full fields, byte aligned.
    pub full: Bytes,
}

/// Replication state of one connection.
#[derive(Debug)]
pub struct Viewer {
    visible: BTreeSet<ObjectId>,
    /// Visible set before the last sent update.
    previous_visible: BTreeSet<ObjectId>,
    full_resend: bool,
    last_player_data: Option<PlayerData>,
    last_alive_count: Option<u8>,
    stream: PacketStream,
}

impl Viewer {
    pub fn new(registry: Arc<PacketRegistry>, buffer_bytes: usize) -> Self {
        Self {
            visible: BTreeSet::new(),
            previous_visible: BTreeSet::new(),
            full_resend: false,
            last_player_data: None,
            last_alive_count: None,
            stream: PacketStream::with_capacity(registry, buffer_bytes),
        }
    }

    /// Objects the client currently knows about.
    pub fn visible(&self) -> &BTreeSet<ObjectId> {
        &self.visible
    }

    pub fn needs_full_resend(&self) -> bool {
        self.full_resend
    }

    /// Sends every visible object in full next tick. Used when an update
    /// was lost before reaching the client.
    pub fn request_full_resend(&mut self) {
        self.full_resend = true;
        self.last_player_data = None;
        self.last_alive_count = None;
    }

    /// Called when the last encoded update never reached the client. Every
    /// object the client may still hold is either deleted or resent in full
    /// next tick.
    pub fn update_lost(&mut self) {
        let previous = std::mem::take(&mut self.previous_visible);
        self.visible.extend(previous);
        self.request_full_resend();
    }
}

/// Per-viewer data that is not part of the object delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewerExtras<'a> {
    pub bullets: &'a [BulletEvent],
    pub player_data: Option<PlayerData>,
    pub alive_count: Option<u8>,
}

/// One viewer's share of the replication phase.
#[derive(Debug)]
pub struct ViewerJob<'a> {
    pub viewer: &'a mut Viewer,
    /// Objects currently in the viewer's view.
    pub in_view: BTreeSet<ObjectId>,
    pub extras: ViewerExtras<'a>,
}

#[derive(Debug)]
pub struct Replicator {
    sizes: PayloadSizes,
    dirty: Vec<DirtyFlags>,
    dirty_ids: Vec<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    caches: Vec<Option<SnapshotCache>>,
    all_full_dirty: bool,
}

impl Replicator {
    pub fn new(sizes: PayloadSizes) -> Self {
        let slots = MAX_OBJECT_ID as usize + 1;
        Self {
            sizes,
            dirty: vec![DirtyFlags::empty(); slots],
            dirty_ids: Vec::new(),
            deleted: BTreeSet::new(),
            caches: vec![None; slots],
            all_full_dirty: false,
        }
    }

    /// Starts replicating `id`. Its first snapshot is rendered at the next
    /// [`Replicator::bake`].
    pub fn register(&mut self, id: ObjectId) {
        assert!(
            !self.deleted.contains(&id),
            "object {id} re-registered in the tick it was deleted"
        );
        self.mark_full(id);
    }

    /// Stops replicating `id`; viewers that could see it get a deletion.
    pub fn unregister(&mut self, id: ObjectId) {
        self.deleted.insert(id);
        self.dirty[id.index()] = DirtyFlags::empty();
        self.caches[id.index()] = None;
    }

    pub fn mark_partial(&mut self, id: ObjectId) {
        self.mark(id, DirtyFlags::PARTIAL);
    }

    /// A full change also re-renders the partial snapshot.
    pub fn mark_full(&mut self, id: ObjectId) {
        self.mark(id, DirtyFlags::PARTIAL | DirtyFlags::FULL);
    }

    /// Every viewer gets a full snapshot of everything it sees this tick.
    pub fn mark_all_full(&mut self) {
        self.all_full_dirty = true;
    }

    fn mark(&mut self, id: ObjectId, flags: DirtyFlags) {
        let slot = &mut self.dirty[id.index()];
        if slot.is_empty() {
            self.dirty_ids.push(id);
        }
        slot.insert(flags);
    }

    pub fn dirty_flags(&self, id: ObjectId) -> DirtyFlags {
        self.dirty[id.index()]
    }

    pub fn snapshot(&self, id: ObjectId) -> Option<&SnapshotCache> {
        self.caches[id.index()].as_ref()
    }

    pub fn is_deleted(&self, id: ObjectId) -> bool {
        self.deleted.contains(&id)
    }

    /// Re-renders the snapshots of every dirty object.
    ///
    /// An object whose snapshot does not fit is skipped and keeps its
    /// previous cache, if any; the rest are still baked. The first such
    /// failure is returned once every object has been visited.
    pub fn bake<O: NetObject>(&mut self, objects: &ObjectArena<O>) -> Result<(), ReplicationError> {
        let mut first_failure = None;
        for &id in &self.dirty_ids {
            let flags = self.dirty[id.index()];
            if flags.is_empty() {
                // Unregistered after being marked.
                continue;
            }
            let Some(object) = objects.get(id) else {
                warn!(object = %id, "dirty object missing from arena");
                continue;
            };
            let kind = object.kind();

            // The full snapshot embeds the partial fields, so both are
            // re-rendered whichever flag is set.
            let rendered = render(object, false, self.sizes.partial(kind))
                .and_then(|partial| Ok((partial, render(object, true, self.sizes.full(kind))?)));
            match rendered {
                Ok((partial, full)) => {
                    self.caches[id.index()] = Some(SnapshotCache {
                        kind,
                        partial,
                        full,
                    });
                }
                Err(e) => {
                    warn!(object = %id, ?kind, error = %e, "Snapshot exceeds payload size, skipping");
                    first_failure.get_or_insert(ReplicationError::SnapshotTooLarge { id, kind });
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Builds and encodes one viewer's update.
    ///
    /// Returns `Ok(None)` when there is nothing to send. On overflow the
    /// viewer's visible set is left untouched and it is flagged for a full
    /// resend.
    pub fn serve(
        &self,
        viewer: &mut Viewer,
        in_view: BTreeSet<ObjectId>,
        extras: ViewerExtras<'_>,
    ) -> Result<Option<Bytes>, ReplicationError> {
        // Objects without a snapshot have never been baked; wait for them.
        let in_view: BTreeSet<ObjectId> = in_view
            .into_iter()
            .filter(|id| self.caches[id.index()].is_some())
            .collect();

        let deleted: Vec<ObjectId> = viewer
            .visible
            .iter()
            .filter(|id| !in_view.contains(id) || self.deleted.contains(id))
            .copied()
            .collect();

        let resend_all = viewer.full_resend || self.all_full_dirty;
        let full_ids: Vec<ObjectId> = in_view
            .iter()
            .filter(|id| {
                resend_all
                    || !viewer.visible.contains(id)
                    || self.dirty[id.index()].contains(DirtyFlags::FULL)
            })
            .copied()
            .collect();
        let partial_ids: Vec<ObjectId> = in_view
            .iter()
            .filter(|id| {
                self.dirty[id.index()].contains(DirtyFlags::PARTIAL)
                    && full_ids.binary_search(id).is_err()
            })
            .copied()
            .collect();

        let entry = |id: ObjectId, full: bool| {
            self.caches[id.index()].as_ref().map(|cache| ObjectEntry {
                id,
                kind: cache.kind,
                payload: ObjectPayload::Encoded(if full {
                    cache.full.clone()
                } else {
                    cache.partial.clone()
                }),
            })
        };

        let update = UpdatePacket {
            deleted_objects: deleted,
            full_objects: full_ids.iter().filter_map(|&id| entry(id, true)).collect(),
            partial_objects: partial_ids.iter().filter_map(|&id| entry(id, false)).collect(),
            bullets: extras.bullets.to_vec(),
            player_data: extras
                .player_data
                .filter(|data| resend_all || viewer.last_player_data != Some(*data)),
            alive_count: extras
                .alive_count
                .filter(|count| resend_all || viewer.last_alive_count != Some(*count)),
        };

        if update.is_empty() {
            viewer.full_resend = false;
            return Ok(None);
        }

        viewer.stream.reset();
        if let Err(e) = viewer.stream.write_packet(&update) {
            viewer.request_full_resend();
            return Err(match e {
                BitStreamError::OutOfBounds { needed, available } => {
                    ReplicationError::BufferOverflow { needed, available }
                }
                other => ReplicationError::Stream(other),
            });
        }

        debug!(
            deleted = update.deleted_objects.len(),
            full = update.full_objects.len(),
            partial = update.partial_objects.len(),
            bytes = viewer.stream.written_bytes().len(),
            "viewer update"
        );
        viewer.previous_visible = std::mem::replace(&mut viewer.visible, in_view);
        viewer.full_resend = false;
        if update.player_data.is_some() {
            viewer.last_player_data = update.player_data;
        }
        if update.alive_count.is_some() {
            viewer.last_alive_count = update.alive_count;
        }
        Ok(Some(Bytes::copy_from_slice(viewer.stream.written_bytes())))
    }

    /// Serves every job. Snapshot caches are only read here, and each job
    /// owns its viewer, so jobs are independent of each other.
    pub fn serve_viewers<'a>(
        &self,
        jobs: impl IntoIterator<Item = ViewerJob<'a>>,
    ) -> Vec<Result<Option<Bytes>, ReplicationError>> {
        jobs.into_iter()
            .map(|job| self.serve(job.viewer, job.in_view, job.extras))
            .collect()
    }

    /// Clears this tick's dirty and deleted bookkeeping.
    pub fn end_tick(&mut self) {
        for id in self.dirty_ids.drain(..) {
            self.dirty[id.index()] = DirtyFlags::empty();
        }
        self.deleted.clear();
        self.all_full_dirty = false;
    }
}

fn render<O: NetObject>(object: &O, full: bool, size: usize) -> Result<Bytes, BitStreamError> {
    let mut stream = BitStream::new(size);
    object.serialize_partial(&mut stream)?;
    if full {
        object.serialize_full(&mut stream)?;
    }
    stream.align_to_byte()?;
    Ok(Bytes::copy_from_slice(stream.written_bytes()))
}
