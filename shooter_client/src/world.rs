//! Client mirror of replicated objects.
//!
//! Updates are validated before anything is touched, so a bad update leaves
//! the world exactly as it was. Application order inside an update is
//! deletes, then full entries, then partial entries.
//!
//! Every applied update shifts each object's current position into its
//! previous slot, which is what [`ClientWorld::interpolated_position`]
//! blends from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use shooter_shared::{
    math::Vec2,
    object::{FullState, ObjectId, ObjectKind, ObjectState, PartialState},
    packets::{BulletEvent, ObjectEntry, PlayerData, UpdatePacket},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Partial update for an object the client does not hold.
    UnknownObject(ObjectId),
    KindMismatch {
        id: ObjectId,
        known: ObjectKind,
        received: ObjectKind,
    },
    /// A full entry without full state, or a partial entry with it.
    WrongSection(ObjectId),
    /// Entry still in its encoded form; only decoded updates can be applied.
    NotDecoded(ObjectId),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::UnknownObject(id) => write!(f, "partial update for unknown object {id}"),
            WorldError::KindMismatch { id, known, received } => {
                write!(f, "object {id} is a {known:?} but update says {received:?}")
            }
            WorldError::WrongSection(id) => write!(f, "object {id} is in the wrong update section"),
            WorldError::NotDecoded(id) => write!(f, "object {id} carries undecoded bytes"),
        }
    }
}

impl std::error::Error for WorldError {}

/// One replicated object as the client knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientObject {
    pub id: ObjectId,
    pub partial: PartialState,
    pub full: FullState,
    position: Vec2,
    previous_position: Vec2,
}

impl ClientObject {
    pub fn kind(&self) -> ObjectKind {
        self.partial.kind()
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn previous_position(&self) -> Vec2 {
        self.previous_position
    }

    fn locate(partial: &PartialState, full: &FullState) -> Vec2 {
        match (partial.position(), full) {
            (Some(p), _) => p,
            (None, FullState::Obstacle(o)) => o.position,
            (None, _) => Vec2::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientWorld {
    objects: BTreeMap<ObjectId, ClientObject>,
    player_data: Option<PlayerData>,
    alive_count: Option<u8>,
    /// Shots reported by the last applied update.
    bullets: Vec<BulletEvent>,
    updates_applied: u64,
}

fn decoded(entry: &ObjectEntry) -> Result<&ObjectState, WorldError> {
    let state = entry.state().ok_or(WorldError::NotDecoded(entry.id))?;
    if state.kind() != entry.kind {
        return Err(WorldError::KindMismatch {
            id: entry.id,
            known: entry.kind,
            received: state.kind(),
        });
    }
    Ok(state)
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&ClientObject> {
        self.objects.get(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientObject> {
        self.objects.values()
    }

    pub fn count_of(&self, kind: ObjectKind) -> usize {
        self.objects.values().filter(|o| o.kind() == kind).count()
    }

    /// Latest health and kills of the local player.
    pub fn player_data(&self) -> Option<PlayerData> {
        self.player_data
    }

    pub fn alive_count(&self) -> Option<u8> {
        self.alive_count
    }

    pub fn bullets(&self) -> &[BulletEvent] {
        &self.bullets
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    /// Position between the last two updates, `alpha` in `[0, 1]`.
    pub fn interpolated_position(&self, id: ObjectId, alpha: f32) -> Option<Vec2> {
        self.objects
            .get(&id)
            .map(|o| o.previous_position.lerp(o.position, alpha.clamp(0.0, 1.0)))
    }

    fn validate(&self, update: &UpdatePacket) -> Result<(), WorldError> {
        let deleted: BTreeSet<ObjectId> = update.deleted_objects.iter().copied().collect();
        let mut created = BTreeMap::new();

        for entry in &update.full_objects {
            let state = decoded(entry)?;
            if state.full.is_none() {
                return Err(WorldError::WrongSection(entry.id));
            }
            // Full entries are authoritative, even over an object of another
            // kind whose id was recycled.
            created.insert(entry.id, entry.kind);
        }

        for entry in &update.partial_objects {
            let state = decoded(entry)?;
            if state.full.is_some() {
                return Err(WorldError::WrongSection(entry.id));
            }
            let known = created.get(&entry.id).copied().or_else(|| {
                self.objects
                    .get(&entry.id)
                    .filter(|_| !deleted.contains(&entry.id))
                    .map(ClientObject::kind)
            });
            match known {
                None => return Err(WorldError::UnknownObject(entry.id)),
                Some(kind) if kind != entry.kind => {
                    return Err(WorldError::KindMismatch {
                        id: entry.id,
                        known: kind,
                        received: entry.kind,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Applies a decoded update. On error nothing changes.
    pub fn apply_update(&mut self, update: &UpdatePacket) -> Result<(), WorldError> {
        self.validate(update)?;

        for object in self.objects.values_mut() {
            object.previous_position = object.position;
        }

        for id in &update.deleted_objects {
            if self.objects.remove(id).is_none() {
                debug!(object = %id, "delete for unknown object ignored");
            }
        }

        for entry in &update.full_objects {
            let Some(ObjectState {
                partial,
                full: Some(full),
            }) = entry.state().copied()
            else {
                continue;
            };
            let position = ClientObject::locate(&partial, &full);
            match self.objects.get_mut(&entry.id) {
                Some(object) if object.kind() == entry.kind => {
                    object.partial = partial;
                    object.full = full;
                    object.position = position;
                }
                _ => {
                    self.objects.insert(
                        entry.id,
                        ClientObject {
                            id: entry.id,
                            partial,
                            full,
                            position,
                            previous_position: position,
                        },
                    );
                }
            }
        }

        for entry in &update.partial_objects {
            let (Some(state), Some(object)) = (entry.state(), self.objects.get_mut(&entry.id)) else {
                continue;
            };
            object.partial = state.partial;
            object.position = ClientObject::locate(&object.partial, &object.full);
        }

        if update.player_data.is_some() {
            self.player_data = update.player_data;
        }
        if update.alive_count.is_some() {
            self.alive_count = update.alive_count;
        }
        self.bullets.clone_from(&update.bullets);
        self.updates_applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use shooter_shared::{
        object::{LootFull, LootPartial, PlayerFull, PlayerPartial},
        packets::ObjectPayload,
    };

    use super::*;

    fn player(id: u16, x: f32, y: f32, full: bool) -> ObjectEntry {
        ObjectEntry {
            id: ObjectId(id),
            kind: ObjectKind::Player,
            payload: ObjectPayload::Decoded(ObjectState {
                partial: PartialState::Player(PlayerPartial {
                    position: Vec2::new(x, y),
                    rotation: 0.0,
                }),
                full: full.then_some(FullState::Player(PlayerFull {
                    dead: false,
                    health: 100.0,
                    active_weapon: 0,
                })),
            }),
        }
    }

    fn loot(id: u16, x: f32, y: f32) -> ObjectEntry {
        ObjectEntry {
            id: ObjectId(id),
            kind: ObjectKind::Loot,
            payload: ObjectPayload::Decoded(ObjectState {
                partial: PartialState::Loot(LootPartial {
                    position: Vec2::new(x, y),
                }),
                full: Some(FullState::Loot(LootFull {
                    definition: 0,
                    count: 1,
                })),
            }),
        }
    }

    fn seeded() -> ClientWorld {
        let mut world = ClientWorld::new();
        world
            .apply_update(&UpdatePacket {
                full_objects: vec![player(1, 10.0, 10.0, true), loot(2, 20.0, 20.0)],
                alive_count: Some(3),
                ..Default::default()
            })
            .unwrap();
        world
    }

    #[test]
    fn full_entries_create_objects() {
        let world = seeded();
        assert_eq!(world.len(), 2);
        assert_eq!(world.get(ObjectId(1)).unwrap().kind(), ObjectKind::Player);
        assert_eq!(world.get(ObjectId(2)).unwrap().position(), Vec2::new(20.0, 20.0));
        assert_eq!(world.alive_count(), Some(3));
    }

    #[test]
    fn partial_entries_move_objects_and_interpolate() {
        let mut world = seeded();
        world
            .apply_update(&UpdatePacket {
                partial_objects: vec![player(1, 14.0, 10.0, false)],
                ..Default::default()
            })
            .unwrap();
        let p = world.get(ObjectId(1)).unwrap();
        assert_eq!(p.position(), Vec2::new(14.0, 10.0));
        assert_eq!(p.previous_position(), Vec2::new(10.0, 10.0));
        assert_eq!(
            world.interpolated_position(ObjectId(1), 0.5),
            Some(Vec2::new(12.0, 10.0))
        );
        // Health survives a partial update.
        assert!(matches!(p.full, FullState::Player(PlayerFull { health, .. }) if health == 100.0));
        // Alive count is kept when the update omits it.
        assert_eq!(world.alive_count(), Some(3));
    }

    #[test]
    fn deletes_remove_objects_and_unknown_deletes_are_ignored() {
        let mut world = seeded();
        world
            .apply_update(&UpdatePacket {
                deleted_objects: vec![ObjectId(2), ObjectId(99)],
                ..Default::default()
            })
            .unwrap();
        assert!(!world.contains(ObjectId(2)));
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn bad_update_changes_nothing() {
        let mut world = seeded();
        let before: Vec<_> = world.iter().cloned().collect();
        let err = world
            .apply_update(&UpdatePacket {
                deleted_objects: vec![ObjectId(2)],
                partial_objects: vec![player(1, 30.0, 30.0, false), player(7, 0.0, 0.0, false)],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, WorldError::UnknownObject(ObjectId(7)));
        assert_eq!(world.iter().cloned().collect::<Vec<_>>(), before);
        assert_eq!(world.updates_applied(), 1);
    }

    #[test]
    fn full_entry_replaces_object_of_another_kind() {
        let mut world = seeded();
        world
            .apply_update(&UpdatePacket {
                full_objects: vec![loot(1, 5.0, 5.0)],
                ..Default::default()
            })
            .unwrap();
        let object = world.get(ObjectId(1)).unwrap();
        assert_eq!(object.kind(), ObjectKind::Loot);
        // No interpolation from the previous occupant of the id.
        assert_eq!(object.previous_position(), Vec2::new(5.0, 5.0));
    }

    #[test]
    fn partial_of_wrong_kind_is_rejected() {
        let mut world = seeded();
        let mut entry = player(2, 1.0, 1.0, false);
        let err = world
            .apply_update(&UpdatePacket {
                partial_objects: vec![entry.clone()],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            WorldError::KindMismatch {
                id: ObjectId(2),
                known: ObjectKind::Loot,
                received: ObjectKind::Player,
            }
        );

        // An entry whose header and state disagree is rejected too.
        entry.kind = ObjectKind::Loot;
        assert!(matches!(
            world.apply_update(&UpdatePacket {
                partial_objects: vec![entry],
                ..Default::default()
            }),
            Err(WorldError::KindMismatch { .. })
        ));
    }

    #[test]
    fn entries_must_match_their_section() {
        let mut world = seeded();
        let err = world
            .apply_update(&UpdatePacket {
                full_objects: vec![player(1, 1.0, 1.0, false)],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, WorldError::WrongSection(ObjectId(1)));
    }
}
