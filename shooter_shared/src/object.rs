//! Replicated object records.
//!
//! Every networked object has an id, a kind, a *partial* state that changes
//! often (position, rotation...) and a *full* state that changes rarely.
//! A full snapshot is always the partial fields followed by the full fields,
//! padded to a byte boundary, so the server can pre-render both once per tick
//! and copy the bytes into every viewer's update.

use std::fmt;

use crate::bitstream::{BitResult, BitStream};
use crate::definitions::PLAYER_MAX_HEALTH;
use crate::math::Vec2;

/// Bits used for object ids on the wire.
pub const OBJECT_ID_BITS: u32 = 16;

/// Largest assignable id. Id 0 is never assigned.
pub const MAX_OBJECT_ID: u16 = u16::MAX;

/// Range used to quantize obstacle scale.
pub const MAX_OBSTACLE_SCALE: f32 = 2.0;

/// Network object id, unique among live objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u16);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn write(self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_bits(u32::from(self.0), OBJECT_ID_BITS)
    }

    pub fn read(stream: &mut BitStream) -> BitResult<Self> {
        Ok(ObjectId(stream.read_bits(OBJECT_ID_BITS)? as u16))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Object kinds. Encoded as one byte so entry headers stay byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Player = 0,
    Obstacle = 1,
    Loot = 2,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Player, ObjectKind::Obstacle, ObjectKind::Loot];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ObjectKind::Player),
            1 => Some(ObjectKind::Obstacle),
            2 => Some(ObjectKind::Loot),
            _ => None,
        }
    }

    pub fn write(self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_u8(self as u8)
    }
}

// ─── Per-kind state ───

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerPartial {
    pub position: Vec2,
    pub rotation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerFull {
    pub dead: bool,
    pub health: f32,
    pub active_weapon: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstaclePartial {
    pub scale: f32,
    pub destroyed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleFull {
    pub position: Vec2,
    pub rotation: f32,
    pub definition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LootPartial {
    pub position: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LootFull {
    pub definition: u8,
    pub count: u8,
}

/// Frequently changing state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartialState {
    Player(PlayerPartial),
    Obstacle(ObstaclePartial),
    Loot(LootPartial),
}

/// Rarely changing state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FullState {
    Player(PlayerFull),
    Obstacle(ObstacleFull),
    Loot(LootFull),
}

impl PartialState {
    pub fn kind(&self) -> ObjectKind {
        match self {
            PartialState::Player(_) => ObjectKind::Player,
            PartialState::Obstacle(_) => ObjectKind::Obstacle,
            PartialState::Loot(_) => ObjectKind::Loot,
        }
    }

    /// World position, when the partial state carries one.
    pub fn position(&self) -> Option<Vec2> {
        match self {
            PartialState::Player(p) => Some(p.position),
            PartialState::Loot(l) => Some(l.position),
            PartialState::Obstacle(_) => None,
        }
    }

    pub fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        match self {
            PartialState::Player(p) => {
                stream.write_position(p.position)?;
                stream.write_rotation(p.rotation)
            }
            PartialState::Obstacle(o) => {
                stream.write_float(o.scale, 0.0, MAX_OBSTACLE_SCALE, 8)?;
                stream.write_bool(o.destroyed)
            }
            PartialState::Loot(l) => stream.write_position(l.position),
        }
    }

    pub fn deserialize(kind: ObjectKind, stream: &mut BitStream) -> BitResult<Self> {
        Ok(match kind {
            ObjectKind::Player => PartialState::Player(PlayerPartial {
                position: stream.read_position()?,
                rotation: stream.read_rotation()?,
            }),
            ObjectKind::Obstacle => PartialState::Obstacle(ObstaclePartial {
                scale: stream.read_float(0.0, MAX_OBSTACLE_SCALE, 8)?,
                destroyed: stream.read_bool()?,
            }),
            ObjectKind::Loot => PartialState::Loot(LootPartial {
                position: stream.read_position()?,
            }),
        })
    }
}

impl FullState {
    pub fn kind(&self) -> ObjectKind {
        match self {
            FullState::Player(_) => ObjectKind::Player,
            FullState::Obstacle(_) => ObjectKind::Obstacle,
            FullState::Loot(_) => ObjectKind::Loot,
        }
    }

    pub fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        match self {
            FullState::Player(p) => {
                stream.write_bool(p.dead)?;
                stream.write_float(p.health, 0.0, PLAYER_MAX_HEALTH, 8)?;
                stream.write_u8(p.active_weapon)
            }
            FullState::Obstacle(o) => {
                stream.write_position(o.position)?;
                stream.write_rotation(o.rotation)?;
                stream.write_u8(o.definition)
            }
            FullState::Loot(l) => {
                stream.write_u8(l.definition)?;
                stream.write_u8(l.count)
            }
        }
    }

    pub fn deserialize(kind: ObjectKind, stream: &mut BitStream) -> BitResult<Self> {
        Ok(match kind {
            ObjectKind::Player => FullState::Player(PlayerFull {
                dead: stream.read_bool()?,
                health: stream.read_float(0.0, PLAYER_MAX_HEALTH, 8)?,
                active_weapon: stream.read_u8()?,
            }),
            ObjectKind::Obstacle => FullState::Obstacle(ObstacleFull {
                position: stream.read_position()?,
                rotation: stream.read_rotation()?,
                definition: stream.read_u8()?,
            }),
            ObjectKind::Loot => FullState::Loot(LootFull {
                definition: stream.read_u8()?,
                count: stream.read_u8()?,
            }),
        })
    }
}

/// Decoded object state. `full` is `None` for partial-only updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectState {
    pub partial: PartialState,
    pub full: Option<FullState>,
}

impl ObjectState {
    pub fn kind(&self) -> ObjectKind {
        self.partial.kind()
    }

    /// Writes the partial fields, the full fields when present, then pads
    /// to a byte boundary.
    pub fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        debug_assert!(self.full.map_or(true, |f| f.kind() == self.kind()));
        self.partial.serialize(stream)?;
        if let Some(full) = &self.full {
            full.serialize(stream)?;
        }
        stream.align_to_byte()
    }

    pub fn deserialize(kind: ObjectKind, full: bool, stream: &mut BitStream) -> BitResult<Self> {
        let partial = PartialState::deserialize(kind, stream)?;
        let full = if full {
            Some(FullState::deserialize(kind, stream)?)
        } else {
            None
        };
        stream.skip_to_byte()?;
        Ok(Self { partial, full })
    }

    /// Position from whichever half carries it.
    pub fn position(&self) -> Option<Vec2> {
        self.partial.position().or(match self.full {
            Some(FullState::Obstacle(o)) => Some(o.position),
            _ => None,
        })
    }
}

/// Encoded size in bytes of a kind's partial and full snapshots.
pub fn snapshot_sizes(kind: ObjectKind) -> (usize, usize) {
    // Bit counts follow the serialize functions above.
    let (partial_bits, full_bits) = match kind {
        ObjectKind::Player => (32 + 16, 1 + 8 + 8),
        ObjectKind::Obstacle => (8 + 1, 32 + 16 + 8),
        ObjectKind::Loot => (32, 8 + 8),
    };
    (
        (partial_bits as usize).div_ceil(8),
        ((partial_bits + full_bits) as usize).div_ceil(8),
    )
}
