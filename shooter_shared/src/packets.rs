//! Packet catalogue.
//!
//! - `Join` / `Joined`: handshake.
//! - `Input`: client -> server movement and aim.
//! - `Update`: server -> client delta of everything the client can see.
//! - `Ping`, `Disconnect`: housekeeping.

use bitflags::bitflags;
use bytes::Bytes;

use crate::bitstream::{BitResult, BitStream};
use crate::definitions::PLAYER_MAX_HEALTH;
use crate::math::Vec2;
use crate::object::{ObjectId, ObjectKind, ObjectState};
use crate::protocol::{Packet, ProtocolError};

/// Bumped whenever the wire format changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Player names are sent as a fixed 16-byte UTF-8 field.
pub const MAX_NAME_BYTES: usize = 16;

const OBJECT_COUNT_BITS: u32 = 16;
const BULLET_COUNT_BITS: u32 = 8;
const MOVEMENT_BITS: u32 = 4;

// ─── Handshake ───

#[derive(Debug, Clone, PartialEq)]
pub struct JoinPacket {
    pub protocol_version: u16,
    pub name: String,
}

impl Packet for JoinPacket {
    const NAME: &'static str = "Join";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_u16(self.protocol_version)?;
        stream.write_utf8_string(&self.name, Some(MAX_NAME_BYTES))
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol_version: stream.read_u16()?,
            name: stream.read_utf8_string(Some(MAX_NAME_BYTES))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedPacket {
    pub player_id: ObjectId,
    pub world_width: f32,
    pub world_height: f32,
}

impl Packet for JoinedPacket {
    const NAME: &'static str = "Joined";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        self.player_id.write(stream)?;
        stream.write_f32(self.world_width)?;
        stream.write_f32(self.world_height)
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        Ok(Self {
            player_id: ObjectId::read(stream)?,
            world_width: stream.read_f32()?,
            world_height: stream.read_f32()?,
        })
    }
}

// ─── Input ───

bitflags! {
    /// Held movement keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MovementFlags: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

impl MovementFlags {
    /// Unit movement direction. Opposite keys cancel out. +y points down.
    pub fn direction(self) -> Vec2 {
        let mut dir = Vec2::ZERO;
        if self.contains(MovementFlags::UP) {
            dir.y -= 1.0;
        }
        if self.contains(MovementFlags::DOWN) {
            dir.y += 1.0;
        }
        if self.contains(MovementFlags::LEFT) {
            dir.x -= 1.0;
        }
        if self.contains(MovementFlags::RIGHT) {
            dir.x += 1.0;
        }
        dir.normalize_or(Vec2::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputPacket {
    pub sequence: u16,
    pub movement: MovementFlags,
    /// Aim angle in `[-π, π]`.
    pub rotation: f32,
    pub attacking: bool,
}

impl Packet for InputPacket {
    const NAME: &'static str = "Input";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_u16(self.sequence)?;
        stream.write_bits(u32::from(self.movement.bits()), MOVEMENT_BITS)?;
        stream.write_rotation(self.rotation)?;
        stream.write_bool(self.attacking)
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        Ok(Self {
            sequence: stream.read_u16()?,
            movement: MovementFlags::from_bits_truncate(stream.read_bits(MOVEMENT_BITS)? as u8),
            rotation: stream.read_rotation()?,
            attacking: stream.read_bool()?,
        })
    }
}

// ─── Update ───

bitflags! {
    /// Sections present in an [`UpdatePacket`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        const DELETED_OBJECTS = 1 << 0;
        const FULL_OBJECTS = 1 << 1;
        const PARTIAL_OBJECTS = 1 << 2;
        const BULLETS = 1 << 3;
        const PLAYER_DATA = 1 << 4;
        const ALIVE_COUNT = 1 << 5;
    }
}

/// Body of an object entry.
///
/// The server writes snapshots it rendered once per tick (`Encoded`); the
/// client always reads them back as `Decoded`.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectPayload {
    Encoded(Bytes),
    Decoded(ObjectState),
}

/// One object in the full or partial section of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub payload: ObjectPayload,
}

impl ObjectEntry {
    fn write(&self, stream: &mut BitStream, full: bool) -> BitResult<()> {
        self.id.write(stream)?;
        self.kind.write(stream)?;
        match &self.payload {
            ObjectPayload::Encoded(bytes) => stream.write_bytes(bytes),
            ObjectPayload::Decoded(state) => {
                assert_eq!(
                    state.full.is_some(),
                    full,
                    "object {} state does not match its section",
                    self.id
                );
                state.serialize(stream)
            }
        }
    }

    fn read(stream: &mut BitStream, full: bool) -> Result<Self, ProtocolError> {
        let id = ObjectId::read(stream)?;
        let raw_kind = stream.read_u8()?;
        let kind = ObjectKind::from_u8(raw_kind)
            .ok_or_else(|| ProtocolError::Malformed(format!("object {id} has kind {raw_kind}")))?;
        let state = ObjectState::deserialize(kind, full, stream)?;
        Ok(Self {
            id,
            kind,
            payload: ObjectPayload::Decoded(state),
        })
    }

    /// The decoded state, if this entry was read off the wire.
    pub fn state(&self) -> Option<&ObjectState> {
        match &self.payload {
            ObjectPayload::Decoded(state) => Some(state),
            ObjectPayload::Encoded(_) => None,
        }
    }
}

/// A shot fired this tick. Clients simulate the tracer locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulletEvent {
    pub shooter: ObjectId,
    pub origin: Vec2,
    pub rotation: f32,
    pub weapon: u8,
}

impl BulletEvent {
    fn write(&self, stream: &mut BitStream) -> BitResult<()> {
        self.shooter.write(stream)?;
        stream.write_position(self.origin)?;
        stream.write_rotation(self.rotation)?;
        stream.write_u8(self.weapon)
    }

    fn read(stream: &mut BitStream) -> BitResult<Self> {
        Ok(Self {
            shooter: ObjectId::read(stream)?,
            origin: stream.read_position()?,
            rotation: stream.read_rotation()?,
            weapon: stream.read_u8()?,
        })
    }
}

/// Data only the owning player receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerData {
    pub health: f32,
    pub kills: u16,
}

/// Per-viewer delta.
///
/// Sections are written in flag order; empty sections are left out and
/// their flag cleared.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdatePacket {
    pub deleted_objects: Vec<ObjectId>,
    pub full_objects: Vec<ObjectEntry>,
    pub partial_objects: Vec<ObjectEntry>,
    pub bullets: Vec<BulletEvent>,
    pub player_data: Option<PlayerData>,
    pub alive_count: Option<u8>,
}

impl UpdatePacket {
    pub fn flags(&self) -> UpdateFlags {
        let mut flags = UpdateFlags::empty();
        flags.set(UpdateFlags::DELETED_OBJECTS, !self.deleted_objects.is_empty());
        flags.set(UpdateFlags::FULL_OBJECTS, !self.full_objects.is_empty());
        flags.set(UpdateFlags::PARTIAL_OBJECTS, !self.partial_objects.is_empty());
        flags.set(UpdateFlags::BULLETS, !self.bullets.is_empty());
        flags.set(UpdateFlags::PLAYER_DATA, self.player_data.is_some());
        flags.set(UpdateFlags::ALIVE_COUNT, self.alive_count.is_some());
        flags
    }

    /// True when the update carries nothing.
    pub fn is_empty(&self) -> bool {
        self.flags().is_empty()
    }
}

impl Packet for UpdatePacket {
    const NAME: &'static str = "Update";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        let flags = self.flags();
        stream.write_u8(flags.bits())?;

        if flags.contains(UpdateFlags::DELETED_OBJECTS) {
            stream.write_array(&self.deleted_objects, OBJECT_COUNT_BITS, |s, id| id.write(s))?;
        }
        if flags.contains(UpdateFlags::FULL_OBJECTS) {
            stream.write_array(&self.full_objects, OBJECT_COUNT_BITS, |s, e| e.write(s, true))?;
        }
        if flags.contains(UpdateFlags::PARTIAL_OBJECTS) {
            stream.write_array(&self.partial_objects, OBJECT_COUNT_BITS, |s, e| {
                e.write(s, false)
            })?;
        }
        if flags.contains(UpdateFlags::BULLETS) {
            stream.write_array(&self.bullets, BULLET_COUNT_BITS, |s, b| b.write(s))?;
        }
        if let Some(data) = &self.player_data {
            stream.write_float(data.health, 0.0, PLAYER_MAX_HEALTH, 8)?;
            stream.write_u16(data.kills)?;
        }
        if let Some(alive) = self.alive_count {
            stream.write_u8(alive)?;
        }
        Ok(())
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        let raw = stream.read_u8()?;
        let flags = UpdateFlags::from_bits(raw)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown update flags {raw:#04x}")))?;
        let mut update = UpdatePacket::default();

        if flags.contains(UpdateFlags::DELETED_OBJECTS) {
            update.deleted_objects = stream.read_array(OBJECT_COUNT_BITS, ObjectId::read)?;
        }
        // Entry reads can fail with a protocol error, which read_array's
        // closure type cannot carry.
        if flags.contains(UpdateFlags::FULL_OBJECTS) {
            update.full_objects = read_entries(stream, true)?;
        }
        if flags.contains(UpdateFlags::PARTIAL_OBJECTS) {
            update.partial_objects = read_entries(stream, false)?;
        }
        if flags.contains(UpdateFlags::BULLETS) {
            update.bullets = stream.read_array(BULLET_COUNT_BITS, BulletEvent::read)?;
        }
        if flags.contains(UpdateFlags::PLAYER_DATA) {
            update.player_data = Some(PlayerData {
                health: stream.read_float(0.0, PLAYER_MAX_HEALTH, 8)?,
                kills: stream.read_u16()?,
            });
        }
        if flags.contains(UpdateFlags::ALIVE_COUNT) {
            update.alive_count = Some(stream.read_u8()?);
        }
        Ok(update)
    }
}

fn read_entries(stream: &mut BitStream, full: bool) -> Result<Vec<ObjectEntry>, ProtocolError> {
    let count = stream.read_bits(OBJECT_COUNT_BITS)? as usize;
    let mut entries = Vec::with_capacity(count.min(stream.remaining_bits() / 8));
    for _ in 0..count {
        entries.push(ObjectEntry::read(stream, full)?);
    }
    Ok(entries)
}

// ─── Housekeeping ───

#[derive(Debug, Clone, PartialEq)]
pub struct PingPacket {
    pub timestamp: u32,
}

impl Packet for PingPacket {
    const NAME: &'static str = "Ping";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_u32(self.timestamp)
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        Ok(Self {
            timestamp: stream.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectPacket {
    pub reason: String,
}

impl Packet for DisconnectPacket {
    const NAME: &'static str = "Disconnect";

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()> {
        stream.write_utf8_string(&self.reason, None)
    }

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: stream.read_utf8_string(None)?,
        })
    }
}

// ─── Envelope ───

/// Any decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    Join(JoinPacket),
    Joined(JoinedPacket),
    Input(InputPacket),
    Update(UpdatePacket),
    Ping(PingPacket),
    Disconnect(DisconnectPacket),
}

impl NetMessage {
    pub fn name(&self) -> &'static str {
        match self {
            NetMessage::Join(_) => JoinPacket::NAME,
            NetMessage::Joined(_) => JoinedPacket::NAME,
            NetMessage::Input(_) => InputPacket::NAME,
            NetMessage::Update(_) => UpdatePacket::NAME,
            NetMessage::Ping(_) => PingPacket::NAME,
            NetMessage::Disconnect(_) => DisconnectPacket::NAME,
        }
    }
}

macro_rules! impl_from_packet {
    ($($variant:ident => $packet:ty),* $(,)?) => {
        $(
            impl From<$packet> for NetMessage {
                fn from(p: $packet) -> Self {
                    NetMessage::$variant(p)
                }
            }
        )*
    };
}

impl_from_packet! {
    Join => JoinPacket,
    Joined => JoinedPacket,
    Input => InputPacket,
    Update => UpdatePacket,
    Ping => PingPacket,
    Disconnect => DisconnectPacket,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::object::{
        FullState, LootFull, LootPartial, ObstaclePartial, PartialState, PlayerFull, PlayerPartial,
    };
    use crate::protocol::{decode_frame, PacketRegistry, PacketStream};

    fn player_state(x: f32, full: bool) -> ObjectState {
        ObjectState {
            partial: PartialState::Player(PlayerPartial {
                position: Vec2::new(x, 8.0),
                rotation: 0.0,
            }),
            full: full.then_some(FullState::Player(PlayerFull {
                dead: false,
                health: 100.0,
                active_weapon: 0,
            })),
        }
    }

    #[test]
    fn movement_direction_is_normalized() {
        let d = (MovementFlags::UP | MovementFlags::RIGHT).direction();
        assert!((d.len() - 1.0).abs() < 1e-5);
        assert!(d.x > 0.0 && d.y < 0.0);
        assert_eq!((MovementFlags::UP | MovementFlags::DOWN).direction(), Vec2::ZERO);
    }

    #[test]
    fn join_name_is_cut_to_field_width() {
        let registry = Arc::new(PacketRegistry::standard());
        let mut s = PacketStream::with_capacity(Arc::clone(&registry), 64);
        s.write_packet(&JoinPacket {
            protocol_version: PROTOCOL_VERSION,
            name: "a-rather-long-player-name".into(),
        })
        .unwrap();
        // tag + version + fixed name
        assert_eq!(s.written_bytes().len(), 1 + 2 + MAX_NAME_BYTES);

        match &decode_frame(&registry, s.written_bytes()).unwrap()[0] {
            NetMessage::Join(j) => assert_eq!(j.name, "a-rather-long-pl"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_update_is_two_bytes() {
        let registry = Arc::new(PacketRegistry::standard());
        let mut s = PacketStream::with_capacity(Arc::clone(&registry), 8);
        let update = UpdatePacket::default();
        assert!(update.is_empty());
        s.write_packet(&update).unwrap();
        assert_eq!(s.written_bytes(), &[3, 0]);
    }

    #[test]
    fn encoded_and_decoded_entries_read_back_the_same() {
        let registry = Arc::new(PacketRegistry::standard());
        let state = player_state(12.0, true);

        let mut cache = BitStream::new(16);
        state.serialize(&mut cache).unwrap();
        let encoded = Bytes::copy_from_slice(cache.written_bytes());

        let update = UpdatePacket {
            deleted_objects: vec![ObjectId(9)],
            full_objects: vec![
                ObjectEntry {
                    id: ObjectId(1),
                    kind: ObjectKind::Player,
                    payload: ObjectPayload::Encoded(encoded),
                },
                ObjectEntry {
                    id: ObjectId(2),
                    kind: ObjectKind::Loot,
                    payload: ObjectPayload::Decoded(ObjectState {
                        partial: PartialState::Loot(LootPartial {
                            position: Vec2::new(1.0, 1.0),
                        }),
                        full: Some(FullState::Loot(LootFull {
                            definition: 1,
                            count: 1,
                        })),
                    }),
                },
            ],
            partial_objects: vec![ObjectEntry {
                id: ObjectId(3),
                kind: ObjectKind::Obstacle,
                payload: ObjectPayload::Decoded(ObjectState {
                    partial: PartialState::Obstacle(ObstaclePartial {
                        scale: 1.0,
                        destroyed: false,
                    }),
                    full: None,
                }),
            }],
            bullets: vec![BulletEvent {
                shooter: ObjectId(1),
                origin: Vec2::new(12.0, 8.0),
                rotation: 1.5,
                weapon: 1,
            }],
            player_data: Some(PlayerData {
                health: 50.0,
                kills: 3,
            }),
            alive_count: Some(4),
        };

        let mut s = PacketStream::with_capacity(Arc::clone(&registry), 256);
        s.write_packet(&update).unwrap();
        let back = match decode_frame(&registry, s.written_bytes()).unwrap().remove(0) {
            NetMessage::Update(u) => u,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(back.flags(), UpdateFlags::all());
        assert_eq!(back.deleted_objects, vec![ObjectId(9)]);
        assert_eq!(back.full_objects.len(), 2);
        let first = back.full_objects[0].state().unwrap();
        assert_eq!(first.kind(), ObjectKind::Player);
        assert!(first.position().unwrap().approx_eq(Vec2::new(12.0, 8.0), 0.1));
        assert!(first.full.is_some());
        assert_eq!(back.full_objects[1].kind, ObjectKind::Loot);
        assert!(back.partial_objects[0].state().unwrap().full.is_none());
        assert_eq!(back.bullets.len(), 1);
        assert_eq!(back.bullets[0].weapon, 1);
        assert_eq!(back.player_data.unwrap().kills, 3);
        assert_eq!(back.alive_count, Some(4));
    }

    #[test]
    fn unknown_object_kind_is_malformed() {
        let registry = Arc::new(PacketRegistry::standard());
        // tag, flags = FULL_OBJECTS, count = 1, id = 1, kind = 7
        let frame = [3u8, 0b10, 1, 0, 1, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = decode_frame(&registry, &frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    #[should_panic(expected = "does not match its section")]
    fn partial_state_in_full_section_panics() {
        let update = UpdatePacket {
            full_objects: vec![ObjectEntry {
                id: ObjectId(1),
                kind: ObjectKind::Player,
                payload: ObjectPayload::Decoded(player_state(1.0, false)),
            }],
            ..Default::default()
        };
        let mut s = BitStream::new(64);
        let _ = update.serialize(&mut s);
    }
}
