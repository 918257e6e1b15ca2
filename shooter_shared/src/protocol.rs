//! Packet framing over a [`BitStream`].
//!
//! A frame is a sequence of packets. Each packet is an 8-bit type tag, the
//! packet body, then zero padding up to the next byte boundary. Tags are
//! dense indices into a [`PacketRegistry`]; both ends must build the registry
//! in the same order, which [`PacketRegistry::standard`] guarantees.
//!
//! Decoding is all-or-nothing per frame: [`decode_frame`] either returns
//! every packet in the frame or an error, never a prefix.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::bitstream::{BitResult, BitStream, BitStreamError};
use crate::packets::{
    DisconnectPacket, InputPacket, JoinPacket, JoinedPacket, NetMessage, PingPacket, UpdatePacket,
};

/// Bits used for the packet type tag.
pub const PACKET_TAG_BITS: u32 = 8;

/// Errors raised while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The tag does not name a registered packet type.
    UnknownTag(u8),
    /// The packet body ran past the buffer or held invalid data.
    Stream(BitStreamError),
    /// The body decoded but violated a packet-level rule.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownTag(tag) => write!(f, "unknown packet tag {tag}"),
            ProtocolError::Stream(e) => write!(f, "packet stream error: {e}"),
            ProtocolError::Malformed(why) => write!(f, "malformed packet: {why}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<BitStreamError> for ProtocolError {
    fn from(e: BitStreamError) -> Self {
        ProtocolError::Stream(e)
    }
}

/// A message type with a bit-level encoding.
pub trait Packet: Into<NetMessage> + Sized + 'static {
    /// Human readable name, used in logs.
    const NAME: &'static str;

    fn serialize(&self, stream: &mut BitStream) -> BitResult<()>;

    fn deserialize(stream: &mut BitStream) -> Result<Self, ProtocolError>;
}

type DecodeFn = fn(&mut BitStream) -> Result<NetMessage, ProtocolError>;

fn decode_as<P: Packet>(stream: &mut BitStream) -> Result<NetMessage, ProtocolError> {
    P::deserialize(stream).map(Into::into)
}

struct RegistryEntry {
    name: &'static str,
    decode: DecodeFn,
}

/// Maps packet types to dense wire tags and back.
///
/// Registration order defines the tags. The registry is built once at
/// startup and shared read-only afterwards.
#[derive(Default)]
pub struct PacketRegistry {
    entries: Vec<RegistryEntry>,
    tags: HashMap<TypeId, u8>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every packet type both ends speak, in wire order.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register::<JoinPacket>();
        registry.register::<JoinedPacket>();
        registry.register::<InputPacket>();
        registry.register::<UpdatePacket>();
        registry.register::<PingPacket>();
        registry.register::<DisconnectPacket>();
        registry
    }

    /// Assigns the next tag to `P` and returns it.
    ///
    /// # Panics
    /// If `P` is already registered or all 256 tags are taken.
    pub fn register<P: Packet>(&mut self) -> u8 {
        let type_id = TypeId::of::<P>();
        assert!(
            !self.tags.contains_key(&type_id),
            "packet {} registered twice",
            P::NAME
        );
        let tag = u8::try_from(self.entries.len())
            .unwrap_or_else(|_| panic!("no packet tag left for {}", P::NAME));
        self.entries.push(RegistryEntry {
            name: P::NAME,
            decode: decode_as::<P>,
        });
        self.tags.insert(type_id, tag);
        tag
    }

    pub fn tag_of<P: Packet>(&self) -> Option<u8> {
        self.tags.get(&TypeId::of::<P>()).copied()
    }

    pub fn name_of(&self, tag: u8) -> Option<&'static str> {
        self.entries.get(tag as usize).map(|e| e.name)
    }

    /// Packet names in tag order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn decoder(&self, tag: u8) -> Option<DecodeFn> {
        self.entries.get(tag as usize).map(|e| e.decode)
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A bit stream that reads and writes whole tagged packets.
#[derive(Debug)]
pub struct PacketStream {
    registry: Arc<PacketRegistry>,
    stream: BitStream,
}

impl PacketStream {
    pub fn new(registry: Arc<PacketRegistry>, stream: BitStream) -> Self {
        Self { registry, stream }
    }

    /// Empty outgoing stream of `size` bytes.
    pub fn with_capacity(registry: Arc<PacketRegistry>, size: usize) -> Self {
        Self::new(registry, BitStream::new(size))
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn stream(&self) -> &BitStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut BitStream {
        &mut self.stream
    }

    pub fn into_inner(self) -> BitStream {
        self.stream
    }

    pub fn reset(&mut self) {
        self.stream.reset();
    }

    /// Bytes written so far.
    pub fn written_bytes(&self) -> &[u8] {
        self.stream.written_bytes()
    }

    /// Appends one tagged packet. On failure the cursor is rolled back to
    /// where the packet started.
    ///
    /// # Panics
    /// If `P` is not registered.
    pub fn write_packet<P: Packet>(&mut self, packet: &P) -> BitResult<()> {
        let tag = self
            .registry
            .tag_of::<P>()
            .unwrap_or_else(|| panic!("packet {} is not registered", P::NAME));
        let start = self.stream.position();
        let result = self
            .stream
            .write_u8(tag)
            .and_then(|()| packet.serialize(&mut self.stream))
            .and_then(|()| self.stream.align_to_byte());
        if result.is_err() {
            self.stream.set_position(start);
        }
        result
    }

    /// Appends a packet held in a [`NetMessage`].
    pub fn write_message(&mut self, message: &NetMessage) -> BitResult<()> {
        match message {
            NetMessage::Join(p) => self.write_packet(p),
            NetMessage::Joined(p) => self.write_packet(p),
            NetMessage::Input(p) => self.write_packet(p),
            NetMessage::Update(p) => self.write_packet(p),
            NetMessage::Ping(p) => self.write_packet(p),
            NetMessage::Disconnect(p) => self.write_packet(p),
        }
    }

    /// Reads the next packet, or `None` once fewer than a tag's worth of
    /// bits remain.
    pub fn read_packet(&mut self) -> Result<Option<NetMessage>, ProtocolError> {
        if self.stream.remaining_bits() < PACKET_TAG_BITS as usize {
            return Ok(None);
        }
        let tag = self.stream.read_u8()?;
        let decode = self
            .registry
            .decoder(tag)
            .ok_or(ProtocolError::UnknownTag(tag))?;
        let message = decode(&mut self.stream)?;
        self.stream.skip_to_byte()?;
        Ok(Some(message))
    }

    /// Bulk copies everything written to `other` into this stream.
    /// Both streams must be byte aligned.
    pub fn copy_aligned(&mut self, other: &BitStream) -> BitResult<()> {
        if !other.is_aligned() {
            return Err(BitStreamError::Misaligned {
                bit_index: other.position(),
            });
        }
        self.stream.write_bytes(other.written_bytes())
    }
}

/// Decodes every packet in a received frame.
pub fn decode_frame(
    registry: &Arc<PacketRegistry>,
    frame: &[u8],
) -> Result<Vec<NetMessage>, ProtocolError> {
    let mut stream = PacketStream::new(Arc::clone(registry), BitStream::from_bytes(frame));
    let mut messages = Vec::new();
    while let Some(message) = stream.read_packet()? {
        messages.push(message);
    }
    Ok(messages)
}

/// Encodes `messages` into one frame of at most `capacity` bytes.
pub fn encode_frame(
    registry: &Arc<PacketRegistry>,
    messages: &[NetMessage],
    capacity: usize,
) -> BitResult<Bytes> {
    let mut stream = PacketStream::with_capacity(Arc::clone(registry), capacity);
    for message in messages {
        stream.write_message(message)?;
    }
    Ok(Bytes::copy_from_slice(stream.written_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::MovementFlags;

    fn registry() -> Arc<PacketRegistry> {
        Arc::new(PacketRegistry::standard())
    }

    #[test]
    fn standard_registry_order_is_stable() {
        let names: Vec<_> = PacketRegistry::standard().names().collect();
        assert_eq!(
            names,
            ["Join", "Joined", "Input", "Update", "Ping", "Disconnect"]
        );
        let r = PacketRegistry::standard();
        assert_eq!(r.tag_of::<JoinPacket>(), Some(0));
        assert_eq!(r.tag_of::<DisconnectPacket>(), Some(5));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let mut r = PacketRegistry::new();
        r.register::<PingPacket>();
        r.register::<PingPacket>();
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn writing_unregistered_packet_panics() {
        let mut r = PacketRegistry::new();
        r.register::<PingPacket>();
        let mut s = PacketStream::with_capacity(Arc::new(r), 16);
        let _ = s.write_packet(&JoinedPacket {
            player_id: crate::object::ObjectId(1),
            world_width: 10.0,
            world_height: 10.0,
        });
    }

    #[test]
    fn several_packets_share_a_frame() {
        let r = registry();
        let messages = vec![
            NetMessage::Ping(PingPacket { timestamp: 99 }),
            NetMessage::Input(InputPacket {
                sequence: 7,
                movement: MovementFlags::UP | MovementFlags::LEFT,
                rotation: 0.25,
                attacking: true,
            }),
            NetMessage::Disconnect(DisconnectPacket {
                reason: "bye".into(),
            }),
        ];
        let frame = encode_frame(&r, &messages, 64).unwrap();
        let back = decode_frame(&r, &frame).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0], messages[0]);
        assert_eq!(back[2], messages[2]);
        match &back[1] {
            NetMessage::Input(input) => {
                assert_eq!(input.sequence, 7);
                assert_eq!(input.movement, MovementFlags::UP | MovementFlags::LEFT);
                assert!((input.rotation - 0.25).abs() < 1e-3);
                assert!(input.attacking);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fewer_bits_than_a_tag_end_the_stream() {
        let r = registry();
        let ping = PingPacket { timestamp: 42 };
        let mut out = PacketStream::with_capacity(Arc::clone(&r), 16);
        out.write_packet(&ping).unwrap();
        out.stream_mut().write_bits(0b101, 3).unwrap();
        let bytes = out.written_bytes().to_vec();

        let mut input = PacketStream::new(Arc::clone(&r), BitStream::from_bytes(bytes));
        assert_eq!(input.read_packet(), Ok(Some(NetMessage::Ping(ping))));
        assert_eq!(input.stream_mut().read_bits(3), Ok(0b101));
        assert_eq!(input.stream().remaining_bits(), 5);
        assert_eq!(input.read_packet(), Ok(None));
        assert_eq!(input.read_packet(), Ok(None));
    }

    #[test]
    fn unknown_tag_rejects_whole_frame() {
        let r = registry();
        let mut frame = encode_frame(&r, &[NetMessage::Ping(PingPacket { timestamp: 1 })], 16)
            .unwrap()
            .to_vec();
        frame.push(200);
        assert_eq!(decode_frame(&r, &frame), Err(ProtocolError::UnknownTag(200)));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let r = registry();
        let frame = encode_frame(&r, &[NetMessage::Ping(PingPacket { timestamp: 1 })], 16).unwrap();
        let err = decode_frame(&r, &frame[..3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Stream(BitStreamError::OutOfBounds { .. })));
    }

    #[test]
    fn failed_write_rolls_back_cursor() {
        let mut s = PacketStream::with_capacity(registry(), 4);
        s.write_packet(&PingPacket { timestamp: 5 }).unwrap_err();
        assert_eq!(s.stream().position(), 0);
        s.write_packet(&DisconnectPacket { reason: "".into() }).unwrap();
        assert_eq!(s.written_bytes().len(), 2);
    }

    #[test]
    fn copy_aligned_appends_bytes() {
        let r = registry();
        let mut inner = PacketStream::with_capacity(Arc::clone(&r), 16);
        inner.write_packet(&PingPacket { timestamp: 42 }).unwrap();

        let mut outer = PacketStream::with_capacity(Arc::clone(&r), 32);
        outer.write_packet(&PingPacket { timestamp: 41 }).unwrap();
        outer.copy_aligned(inner.stream()).unwrap();

        let back = decode_frame(&r, outer.written_bytes()).unwrap();
        assert_eq!(
            back,
            vec![
                NetMessage::Ping(PingPacket { timestamp: 41 }),
                NetMessage::Ping(PingPacket { timestamp: 42 }),
            ]
        );
    }
}
