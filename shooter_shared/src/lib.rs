//! `shooter_shared`
//!
//! Code used by both client and server.
//!
//! Design goals:
//! - Deterministic geometry and encoding: both ends run the same code.
//! - Bit-exact wire format, described once and used by both directions.
//! - Clear separation of concerns (bit stream, geometry, protocol, spatial index, transport).
//! - No `unsafe`.

pub mod bitstream;
pub mod collision;
pub mod config;
pub mod definitions;
pub mod grid;
pub mod hitbox;
pub mod math;
pub mod net;
pub mod object;
pub mod packets;
pub mod protocol;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bitstream::{BitResult, BitStream, BitStreamError};
    pub use crate::collision::CollisionResponse;
    pub use crate::config::*;
    pub use crate::grid::{Grid, GridObject};
    pub use crate::hitbox::{Hitbox, LineIntersection, RectangleHitbox};
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::object::*;
    pub use crate::packets::*;
    pub use crate::protocol::*;
}
