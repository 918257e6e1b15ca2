//! Input handling.
//!
//! Raw keyboard and mouse capture live outside this crate. This module turns
//! a sampled `InputState` into the `InputPacket` sent once per client tick.

use shooter_shared::{
    math::{normalize_angle, Vec2},
    packets::{InputPacket, MovementFlags},
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    /// Aim angle in radians, 0 along +x.
    pub aim: f32,
    pub attacking: bool,
}

impl InputState {
    pub fn movement(self) -> MovementFlags {
        let mut flags = MovementFlags::empty();
        flags.set(MovementFlags::UP, self.up);
        flags.set(MovementFlags::DOWN, self.down);
        flags.set(MovementFlags::LEFT, self.left);
        flags.set(MovementFlags::RIGHT, self.right);
        flags
    }

    /// Aims from `from` towards `target`. Keeps the old aim when both points
    /// coincide.
    pub fn aim_at(mut self, from: Vec2, target: Vec2) -> Self {
        let d = target - from;
        if d.len_sq() > 0.0 {
            self.aim = d.angle();
        }
        self
    }
}

/// Turns sampled input into the packet for one tick.
pub fn build_input(sequence: u16, input: InputState) -> InputPacket {
    InputPacket {
        sequence,
        movement: input.movement(),
        rotation: normalize_angle(input.aim),
        attacking: input.attacking,
    }
}
