//! Static game data.
//!
//! Definitions are referenced on the wire by their index, so entries are
//! only ever appended.

use crate::hitbox::{GeometryError, Hitbox};
use crate::math::Vec2;

pub const PLAYER_RADIUS: f32 = 2.25;
pub const PLAYER_MAX_HEALTH: f32 = 100.0;

/// Radius within which a player picks up loot.
pub const PICKUP_RADIUS: f32 = 3.0;

/// Scale a damaged obstacle shrinks towards before it breaks.
pub const MIN_OBSTACLE_SCALE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObstacleShape {
    Circle { radius: f32 },
    Rect { width: f32, height: f32 },
    Polygon(&'static [(f32, f32)]),
}

impl ObstacleShape {
    /// Hitbox centred on the origin at scale 1.
    pub fn hitbox(&self) -> Result<Hitbox, GeometryError> {
        match *self {
            ObstacleShape::Circle { radius } => Ok(Hitbox::circle(radius, Vec2::ZERO)),
            ObstacleShape::Rect { width, height } => {
                let half = Vec2::new(width / 2.0, height / 2.0);
                Ok(Hitbox::rect(-half, half))
            }
            ObstacleShape::Polygon(points) => {
                Hitbox::polygon(points.iter().map(|&(x, y)| Vec2::new(x, y)).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleDefinition {
    pub name: &'static str,
    pub shape: ObstacleShape,
    pub health: f32,
    /// Whether the obstacle may be spawned at an arbitrary angle.
    pub rotatable: bool,
    /// Loot dropped when destroyed.
    pub loot: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponDefinition {
    pub name: &'static str,
    pub damage: f32,
    /// Ticks between shots.
    pub fire_delay: u32,
    /// World units per second.
    pub bullet_speed: f32,
    /// Distance a bullet travels before it is dropped.
    pub range: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LootDefinition {
    pub name: &'static str,
    /// Weapon granted on pickup.
    pub weapon: u8,
    pub radius: f32,
}

pub const OBSTACLES: &[ObstacleDefinition] = &[
    ObstacleDefinition {
        name: "tree",
        shape: ObstacleShape::Circle { radius: 3.5 },
        health: 120.0,
        rotatable: true,
        loot: None,
    },
    ObstacleDefinition {
        name: "crate",
        shape: ObstacleShape::Rect {
            width: 7.0,
            height: 7.0,
        },
        health: 80.0,
        rotatable: false,
        loot: Some(1),
    },
    ObstacleDefinition {
        name: "rock",
        shape: ObstacleShape::Polygon(&[
            (4.0, 0.0),
            (2.0, 3.5),
            (-2.0, 3.5),
            (-4.0, 0.0),
            (-2.0, -3.5),
            (2.0, -3.5),
        ]),
        health: 200.0,
        rotatable: true,
        loot: None,
    },
];

pub const WEAPONS: &[WeaponDefinition] = &[
    WeaponDefinition {
        name: "fists",
        damage: 15.0,
        fire_delay: 8,
        bullet_speed: 240.0,
        range: 4.0,
    },
    WeaponDefinition {
        name: "pistol",
        damage: 20.0,
        fire_delay: 6,
        bullet_speed: 160.0,
        range: 80.0,
    },
    WeaponDefinition {
        name: "rifle",
        damage: 14.0,
        fire_delay: 3,
        bullet_speed: 220.0,
        range: 140.0,
    },
];

pub const LOOT: &[LootDefinition] = &[
    LootDefinition {
        name: "pistol",
        weapon: 1,
        radius: 1.5,
    },
    LootDefinition {
        name: "rifle",
        weapon: 2,
        radius: 1.5,
    },
];

pub fn obstacle(id: u8) -> Option<&'static ObstacleDefinition> {
    OBSTACLES.get(id as usize)
}

pub fn weapon(id: u8) -> Option<&'static WeaponDefinition> {
    WEAPONS.get(id as usize)
}

pub fn loot(id: u8) -> Option<&'static LootDefinition> {
    LOOT.get(id as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_obstacle_shape_builds() {
        for def in OBSTACLES {
            let hitbox = def.shape.hitbox().unwrap();
            assert!(hitbox.center().approx_eq(Vec2::ZERO, 1e-4), "{}", def.name);
        }
    }

    #[test]
    fn cross_references_resolve() {
        for def in OBSTACLES {
            if let Some(id) = def.loot {
                assert!(loot(id).is_some(), "{} drops unknown loot {id}", def.name);
            }
        }
        for def in LOOT {
            assert!(weapon(def.weapon).is_some(), "{}", def.name);
        }
    }
}
