//! Server-side objects.
//!
//! - [`ObjectArena`]: slots indexed by network id, with a pool of free ids.
//! - [`Player`], [`Obstacle`], [`Loot`]: simulated entities.
//! - [`GameObject`]: the closed set of entity kinds stored in the arena.
//!
//! Mutation methods return whether the replicated state changed, so the
//! caller knows which dirty flag to raise.

use std::collections::VecDeque;

use shooter_shared::{
    bitstream::{BitResult, BitStream},
    definitions::{self, MIN_OBSTACLE_SCALE, PLAYER_MAX_HEALTH, PLAYER_RADIUS},
    grid::GridObject,
    hitbox::{Hitbox, RectangleHitbox},
    math::{normalize_angle, Vec2},
    object::{
        FullState, LootFull, LootPartial, ObjectId, ObjectKind, ObstacleFull, ObstaclePartial,
        PartialState, PlayerFull, PlayerPartial, MAX_OBJECT_ID,
    },
    packets::MovementFlags,
};

/// An arena slot.
#[derive(Debug)]
pub enum Slot<T> {
    Free,
    Occupied(T),
}

/// Objects indexed by id.
///
/// Ids released during a tick are only handed out again after
/// [`ObjectArena::recycle_released`], so a viewer never sees an id deleted
/// and re-created within the same update.
#[derive(Debug)]
pub struct ObjectArena<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<ObjectId>,
    released: Vec<ObjectId>,
    next: u32,
    len: usize,
}

impl<T> Default for ObjectArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectArena<T> {
    pub fn new() -> Self {
        Self {
            // Slot 0 is never used.
            slots: vec![Slot::Free],
            free: VecDeque::new(),
            released: Vec::new(),
            next: 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn allocate(&mut self) -> Option<ObjectId> {
        if let Some(id) = self.free.pop_front() {
            return Some(id);
        }
        if self.next > u32::from(MAX_OBJECT_ID) {
            return None;
        }
        let id = ObjectId(self.next as u16);
        self.next += 1;
        Some(id)
    }

    /// Stores the value built by `make` under a fresh id. Returns `None`
    /// when every id is taken.
    pub fn insert_with(&mut self, make: impl FnOnce(ObjectId) -> T) -> Option<ObjectId> {
        let id = self.allocate()?;
        self.insert(id, make(id));
        Some(id)
    }

    /// Stores `value` under `id`.
    ///
    /// # Panics
    /// If `id` is occupied or is id 0.
    pub fn insert(&mut self, id: ObjectId, value: T) {
        assert!(id.0 != 0, "object id 0 is reserved");
        let index = id.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || Slot::Free);
        }
        match &self.slots[index] {
            Slot::Occupied(_) => panic!("object {id} registered twice"),
            Slot::Free => self.slots[index] = Slot::Occupied(value),
        }
        self.len += 1;
    }

    /// Takes the value out of `id`'s slot.
    ///
    /// # Panics
    /// If the slot is free.
    pub fn remove(&mut self, id: ObjectId) -> T {
        let slot = self
            .slots
            .get_mut(id.index())
            .map(|s| std::mem::replace(s, Slot::Free));
        match slot {
            Some(Slot::Occupied(value)) => {
                self.len -= 1;
                self.released.push(id);
                value
            }
            _ => panic!("object {id} freed while not registered"),
        }
    }

    /// Returns ids released since the last call to the free pool.
    pub fn recycle_released(&mut self) {
        self.free.extend(self.released.drain(..));
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Occupied slots in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied(value) => Some((ObjectId(i as u16), value)),
            Slot::Free => None,
        })
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

/// What the replicator needs from an entity.
pub trait NetObject: GridObject {
    fn kind(&self) -> ObjectKind;
    fn position(&self) -> Vec2;
    fn hitbox(&self) -> &Hitbox;
    fn serialize_partial(&self, stream: &mut BitStream) -> BitResult<()>;
    /// Fields sent after the partial ones in a full snapshot.
    fn serialize_full(&self, stream: &mut BitStream) -> BitResult<()>;
}

// ─── Player ───

#[derive(Debug)]
pub struct Player {
    pub id: ObjectId,
    pub name: String,
    position: Vec2,
    rotation: f32,
    health: f32,
    dead: bool,
    active_weapon: u8,
    pub kills: u16,
    pub movement: MovementFlags,
    pub attacking: bool,
    /// Sequence number of the last applied input.
    pub last_input: Option<u16>,
    /// Ticks until the weapon can fire again.
    pub cooldown: u32,
    hitbox: Hitbox,
}

impl Player {
    pub fn new(id: ObjectId, name: impl Into<String>, position: Vec2) -> Self {
        Self {
            id,
            name: name.into(),
            position,
            rotation: 0.0,
            health: PLAYER_MAX_HEALTH,
            dead: false,
            active_weapon: 0,
            kills: 0,
            movement: MovementFlags::empty(),
            attacking: false,
            last_input: None,
            cooldown: 0,
            hitbox: Hitbox::circle(PLAYER_RADIUS, position),
        }
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    pub fn health(&self) -> f32 {
        self.health
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn active_weapon(&self) -> u8 {
        self.active_weapon
    }

    pub fn hitbox(&self) -> &Hitbox {
        &self.hitbox
    }

    pub fn set_position(&mut self, position: Vec2) -> bool {
        if position == self.position {
            return false;
        }
        self.position = position;
        self.hitbox = Hitbox::circle(PLAYER_RADIUS, position);
        true
    }

    pub fn set_rotation(&mut self, rotation: f32) -> bool {
        let rotation = normalize_angle(rotation);
        if rotation == self.rotation {
            return false;
        }
        self.rotation = rotation;
        true
    }

    pub fn set_active_weapon(&mut self, weapon: u8) -> bool {
        if weapon == self.active_weapon || definitions::weapon(weapon).is_none() {
            return false;
        }
        self.active_weapon = weapon;
        true
    }

    /// Applies damage. Returns true when this hit killed the player.
    pub fn damage(&mut self, amount: f32) -> bool {
        if self.dead {
            return false;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
            self.dead = true;
            self.attacking = false;
            self.movement = MovementFlags::empty();
        }
        self.dead
    }

    pub fn partial_state(&self) -> PartialState {
        PartialState::Player(PlayerPartial {
            position: self.position,
            rotation: self.rotation,
        })
    }

    pub fn full_state(&self) -> FullState {
        FullState::Player(PlayerFull {
            dead: self.dead,
            health: self.health,
            active_weapon: self.active_weapon,
        })
    }
}

// ─── Obstacle ───

/// Outcome of hitting an obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleHit {
    Ignored,
    Damaged,
    Destroyed,
}

#[derive(Debug)]
pub struct Obstacle {
    pub id: ObjectId,
    pub definition: u8,
    position: Vec2,
    rotation: f32,
    scale: f32,
    health: f32,
    max_health: f32,
    destroyed: bool,
    hitbox: Hitbox,
}

impl Obstacle {
    /// Places definition `definition` at `position`. `hitbox` must already
    /// be transformed into world space.
    pub fn new(
        id: ObjectId,
        definition: u8,
        position: Vec2,
        rotation: f32,
        hitbox: Hitbox,
        health: f32,
    ) -> Self {
        Self {
            id,
            definition,
            position,
            rotation,
            scale: 1.0,
            health,
            max_health: health,
            destroyed: false,
            hitbox,
        }
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn hitbox(&self) -> &Hitbox {
        &self.hitbox
    }

    /// Shrinks the obstacle with its remaining health and breaks it at zero.
    pub fn damage(&mut self, amount: f32) -> ObstacleHit {
        if self.destroyed {
            return ObstacleHit::Ignored;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
            self.destroyed = true;
            return ObstacleHit::Destroyed;
        }
        let target = MIN_OBSTACLE_SCALE + (1.0 - MIN_OBSTACLE_SCALE) * self.health / self.max_health;
        self.hitbox.scale(target / self.scale);
        self.scale = target;
        ObstacleHit::Damaged
    }

    pub fn partial_state(&self) -> PartialState {
        PartialState::Obstacle(ObstaclePartial {
            scale: self.scale,
            destroyed: self.destroyed,
        })
    }

    pub fn full_state(&self) -> FullState {
        FullState::Obstacle(ObstacleFull {
            position: self.position,
            rotation: self.rotation,
            definition: self.definition,
        })
    }
}

// ─── Loot ───

#[derive(Debug)]
pub struct Loot {
    pub id: ObjectId,
    pub definition: u8,
    pub count: u8,
    position: Vec2,
    hitbox: Hitbox,
}

impl Loot {
    pub fn new(id: ObjectId, definition: u8, position: Vec2) -> Self {
        let radius = definitions::loot(definition).map_or(1.0, |d| d.radius);
        Self {
            id,
            definition,
            count: 1,
            position,
            hitbox: Hitbox::circle(radius, position),
        }
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn hitbox(&self) -> &Hitbox {
        &self.hitbox
    }

    pub fn partial_state(&self) -> PartialState {
        PartialState::Loot(LootPartial {
            position: self.position,
        })
    }

    pub fn full_state(&self) -> FullState {
        FullState::Loot(LootFull {
            definition: self.definition,
            count: self.count,
        })
    }
}

// ─── GameObject ───

#[derive(Debug)]
pub enum GameObject {
    Player(Player),
    Obstacle(Obstacle),
    Loot(Loot),
}

impl GameObject {
    pub fn as_player(&self) -> Option<&Player> {
        match self {
            GameObject::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut Player> {
        match self {
            GameObject::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_obstacle(&self) -> Option<&Obstacle> {
        match self {
            GameObject::Obstacle(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_obstacle_mut(&mut self) -> Option<&mut Obstacle> {
        match self {
            GameObject::Obstacle(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_loot(&self) -> Option<&Loot> {
        match self {
            GameObject::Loot(l) => Some(l),
            _ => None,
        }
    }

    fn partial_state(&self) -> PartialState {
        match self {
            GameObject::Player(p) => p.partial_state(),
            GameObject::Obstacle(o) => o.partial_state(),
            GameObject::Loot(l) => l.partial_state(),
        }
    }

    fn full_state(&self) -> FullState {
        match self {
            GameObject::Player(p) => p.full_state(),
            GameObject::Obstacle(o) => o.full_state(),
            GameObject::Loot(l) => l.full_state(),
        }
    }

    /// Whether bullets and players collide with this object.
    pub fn is_solid(&self) -> bool {
        match self {
            GameObject::Player(p) => !p.is_dead(),
            GameObject::Obstacle(o) => !o.is_destroyed(),
            GameObject::Loot(_) => false,
        }
    }
}

impl GridObject for GameObject {
    fn object_id(&self) -> ObjectId {
        match self {
            GameObject::Player(p) => p.id,
            GameObject::Obstacle(o) => o.id,
            GameObject::Loot(l) => l.id,
        }
    }

    fn bounding_rect(&self) -> RectangleHitbox {
        NetObject::hitbox(self).to_rectangle()
    }
}

impl NetObject for GameObject {
    fn kind(&self) -> ObjectKind {
        match self {
            GameObject::Player(_) => ObjectKind::Player,
            GameObject::Obstacle(_) => ObjectKind::Obstacle,
            GameObject::Loot(_) => ObjectKind::Loot,
        }
    }

    fn position(&self) -> Vec2 {
        match self {
            GameObject::Player(p) => p.position(),
            GameObject::Obstacle(o) => o.position(),
            GameObject::Loot(l) => l.position(),
        }
    }

    fn hitbox(&self) -> &Hitbox {
        match self {
            GameObject::Player(p) => p.hitbox(),
            GameObject::Obstacle(o) => o.hitbox(),
            GameObject::Loot(l) => l.hitbox(),
        }
    }

    fn serialize_partial(&self, stream: &mut BitStream) -> BitResult<()> {
        self.partial_state().serialize(stream)
    }

    fn serialize_full(&self, stream: &mut BitStream) -> BitResult<()> {
        self.full_state().serialize(stream)
    }
}
