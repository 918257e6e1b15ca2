//! Authoritative simulation.
//!
//! Owns every object, the spatial grid and the replicator, and keeps the
//! three in step: anything that moves is re-indexed in the grid, and any
//! replicated change raises the matching dirty flag.
//!
//! Determinism notes:
//! - Map generation and spawn points come from a seeded `StdRng`.
//! - Players are processed in id order.

use std::collections::BTreeSet;
use std::f32::consts::PI;

use anyhow::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use shooter_shared::{
    config::ServerConfig,
    definitions::{self, LOOT, OBSTACLES, PICKUP_RADIUS, PLAYER_RADIUS},
    grid::Grid,
    hitbox::{Hitbox, RectangleHitbox},
    math::Vec2,
    object::ObjectId,
    packets::{BulletEvent, InputPacket, PlayerData},
};
use tracing::{debug, info, warn};

use crate::objects::{GameObject, Loot, NetObject, ObjectArena, Obstacle, ObstacleHit, Player};
use crate::replication::{ReplicationError, Replicator, Viewer, ViewerExtras, ViewerJob};

/// Spawn attempts per object before giving up on a free spot.
const SPAWN_ATTEMPTS: usize = 32;

/// A bullet in flight.
#[derive(Debug, Clone)]
struct Bullet {
    shooter: ObjectId,
    weapon: u8,
    position: Vec2,
    direction: Vec2,
    travelled: f32,
}

pub struct Game {
    cfg: ServerConfig,
    objects: ObjectArena<GameObject>,
    grid: Grid,
    replicator: Replicator,
    bullets: Vec<Bullet>,
    /// Shots fired this tick, reported to every viewer.
    new_bullets: Vec<BulletEvent>,
    rng: StdRng,
    tick: u64,
}

impl Game {
    /// Builds a world from `cfg` and scatters obstacles and loot on it.
    pub fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid server config")?;
        let mut game = Self {
            grid: Grid::new(cfg.world_width, cfg.world_height, cfg.grid_cell_size),
            replicator: Replicator::new(cfg.payload_sizes),
            objects: ObjectArena::new(),
            bullets: Vec::new(),
            new_bullets: Vec::new(),
            rng: StdRng::seed_from_u64(cfg.seed),
            tick: 0,
            cfg,
        };
        game.generate_map()?;
        Ok(game)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn world_size(&self) -> Vec2 {
        Vec2::new(self.cfg.world_width, self.cfg.world_height)
    }

    pub fn objects(&self) -> &ObjectArena<GameObject> {
        &self.objects
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn player(&self, id: ObjectId) -> Option<&Player> {
        self.objects.get(id).and_then(GameObject::as_player)
    }

    fn player_ids(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, o)| o.as_player().is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.player_ids().len()
    }

    pub fn alive_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|(_, o)| o.as_player().is_some_and(|p| !p.is_dead()))
            .count()
    }

    // ─── Spawning ───

    fn generate_map(&mut self) -> anyhow::Result<()> {
        let mut obstacles = 0;
        for _ in 0..self.cfg.obstacle_count * SPAWN_ATTEMPTS {
            if obstacles == self.cfg.obstacle_count {
                break;
            }
            let definition = self.rng.gen_range(0..OBSTACLES.len()) as u8;
            let rotation = if OBSTACLES[definition as usize].rotatable {
                self.rng.gen_range(-PI..PI)
            } else {
                0.0
            };
            let position = self.random_point(8.0);
            if self.spawn_obstacle(definition, position, rotation)?.is_some() {
                obstacles += 1;
            }
        }

        let mut loot = 0;
        for _ in 0..self.cfg.loot_count * SPAWN_ATTEMPTS {
            if loot == self.cfg.loot_count {
                break;
            }
            let definition = self.rng.gen_range(0..LOOT.len()) as u8;
            let position = self.random_point(4.0);
            let probe = Hitbox::circle(PICKUP_RADIUS, position);
            if !self.collides_with_solid(&probe, None) {
                self.spawn_loot(definition, position)?;
                loot += 1;
            }
        }

        info!(
            obstacles,
            loot,
            seed = self.cfg.seed,
            "Map generated"
        );
        Ok(())
    }

    /// Uniform point at least `margin` away from the world edges.
    fn random_point(&mut self, margin: f32) -> Vec2 {
        let axis = |rng: &mut StdRng, size: f32| {
            if size > 2.0 * margin {
                rng.gen_range(margin..size - margin)
            } else {
                size / 2.0
            }
        };
        let x = axis(&mut self.rng, self.cfg.world_width);
        let y = axis(&mut self.rng, self.cfg.world_height);
        Vec2::new(x, y)
    }

    fn collides_with_solid(&self, hitbox: &Hitbox, ignore: Option<ObjectId>) -> bool {
        self.grid.intersects_hitbox(hitbox).into_iter().any(|id| {
            Some(id) != ignore
                && self
                    .objects
                    .get(id)
                    .is_some_and(|o| o.is_solid() && hitbox.collides_with(NetObject::hitbox(o)))
        })
    }

    fn next_id(&mut self, make: impl FnOnce(ObjectId) -> GameObject) -> anyhow::Result<ObjectId> {
        let id = self
            .objects
            .insert_with(make)
            .context("object ids exhausted")?;
        if let Some(object) = self.objects.get(id) {
            self.grid.add_object(object);
        }
        self.replicator.register(id);
        Ok(id)
    }

    /// Places an obstacle unless it would overlap something solid.
    pub fn spawn_obstacle(
        &mut self,
        definition: u8,
        position: Vec2,
        rotation: f32,
    ) -> anyhow::Result<Option<ObjectId>> {
        let def = definitions::obstacle(definition)
            .with_context(|| format!("unknown obstacle definition {definition}"))?;
        let hitbox = def
            .shape
            .hitbox()
            .with_context(|| format!("obstacle {} has a bad shape", def.name))?
            .transform(position, 1.0, rotation);
        if self.collides_with_solid(&hitbox, None) {
            return Ok(None);
        }
        let health = def.health;
        self.next_id(|id| {
            GameObject::Obstacle(Obstacle::new(id, definition, position, rotation, hitbox, health))
        })
        .map(Some)
    }

    pub fn spawn_loot(&mut self, definition: u8, position: Vec2) -> anyhow::Result<ObjectId> {
        self.next_id(|id| GameObject::Loot(Loot::new(id, definition, position)))
    }

    /// Adds a player at a free spot.
    pub fn spawn_player(&mut self, name: &str) -> anyhow::Result<ObjectId> {
        if self.player_count() >= self.cfg.max_players {
            anyhow::bail!("server full ({} players)", self.cfg.max_players);
        }
        let mut position = self.random_point(PLAYER_RADIUS);
        for _ in 0..SPAWN_ATTEMPTS {
            if !self.collides_with_solid(&Hitbox::circle(PLAYER_RADIUS, position), None) {
                break;
            }
            position = self.random_point(PLAYER_RADIUS);
        }
        let id = self.spawn_player_at(name, position)?;
        info!(player = %id, name, x = position.x, y = position.y, "Player spawned");
        Ok(id)
    }

    /// Adds a player at `position` without looking for a free spot.
    pub fn spawn_player_at(&mut self, name: &str, position: Vec2) -> anyhow::Result<ObjectId> {
        let position = self.clamp_to_world(position, PLAYER_RADIUS);
        self.next_id(|id| GameObject::Player(Player::new(id, name, position)))
    }

    fn despawn(&mut self, id: ObjectId) {
        self.objects.remove(id);
        self.grid.remove_object(id);
        self.replicator.unregister(id);
    }

    pub fn remove_player(&mut self, id: ObjectId) {
        if self.player(id).is_some() {
            self.despawn(id);
            info!(player = %id, "Player removed");
        } else {
            warn!(player = %id, "remove_player on unknown player");
        }
    }

    // ─── Input ───

    /// Stores the latest input of `id`. Inputs older than the last applied
    /// one are dropped.
    pub fn apply_input(&mut self, id: ObjectId, input: &InputPacket) {
        let Some(player) = self.objects.get_mut(id).and_then(GameObject::as_player_mut) else {
            return;
        };
        if player.is_dead() {
            return;
        }
        if let Some(last) = player.last_input {
            if (input.sequence.wrapping_sub(last) as i16) <= 0 {
                debug!(player = %id, sequence = input.sequence, last, "stale input dropped");
                return;
            }
        }
        player.last_input = Some(input.sequence);
        player.movement = input.movement;
        player.attacking = input.attacking;
        if player.set_rotation(input.rotation) {
            self.replicator.mark_partial(id);
        }
    }

    // ─── Simulation ───

    /// Advances the world by `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        self.tick += 1;
        let players = self.player_ids();
        for &id in &players {
            self.move_player(id, dt);
        }
        for &id in &players {
            self.fire(id);
        }
        self.advance_bullets(dt);
        for &id in &players {
            self.pickup_loot(id);
        }
    }

    fn clamp_to_world(&self, p: Vec2, radius: f32) -> Vec2 {
        let min = Vec2::new(radius, radius);
        let max = Vec2::new(
            (self.cfg.world_width - radius).max(radius),
            (self.cfg.world_height - radius).max(radius),
        );
        p.clamp(min, max)
    }

    fn move_player(&mut self, id: ObjectId, dt: f32) {
        let Some(player) = self.player(id) else {
            return;
        };
        let direction = player.movement.direction();
        if player.is_dead() || direction == Vec2::ZERO {
            return;
        }
        let mut target = player.position() + direction * (self.cfg.player_speed * dt);
        target = self.clamp_to_world(target, PLAYER_RADIUS);

        let probe = Hitbox::circle(PLAYER_RADIUS, target);
        for other in self.grid.intersects_hitbox(&probe) {
            let Some(GameObject::Obstacle(obstacle)) = self.objects.get(other) else {
                continue;
            };
            if obstacle.is_destroyed() {
                continue;
            }
            let body = Hitbox::circle(PLAYER_RADIUS, target);
            if let Some(response) = body.intersection(obstacle.hitbox()) {
                target -= response.normal * response.penetration;
            }
        }
        target = self.clamp_to_world(target, PLAYER_RADIUS);

        let Some(player) = self.objects.get_mut(id).and_then(GameObject::as_player_mut) else {
            return;
        };
        if player.set_position(target) {
            if let Some(object) = self.objects.get(id) {
                self.grid.update_object(object);
            }
            self.replicator.mark_partial(id);
        }
    }

    fn fire(&mut self, id: ObjectId) {
        let Some(player) = self.objects.get_mut(id).and_then(GameObject::as_player_mut) else {
            return;
        };
        if player.is_dead() {
            return;
        }
        player.cooldown = player.cooldown.saturating_sub(1);
        if !player.attacking || player.cooldown > 0 {
            return;
        }
        let Some(weapon) = definitions::weapon(player.active_weapon()) else {
            return;
        };
        player.cooldown = weapon.fire_delay;

        let origin = player.position();
        let rotation = player.rotation();
        self.bullets.push(Bullet {
            shooter: id,
            weapon: player.active_weapon(),
            position: origin,
            direction: Vec2::from_angle(rotation),
            travelled: 0.0,
        });
        self.new_bullets.push(BulletEvent {
            shooter: id,
            origin,
            rotation,
            weapon: player.active_weapon(),
        });
    }

    /// Nearest solid object hit by the segment `a -> b`, ignoring `shooter`.
    fn cast(&self, a: Vec2, b: Vec2, shooter: ObjectId) -> Option<ObjectId> {
        self.grid
            .intersect_line_segment(a, b)
            .into_iter()
            .filter(|&id| id != shooter)
            .filter_map(|id| {
                let object = self.objects.get(id)?;
                if !object.is_solid() {
                    return None;
                }
                let hit = NetObject::hitbox(object).intersects_line(a, b)?;
                Some(((hit.point - a).len_sq(), id))
            })
            .min_by(|x, y| x.0.total_cmp(&y.0))
            .map(|(_, id)| id)
    }

    fn advance_bullets(&mut self, dt: f32) {
        let world = RectangleHitbox::new(Vec2::ZERO, self.world_size());
        for mut bullet in std::mem::take(&mut self.bullets) {
            let Some(weapon) = definitions::weapon(bullet.weapon) else {
                continue;
            };
            let step = (weapon.bullet_speed * dt).min(weapon.range - bullet.travelled);
            let end = bullet.position + bullet.direction * step;
            if let Some(target) = self.cast(bullet.position, end, bullet.shooter) {
                self.hit(target, bullet.shooter, weapon.damage);
                continue;
            }
            bullet.position = end;
            bullet.travelled += step;
            if bullet.travelled < weapon.range && world.is_point_inside(end) {
                self.bullets.push(bullet);
            }
        }
    }

    fn hit(&mut self, target: ObjectId, shooter: ObjectId, damage: f32) {
        match self.objects.get_mut(target) {
            Some(GameObject::Player(player)) => {
                let killed = player.damage(damage);
                self.replicator.mark_full(target);
                if killed {
                    info!(player = %target, killer = %shooter, "Player killed");
                    if let Some(killer) = self.objects.get_mut(shooter).and_then(GameObject::as_player_mut) {
                        killer.kills = killer.kills.saturating_add(1);
                    }
                }
            }
            Some(GameObject::Obstacle(obstacle)) => {
                let outcome = obstacle.damage(damage);
                let position = obstacle.position();
                let definition = obstacle.definition;
                match outcome {
                    ObstacleHit::Ignored => {}
                    ObstacleHit::Damaged => {
                        if let Some(object) = self.objects.get(target) {
                            self.grid.update_object(object);
                        }
                        self.replicator.mark_partial(target);
                    }
                    ObstacleHit::Destroyed => {
                        self.replicator.mark_partial(target);
                        debug!(obstacle = %target, "Obstacle destroyed");
                        if let Some(loot) = definitions::obstacle(definition).and_then(|d| d.loot) {
                            if let Err(e) = self.spawn_loot(loot, position) {
                                warn!(error = %e, "failed to drop loot");
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn pickup_loot(&mut self, id: ObjectId) {
        let Some(player) = self.player(id) else {
            return;
        };
        if player.is_dead() {
            return;
        }
        let reach = Hitbox::circle(PICKUP_RADIUS, player.position());
        let found = self.grid.intersects_hitbox(&reach).into_iter().find_map(|other| {
            let loot = self.objects.get(other)?.as_loot()?;
            reach
                .collides_with(loot.hitbox())
                .then_some((other, loot.definition))
        });
        let Some((loot_id, definition)) = found else {
            return;
        };
        let Some(weapon) = definitions::loot(definition).map(|d| d.weapon) else {
            return;
        };
        if let Some(player) = self.objects.get_mut(id).and_then(GameObject::as_player_mut) {
            if player.set_active_weapon(weapon) {
                self.replicator.mark_full(id);
            }
        }
        self.despawn(loot_id);
        debug!(player = %id, loot = %loot_id, weapon, "Loot picked up");
    }

    // ─── Replication ───

    /// Objects inside `player`'s view square.
    pub fn view_of(&self, player: ObjectId) -> BTreeSet<ObjectId> {
        let Some(center) = self.player(player).map(Player::position) else {
            return BTreeSet::new();
        };
        let side = self.cfg.view_radius * 2.0;
        let view = Hitbox::Rect(RectangleHitbox::from_center(center, side, side));
        self.grid
            .intersects_hitbox(&view)
            .into_iter()
            .filter(|&id| {
                self.objects
                    .get(id)
                    .is_some_and(|o| view.collides_with(NetObject::hitbox(o)))
            })
            .collect()
    }

    pub fn player_data(&self, id: ObjectId) -> Option<PlayerData> {
        self.player(id).map(|p| PlayerData {
            health: p.health(),
            kills: p.kills,
        })
    }

    /// Renders snapshots of everything that changed this tick.
    pub fn bake(&mut self) -> Result<(), ReplicationError> {
        self.replicator.bake(&self.objects)
    }

    /// Builds the update of each `(player, viewer)` pair, in order.
    pub fn serve_viewers<'a>(
        &'a self,
        viewers: impl IntoIterator<Item = (ObjectId, &'a mut Viewer)>,
    ) -> Vec<Result<Option<bytes::Bytes>, ReplicationError>> {
        let alive = Some(self.alive_count().min(u8::MAX as usize) as u8);
        let jobs = viewers.into_iter().map(|(player, viewer)| ViewerJob {
            viewer,
            in_view: self.view_of(player),
            extras: ViewerExtras {
                bullets: &self.new_bullets,
                player_data: self.player_data(player),
                alive_count: alive,
            },
        });
        self.replicator.serve_viewers(jobs)
    }

    /// Clears per-tick state once every viewer has been served.
    pub fn end_tick(&mut self) {
        self.replicator.end_tick();
        self.objects.recycle_released();
        self.new_bullets.clear();
    }
}
