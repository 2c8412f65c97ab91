use std::collections::HashMap;

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::net::InputFlags;
use crate::snapshot::{EntityType, SimEntity, SyncId};
use crate::world::{EntityKey, World};

use super::movement::{MovementConfig, step_player};
use super::{LevelTransition, Simulation};

pub const FLAG_FIRING: u8 = 1 << 0;
pub const FLAG_HIT: u8 = 1 << 1;

const PLAYER_WEAPON: u8 = 1;

/// Reference top-down shooter: players move and fire upward, enemies drift
/// down from the top edge, and the world scrolls until the level ends.
#[derive(Debug)]
pub struct ArenaSimulation {
    config: MovementConfig,
    world: World,
    players: HashMap<u64, EntityKey>,
    inputs: HashMap<u64, InputFlags>,
    rng: ChaCha8Rng,
    world_offset: f32,
    level: u8,
    enemy_timer: f32,
    level_complete: Option<LevelTransition>,
}

impl ArenaSimulation {
    pub fn new(config: MovementConfig, seed: u64) -> Self {
        Self {
            enemy_timer: config.enemy_interval,
            config,
            world: World::new(),
            players: HashMap::new(),
            inputs: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            world_offset: 0.0,
            level: 1,
            level_complete: None,
        }
    }

    pub fn config(&self) -> &MovementConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn player(&self, identity: u64) -> Option<SimEntity> {
        let key = self.players.get(&identity)?;
        self.world.get(*key).map(|e| e.to_sim_entity())
    }

    fn move_players(&mut self, dt: f32) -> Vec<(u64, Vec2)> {
        let mut shots = Vec::new();
        for (identity, key) in &self.players {
            let buttons = self.inputs.get(identity).copied().unwrap_or_default();
            let Some(player) = self.world.get_mut(*key) else {
                continue;
            };

            let (position, velocity) =
                step_player(player.position, buttons, player.speed_multiplier, &self.config, dt);
            player.position = position;
            player.velocity = velocity;
            player.fire_cooldown = (player.fire_cooldown - dt).max(0.0);
            player.flags &= !(FLAG_FIRING | FLAG_HIT);

            if buttons.contains(InputFlags::SHOOT) && player.fire_cooldown <= 0.0 {
                player.fire_cooldown = self.config.fire_interval;
                player.flags |= FLAG_FIRING;
                shots.push((*identity, player.position));
            }
        }
        shots
    }

    fn fire(&mut self, owner: u64, origin: Vec2) {
        let key = self.world.spawn(EntityType::Bullet);
        if let Some(bullet) = self.world.get_mut(key) {
            bullet.owner = owner;
            bullet.position = origin - Vec2::new(0.0, self.config.player_radius);
            bullet.velocity = Vec2::new(0.0, -self.config.bullet_speed);
            bullet.health = 1;
            bullet.lifetime = Some(self.config.bullet_lifetime);
        }
    }

    fn spawn_enemies(&mut self, dt: f32) {
        self.enemy_timer -= dt;
        if self.enemy_timer > 0.0 {
            return;
        }
        self.enemy_timer += self.config.enemy_interval;

        let margin = self.config.enemy_radius;
        let x = self
            .rng
            .gen_range(margin..(self.config.arena_width - margin).max(margin + 1.0));
        let key = self.world.spawn(EntityType::Enemy);
        if let Some(enemy) = self.world.get_mut(key) {
            enemy.position = Vec2::new(x, -margin);
            enemy.velocity = Vec2::new(0.0, self.config.enemy_speed);
            enemy.health = self.config.enemy_health;
        }
    }

    fn integrate(&mut self, dt: f32) {
        let height = self.config.arena_height;
        let mut expired = Vec::new();
        for (key, entity) in self.world.entities_mut() {
            if entity.entity_type == EntityType::Player {
                continue;
            }
            entity.position += entity.velocity * dt;
            if let Some(lifetime) = entity.lifetime.as_mut() {
                *lifetime -= dt;
                if *lifetime <= 0.0 {
                    expired.push(key);
                    continue;
                }
            }
            let margin = self.config.enemy_radius * 2.0;
            if entity.position.y < -margin || entity.position.y > height + margin {
                expired.push(key);
            }
        }
        for key in expired {
            self.world.despawn(key);
        }
    }

    fn resolve_hits(&mut self) {
        let bullets: Vec<(EntityKey, Vec2, u64)> = self
            .world
            .entities()
            .filter(|(_, e)| e.entity_type == EntityType::Bullet)
            .map(|(key, e)| (key, e.position, e.owner))
            .collect();
        let reach = self.config.enemy_radius;

        for (bullet, position, owner) in bullets {
            let target = self
                .world
                .entities()
                .find(|(_, e)| {
                    e.entity_type == EntityType::Enemy && e.position.distance(position) <= reach
                })
                .map(|(key, _)| key);
            let Some(target) = target else {
                continue;
            };

            self.world.despawn(bullet);
            let killed = match self.world.get_mut(target) {
                Some(enemy) => {
                    enemy.health = enemy.health.saturating_sub(self.config.bullet_damage);
                    enemy.flags |= FLAG_HIT;
                    enemy.health == 0
                }
                None => false,
            };
            if killed {
                self.world.despawn(target);
                if let Some(shooter) = self.players.get(&owner).copied() {
                    if let Some(player) = self.world.get_mut(shooter) {
                        player.score = player.score.saturating_add(self.config.kill_score);
                    }
                }
            }
        }
    }

    fn scroll(&mut self, dt: f32) {
        self.world_offset += self.config.scroll_speed * dt;
        if self.world_offset < self.config.level_length {
            return;
        }

        let completed = self.level;
        let next = if completed < self.config.level_count {
            completed + 1
        } else {
            0
        };
        log::info!("Level {} complete, next {}", completed, next);
        self.level_complete = Some(LevelTransition { completed, next });
        self.world_offset = 0.0;
        if next != 0 {
            self.level = next;
        }
    }
}

impl Simulation for ArenaSimulation {
    fn spawn_player(&mut self, identity: u64, slot: u8) -> SyncId {
        if let Some(existing) = self.players.get(&identity) {
            if let Some(entity) = self.world.get(*existing) {
                return entity.sync_id;
            }
        }

        let key = self.world.spawn(EntityType::Player);
        let spacing = self.config.arena_width / 5.0;
        let config = &self.config;
        let player = match self.world.get_mut(key) {
            Some(player) => player,
            None => return 0,
        };
        player.owner = identity;
        player.position = Vec2::new(
            spacing * (slot.max(1) as f32),
            config.arena_height - config.player_radius * 4.0,
        );
        player.health = config.player_health;
        player.weapon = PLAYER_WEAPON;
        player.fire_rate = 1.0 / config.fire_interval;
        let sync_id = player.sync_id;

        self.players.insert(identity, key);
        sync_id
    }

    fn despawn_player(&mut self, identity: u64) {
        self.inputs.remove(&identity);
        if let Some(key) = self.players.remove(&identity) {
            self.world.despawn(key);
        }
    }

    fn apply_input(&mut self, identity: u64, buttons: InputFlags) {
        if self.players.contains_key(&identity) {
            self.inputs.insert(identity, buttons);
        }
    }

    fn advance(&mut self, dt: f32) {
        self.world.advance_tick();
        for (owner, origin) in self.move_players(dt) {
            self.fire(owner, origin);
        }
        self.spawn_enemies(dt);
        self.integrate(dt);
        self.resolve_hits();
        self.scroll(dt);
    }

    fn entities(&self) -> Vec<SimEntity> {
        self.world.project()
    }

    fn world_offset(&self) -> f32 {
        self.world_offset
    }

    fn take_level_complete(&mut self) -> Option<LevelTransition> {
        self.level_complete.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    #[test]
    fn player_moves_with_input() {
        let mut sim = ArenaSimulation::new(MovementConfig::default(), 7);
        sim.spawn_player(0xAA, 1);
        let start = sim.player(0xAA).unwrap().position;

        sim.apply_input(0xAA, InputFlags::RIGHT);
        sim.advance(DT);

        let moved = sim.player(0xAA).unwrap();
        assert!(moved.position.x > start.x);
        assert_eq!(moved.position.y, start.y);
    }

    #[test]
    fn spawn_player_is_idempotent() {
        let mut sim = ArenaSimulation::new(MovementConfig::default(), 7);
        let first = sim.spawn_player(1, 1);
        assert_eq!(sim.spawn_player(1, 1), first);
        assert_eq!(sim.entities().len(), 1);
    }

    #[test]
    fn shooting_respects_fire_interval() {
        let mut sim = ArenaSimulation::new(MovementConfig::default(), 7);
        sim.spawn_player(1, 1);
        sim.apply_input(1, InputFlags::SHOOT);
        for _ in 0..6 {
            sim.advance(DT);
        }

        let bullets = sim
            .entities()
            .iter()
            .filter(|e| e.entity_type == EntityType::Bullet)
            .count();
        assert_eq!(bullets, 1);
    }

    #[test]
    fn despawned_player_leaves_world() {
        let mut sim = ArenaSimulation::new(MovementConfig::default(), 7);
        let id = sim.spawn_player(5, 2);
        sim.despawn_player(5);
        assert!(sim.entities().iter().all(|e| e.id != id));
    }

    #[test]
    fn level_completes_after_scrolling() {
        let config = MovementConfig {
            level_length: 10.0,
            scroll_speed: 100.0,
            level_count: 1,
            ..MovementConfig::default()
        };
        let mut sim = ArenaSimulation::new(config, 1);
        sim.advance(0.2);
        assert_eq!(
            sim.take_level_complete(),
            Some(LevelTransition {
                completed: 1,
                next: 0
            })
        );
        assert!(sim.take_level_complete().is_none());
    }
}
