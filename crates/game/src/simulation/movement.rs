use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::net::InputFlags;

/// Tuning shared by the authoritative simulation and client prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub player_speed: f32,
    pub arena_width: f32,
    pub arena_height: f32,
    pub player_radius: f32,
    pub player_health: u16,
    pub bullet_speed: f32,
    pub bullet_lifetime: f32,
    pub bullet_damage: u16,
    pub fire_interval: f32,
    pub enemy_speed: f32,
    pub enemy_health: u16,
    pub enemy_radius: f32,
    pub enemy_interval: f32,
    pub kill_score: u32,
    pub scroll_speed: f32,
    pub level_length: f32,
    pub level_count: u8,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            player_speed: 220.0,
            arena_width: 800.0,
            arena_height: 600.0,
            player_radius: 12.0,
            player_health: 100,
            bullet_speed: 520.0,
            bullet_lifetime: 1.2,
            bullet_damage: 25,
            fire_interval: 0.2,
            enemy_speed: 90.0,
            enemy_health: 50,
            enemy_radius: 16.0,
            enemy_interval: 1.5,
            kill_score: 10,
            scroll_speed: 40.0,
            level_length: 2400.0,
            level_count: 3,
        }
    }
}

pub fn input_direction(buttons: InputFlags) -> Vec2 {
    let mut direction = Vec2::ZERO;
    if buttons.contains(InputFlags::LEFT) {
        direction.x -= 1.0;
    }
    if buttons.contains(InputFlags::RIGHT) {
        direction.x += 1.0;
    }
    if buttons.contains(InputFlags::UP) {
        direction.y -= 1.0;
    }
    if buttons.contains(InputFlags::DOWN) {
        direction.y += 1.0;
    }
    direction.normalize_or_zero()
}

/// One fixed step of player movement. Returns the new position and the
/// velocity that produced it. The position is kept inside the arena.
pub fn step_player(
    position: Vec2,
    buttons: InputFlags,
    speed_multiplier: f32,
    config: &MovementConfig,
    dt: f32,
) -> (Vec2, Vec2) {
    let velocity = input_direction(buttons) * config.player_speed * speed_multiplier;
    let min = Vec2::splat(config.player_radius);
    let max = Vec2::new(
        config.arena_width - config.player_radius,
        config.arena_height - config.player_radius,
    );
    let next = (position + velocity * dt).clamp(min, max.max(min));
    (next, velocity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_is_normalized() {
        let direction = input_direction(InputFlags::UP | InputFlags::RIGHT);
        assert!((direction.length() - 1.0).abs() < 1e-5);
        assert!(direction.x > 0.0 && direction.y < 0.0);
    }

    #[test]
    fn opposing_buttons_cancel() {
        assert_eq!(input_direction(InputFlags::LEFT | InputFlags::RIGHT), Vec2::ZERO);
    }

    #[test]
    fn step_stays_inside_arena() {
        let config = MovementConfig::default();
        let (position, velocity) = step_player(
            Vec2::new(config.player_radius, 300.0),
            InputFlags::LEFT,
            1.0,
            &config,
            1.0,
        );
        assert_eq!(position.x, config.player_radius);
        assert!(velocity.x < 0.0);
    }
}
