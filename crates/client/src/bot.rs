use std::time::{Duration, Instant};

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use skirmish::{InputFlags, MovementConfig};

const ARRIVE_DISTANCE: f32 = 16.0;
const AXIS_DEADZONE: f32 = 4.0;
const RETARGET_AFTER: Duration = Duration::from_secs(4);

/// Wanders between random waypoints and fires in bursts.
pub struct Bot {
    rng: ChaCha8Rng,
    min: Vec2,
    max: Vec2,
    waypoint: Option<Vec2>,
    retarget_at: Instant,
    firing: bool,
    toggle_fire_at: Instant,
}

impl Bot {
    pub fn new(seed: u64, movement: &MovementConfig, now: Instant) -> Self {
        let margin = movement.player_radius * 2.0;
        let min = Vec2::splat(margin);
        let max = Vec2::new(movement.arena_width, movement.arena_height) - margin;
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            min,
            max: max.max(min + Vec2::ONE),
            waypoint: None,
            retarget_at: now,
            firing: false,
            toggle_fire_at: now,
        }
    }

    pub fn waypoint(&self) -> Option<Vec2> {
        self.waypoint
    }

    /// Buttons to hold this frame given where the player currently is.
    pub fn buttons(&mut self, position: Option<Vec2>, now: Instant) -> InputFlags {
        let Some(position) = position else {
            return InputFlags::empty();
        };

        let arrived = self
            .waypoint
            .is_some_and(|w| w.distance(position) < ARRIVE_DISTANCE);
        if self.waypoint.is_none() || arrived || now >= self.retarget_at {
            let next = Vec2::new(
                self.rng.gen_range(self.min.x..self.max.x),
                self.rng.gen_range(self.min.y..self.max.y),
            );
            log::trace!("Bot heading to ({:.0}, {:.0})", next.x, next.y);
            self.waypoint = Some(next);
            self.retarget_at = now + RETARGET_AFTER;
        }

        if now >= self.toggle_fire_at {
            self.firing = !self.firing;
            let burst = self.rng.gen_range(300..1200);
            self.toggle_fire_at = now + Duration::from_millis(burst);
        }

        let mut buttons = steer(position, self.waypoint.unwrap_or(position));
        if self.firing {
            buttons |= InputFlags::SHOOT;
        }
        buttons
    }
}

/// Direction buttons that move `from` toward `to`. Y grows downward.
fn steer(from: Vec2, to: Vec2) -> InputFlags {
    let delta = to - from;
    let mut buttons = InputFlags::empty();
    if delta.x > AXIS_DEADZONE {
        buttons |= InputFlags::RIGHT;
    } else if delta.x < -AXIS_DEADZONE {
        buttons |= InputFlags::LEFT;
    }
    if delta.y > AXIS_DEADZONE {
        buttons |= InputFlags::DOWN;
    } else if delta.y < -AXIS_DEADZONE {
        buttons |= InputFlags::UP;
    }
    buttons
}
