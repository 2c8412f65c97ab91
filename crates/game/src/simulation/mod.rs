mod arena;
mod movement;
mod tick;

use crate::net::InputFlags;
use crate::snapshot::{SimEntity, SyncId};

pub use arena::{ArenaSimulation, FLAG_FIRING, FLAG_HIT};
pub use movement::{MovementConfig, input_direction, step_player};
pub use tick::FixedTimestep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelTransition {
    pub completed: u8,
    /// 0 when there is no further level.
    pub next: u8,
}

/// Gameplay seam driven by a session. Implementations own every rule about
/// movement, combat and spawning; the session only feeds inputs, advances
/// time and reads back the synchronizable entities.
pub trait Simulation: Send {
    /// Returns the sync id of the entity the player controls.
    fn spawn_player(&mut self, identity: u64, slot: u8) -> SyncId;

    fn despawn_player(&mut self, identity: u64);

    fn apply_input(&mut self, identity: u64, buttons: InputFlags);

    fn advance(&mut self, dt: f32);

    fn entities(&self) -> Vec<SimEntity>;

    fn world_offset(&self) -> f32;

    fn take_level_complete(&mut self) -> Option<LevelTransition>;
}
