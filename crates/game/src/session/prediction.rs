use std::collections::VecDeque;

use glam::Vec2;

use crate::net::{InputFlags, sequence_greater_than};
use crate::simulation::{MovementConfig, step_player};

const MAX_PENDING_INPUTS: usize = 128;

#[derive(Debug, Clone)]
struct PendingInput {
    sequence: u32,
    position_after: Vec2,
}

/// Local prediction of the controlled entity, reconciled against the
/// server position for the newest input the server reports as processed.
#[derive(Debug)]
pub struct ClientPrediction {
    pending: VecDeque<PendingInput>,
    position: Vec2,
    prev_position: Vec2,
    visual_position: Vec2,
    position_error: Vec2,
    last_acked_sequence: u32,
    speed_multiplier: f32,
    movement: MovementConfig,
    correction_speed: f32,
    error_threshold: f32,
    snap_threshold: f32,
    dt: f32,
}

impl ClientPrediction {
    pub fn new(tick_rate: u32, movement: MovementConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(MAX_PENDING_INPUTS),
            position: Vec2::ZERO,
            prev_position: Vec2::ZERO,
            visual_position: Vec2::ZERO,
            position_error: Vec2::ZERO,
            last_acked_sequence: 0,
            speed_multiplier: 1.0,
            movement,
            correction_speed: 20.0,
            error_threshold: 0.0001,
            snap_threshold: 32.0,
            dt: 1.0 / tick_rate.max(1) as f32,
        }
    }

    pub fn with_thresholds(
        mut self,
        correction_speed: f32,
        error_threshold: f32,
        snap_threshold: f32,
    ) -> Self {
        self.correction_speed = correction_speed;
        self.error_threshold = error_threshold;
        self.snap_threshold = snap_threshold;
        self
    }

    pub fn set_speed_multiplier(&mut self, speed_multiplier: f32) {
        self.speed_multiplier = speed_multiplier;
    }

    pub fn prepare_tick(&mut self) {
        self.prev_position = self.position;
    }

    pub fn apply_input(&mut self, buttons: InputFlags) {
        let (position, _) = step_player(
            self.position,
            buttons,
            self.speed_multiplier,
            &self.movement,
            self.dt,
        );
        self.position = position;
    }

    pub fn store_input(&mut self, sequence: u32) {
        self.pending.push_back(PendingInput {
            sequence,
            position_after: self.position,
        });

        while self.pending.len() > MAX_PENDING_INPUTS {
            self.pending.pop_front();
        }
    }

    /// Exponential decay of the visual error.
    pub fn update(&mut self, dt: f32) {
        let decay = (-self.correction_speed * dt).exp();
        self.position_error *= decay;
    }

    pub fn update_visuals(&mut self, alpha: f32) {
        let interpolated = self.prev_position.lerp(self.position, alpha);
        self.visual_position = interpolated + self.position_error;
    }

    pub fn reconcile(&mut self, server_position: Vec2, acked_sequence: u32) {
        if !sequence_greater_than(acked_sequence, self.last_acked_sequence) {
            return;
        }
        self.last_acked_sequence = acked_sequence;

        while self
            .pending
            .front()
            .is_some_and(|input| sequence_greater_than(acked_sequence, input.sequence))
        {
            self.pending.pop_front();
        }

        if self
            .pending
            .front()
            .is_none_or(|input| input.sequence != acked_sequence)
        {
            return;
        }
        let Some(acked) = self.pending.pop_front() else {
            return;
        };

        let server_error = server_position - acked.position_after;
        let error_magnitude = server_error.length();
        if error_magnitude < self.error_threshold {
            return;
        }

        self.position += server_error;
        self.prev_position += server_error;
        for input in &mut self.pending {
            input.position_after += server_error;
        }

        if error_magnitude > self.snap_threshold {
            self.position_error = Vec2::ZERO;
        } else {
            // Keep the visual where it was; the error decays in `update`.
            self.position_error -= server_error;
        }
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn predicted_position(&self) -> Vec2 {
        self.visual_position
    }

    pub fn last_acked_sequence(&self) -> u32 {
        self.last_acked_sequence
    }

    pub fn reset(&mut self, position: Vec2) {
        self.pending.clear();
        self.position = position;
        self.prev_position = position;
        self.visual_position = position;
        self.position_error = Vec2::ZERO;
    }

    pub fn pending_input_count(&self) -> usize {
        self.pending.len()
    }
}
