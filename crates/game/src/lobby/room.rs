use serde::{Deserialize, Serialize};

use super::ConnectionId;
use super::protocol::{RoomId, RoomRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomState {
    Empty,
    Filling,
    CountingDown,
    InGame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    /// 1-based slot number.
    pub slot: u8,
    /// Zero until the player has identified.
    pub identity: u64,
    pub name: String,
    pub ready: bool,
}

impl PlayerInfo {
    pub fn is_identified(&self) -> bool {
        self.identity != 0
    }
}

#[derive(Debug, Clone)]
pub struct Seat {
    pub conn: ConnectionId,
    pub player: PlayerInfo,
}

#[derive(Debug, Clone, Default)]
pub struct Countdown {
    pub active: bool,
    pub remaining_secs: f32,
    pub last_broadcast_second: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownTick {
    Idle,
    Announce(u8),
    Expired,
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub in_game: bool,
    pub countdown: Countdown,
    /// Connection that created the room; an empty room dies with it.
    pub creator: Option<ConnectionId>,
    slots: Vec<Option<Seat>>,
}

impl Room {
    pub fn new(id: RoomId, name: String, capacity: u8) -> Self {
        Self {
            id,
            name,
            in_game: false,
            countdown: Countdown::default(),
            creator: None,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn state(&self) -> RoomState {
        if self.in_game {
            RoomState::InGame
        } else if self.countdown.active {
            RoomState::CountingDown
        } else if self.is_empty() {
            RoomState::Empty
        } else {
            RoomState::Filling
        }
    }

    pub fn capacity(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn player_count(&self) -> u8 {
        self.slots.iter().filter(|s| s.is_some()).count() as u8
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn seats(&self) -> impl Iterator<Item = &Seat> {
        self.slots.iter().flatten()
    }

    pub fn seat(&self, slot: u8) -> Option<&Seat> {
        self.slots
            .get((slot as usize).checked_sub(1)?)
            .and_then(|s| s.as_ref())
    }

    pub fn seat_mut(&mut self, slot: u8) -> Option<&mut Seat> {
        self.slots
            .get_mut((slot as usize).checked_sub(1)?)
            .and_then(|s| s.as_mut())
    }

    pub fn slot_of(&self, conn: ConnectionId) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|seat| seat.conn == conn))
            .map(|idx| idx as u8 + 1)
    }

    /// Places `conn` in the first free slot.
    pub fn occupy(&mut self, conn: ConnectionId) -> Option<u8> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        let slot = idx as u8 + 1;
        self.slots[idx] = Some(Seat {
            conn,
            player: PlayerInfo {
                slot,
                identity: 0,
                name: String::new(),
                ready: false,
            },
        });
        Some(slot)
    }

    pub fn vacate(&mut self, slot: u8) -> Option<Seat> {
        self.slots
            .get_mut((slot as usize).checked_sub(1)?)
            .and_then(|s| s.take())
    }

    pub fn all_ready(&self) -> bool {
        self.seats().all(|seat| seat.player.ready)
    }

    pub fn can_start(&self, min_players: u8) -> bool {
        !self.in_game && self.player_count() >= min_players.max(1) && self.all_ready()
    }

    pub fn start_countdown(&mut self, seconds: u8) {
        self.countdown = Countdown {
            active: true,
            remaining_secs: seconds as f32,
            last_broadcast_second: seconds,
        };
    }

    /// Returns true when a running countdown was stopped.
    pub fn cancel_countdown(&mut self) -> bool {
        let was_active = self.countdown.active;
        self.countdown = Countdown::default();
        was_active
    }

    /// Advances the countdown. Announces each whole second once, comparing the
    /// ceiling of the timer with the last announced value.
    pub fn tick_countdown(&mut self, dt: f32) -> CountdownTick {
        if !self.countdown.active {
            return CountdownTick::Idle;
        }

        self.countdown.remaining_secs -= dt;
        if self.countdown.remaining_secs <= 0.0 {
            self.countdown = Countdown::default();
            return CountdownTick::Expired;
        }

        let second = self.countdown.remaining_secs.ceil() as u8;
        if second < self.countdown.last_broadcast_second {
            self.countdown.last_broadcast_second = second;
            CountdownTick::Announce(second)
        } else {
            CountdownTick::Idle
        }
    }

    pub fn clear_ready(&mut self) {
        for seat in self.slots.iter_mut().flatten() {
            seat.player.ready = false;
        }
    }

    pub fn to_record(&self) -> RoomRecord {
        RoomRecord {
            id: self.id,
            name: self.name.clone(),
            player_count: self.player_count(),
            max_players: self.capacity(),
            in_game: self.in_game,
        }
    }
}
