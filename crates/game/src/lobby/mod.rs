mod client;
pub mod protocol;
mod room;
mod server;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, check_range};
use crate::net::ExpectedPlayer;

pub use client::LobbyConnection;
pub use protocol::{JoinStatus, LobbyErrorCode, LobbyPacket, RoomId, RoomRecord};
pub use room::{Countdown, CountdownTick, PlayerInfo, Room, RoomState, Seat};
pub use server::LobbyServer;

/// Transport-level handle for one reliable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub max_rooms: usize,
    pub slots_per_room: u8,
    pub min_players: u8,
    pub countdown_secs: u8,
    pub tick_rate: u16,
    pub auto_countdown: bool,
    /// First UDP port handed to sessions; 0 leaves the choice to the host.
    pub session_port_base: u16,
    pub session_port_count: u16,
    pub seed: Option<u64>,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            max_rooms: 16,
            slots_per_room: 4,
            min_players: 2,
            countdown_secs: 3,
            tick_rate: 60,
            auto_countdown: true,
            session_port_base: 0,
            session_port_count: 64,
            seed: None,
        }
    }
}

impl LobbyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_rooms", self.max_rooms as u64, 1, u32::MAX as u64)?;
        check_range("slots_per_room", self.slots_per_room as u64, 1, 64)?;
        check_range(
            "min_players",
            self.min_players as u64,
            1,
            self.slots_per_room as u64,
        )?;
        check_range("tick_rate", self.tick_rate as u64, 1, 1000)?;
        if self.session_port_base != 0 {
            check_range("session_port_count", self.session_port_count as u64, 1, 4096)?;
        }
        Ok(())
    }
}

/// Everything the session layer needs to take over a room that just started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandoff {
    pub room_id: RoomId,
    pub seed: u32,
    pub tick_rate: u16,
    pub session_port: u16,
    pub roster: Vec<ExpectedPlayer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub conn: ConnectionId,
    pub packet: LobbyPacket,
}

/// Multiplexes rooms for many reliable connections. Transport agnostic:
/// feed it decoded bytes and drain the packets it wants sent.
#[derive(Debug)]
pub struct RoomManager {
    config: LobbyConfig,
    rooms: BTreeMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, Option<RoomId>>,
    next_room_id: RoomId,
    next_session_port: u16,
    issued_identities: HashSet<u64>,
    rng: ChaCha8Rng,
    outbound: VecDeque<Outbound>,
    handoffs: VecDeque<SessionHandoff>,
}

impl RoomManager {
    pub fn new(config: LobbyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Ok(Self {
            rooms: BTreeMap::new(),
            memberships: HashMap::new(),
            next_room_id: 1,
            next_session_port: 0,
            issued_identities: HashSet::new(),
            rng,
            outbound: VecDeque::new(),
            handoffs: VecDeque::new(),
            config,
        })
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_of(&self, conn: ConnectionId) -> Option<RoomId> {
        self.memberships.get(&conn).copied().flatten()
    }

    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }

    pub fn drain_outbound(&mut self) -> impl Iterator<Item = Outbound> + '_ {
        self.outbound.drain(..)
    }

    pub fn drain_handoffs(&mut self) -> impl Iterator<Item = SessionHandoff> + '_ {
        self.handoffs.drain(..)
    }

    pub fn connect(&mut self, conn: ConnectionId) {
        self.memberships.entry(conn).or_insert(None);
    }

    /// A dropped connection leaves its room and takes any empty rooms it
    /// created with it.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.leave(conn);
        self.reap_abandoned(conn);
        self.memberships.remove(&conn);
    }

    /// Decodes and dispatches one framed packet. Malformed input is dropped.
    pub fn handle_packet(&mut self, conn: ConnectionId, data: &[u8]) {
        match LobbyPacket::decode(data) {
            Ok(packet) => self.handle(conn, packet),
            Err(e) => log::debug!("Dropping malformed lobby packet from {:?}: {}", conn, e),
        }
    }

    pub fn handle(&mut self, conn: ConnectionId, packet: LobbyPacket) {
        self.connect(conn);

        match packet {
            LobbyPacket::ListRoomsReq => self.list_rooms(conn),
            LobbyPacket::CreateRoomReq { name } => self.create_room(conn, &name),
            LobbyPacket::JoinRoomReq { room_id } => self.join_room(conn, room_id),
            LobbyPacket::ConnectReq { name } => self.identify(conn, &name),
            LobbyPacket::ReadyReq => self.toggle_ready(conn),
            LobbyPacket::StartReq => self.request_start(conn),
            LobbyPacket::Disconnect => {
                self.leave(conn);
                self.reap_abandoned(conn);
            }
            other => log::debug!(
                "Ignoring server-bound opcode {:#04x} from {:?}",
                other.opcode(),
                conn
            ),
        }
    }

    pub fn list_rooms(&mut self, conn: ConnectionId) {
        let rooms = self.rooms.values().map(Room::to_record).collect();
        self.send(conn, LobbyPacket::ListRoomsAck { rooms });
    }

    pub fn create_room(&mut self, conn: ConnectionId, name: &str) {
        if self.rooms.len() >= self.config.max_rooms {
            self.send_error(conn, LobbyErrorCode::RoomLimit, "room limit reached");
            return;
        }

        let id = self.next_room_id;
        self.next_room_id = self.next_room_id.wrapping_add(1).max(1);

        let name = if name.is_empty() {
            format!("Room {}", id)
        } else {
            name.to_string()
        };
        let mut room = Room::new(id, name, self.config.slots_per_room);
        room.creator = Some(conn);
        let record = room.to_record();
        self.rooms.insert(id, room);

        log::info!("Room {} '{}' created", id, record.name);
        self.send(conn, LobbyPacket::CreateRoomAck { room: record });
    }

    pub fn join_room(&mut self, conn: ConnectionId, room_id: RoomId) {
        if let Some(current) = self.room_of(conn) {
            if current == room_id {
                let slot = self.rooms.get(&room_id).and_then(|r| r.slot_of(conn));
                self.send(
                    conn,
                    LobbyPacket::JoinRoomAck {
                        status: JoinStatus::Success,
                        room_id,
                        slot: slot.unwrap_or(0),
                    },
                );
                return;
            }
            self.leave(conn);
        }

        let status = match self.rooms.get(&room_id) {
            None => JoinStatus::RoomNotFound,
            Some(room) if room.in_game => JoinStatus::RoomInGame,
            Some(room) if room.is_full() => JoinStatus::RoomFull,
            Some(_) => JoinStatus::Success,
        };

        if status != JoinStatus::Success {
            log::debug!("Join of room {} by {:?} rejected: {:?}", room_id, conn, status);
            self.send(
                conn,
                LobbyPacket::JoinRoomAck {
                    status,
                    room_id,
                    slot: 0,
                },
            );
            return;
        }

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(slot) = room.occupy(conn) else {
            return;
        };
        self.memberships.insert(conn, Some(room_id));

        self.outbound.push_back(Outbound {
            conn,
            packet: LobbyPacket::JoinRoomAck {
                status: JoinStatus::Success,
                room_id,
                slot,
            },
        });

        // Bring the joiner's view of the room up to date.
        for seat in room.seats() {
            if seat.conn != conn && seat.player.is_identified() {
                self.outbound.push_back(Outbound {
                    conn,
                    packet: player_join_packet(&seat.player),
                });
            }
        }

        // The newcomer is not ready yet.
        if room.cancel_countdown() {
            log::info!("Room {} countdown cancelled by new arrival", room_id);
            broadcast(
                &mut self.outbound,
                room,
                LobbyPacket::Countdown { seconds: 0 },
                None,
            );
        }

        log::info!("{:?} joined room {} in slot {}", conn, room_id, slot);
    }

    pub fn identify(&mut self, conn: ConnectionId, name: &str) {
        let Some((room_id, slot)) = self.seat_of(conn) else {
            self.send_error(conn, LobbyErrorCode::NotInRoom, "join a room first");
            return;
        };

        let existing = self
            .rooms
            .get(&room_id)
            .and_then(|r| r.seat(slot))
            .map(|s| s.player.identity)
            .unwrap_or(0);

        let identity = if existing != 0 {
            existing
        } else {
            self.generate_identity()
        };

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(seat) = room.seat_mut(slot) else {
            return;
        };
        seat.player.identity = identity;
        seat.player.name = name.to_string();
        let announcement = player_join_packet(&seat.player);

        self.outbound.push_back(Outbound {
            conn,
            packet: LobbyPacket::ConnectAck { slot, identity },
        });
        broadcast(&mut self.outbound, room, announcement, Some(conn));

        log::info!(
            "Slot {} in room {} identified as '{}' ({:#018x})",
            slot,
            room_id,
            name,
            identity
        );
    }

    pub fn toggle_ready(&mut self, conn: ConnectionId) {
        let Some((room_id, slot)) = self.identified_seat(conn) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if room.in_game {
            return;
        }
        let Some(seat) = room.seat_mut(slot) else {
            return;
        };

        seat.player.ready = !seat.player.ready;
        let ready = seat.player.ready;
        broadcast(
            &mut self.outbound,
            room,
            LobbyPacket::PlayerReady { slot, ready },
            None,
        );

        if !ready {
            if room.cancel_countdown() {
                log::info!("Room {} countdown cancelled", room_id);
                broadcast(
                    &mut self.outbound,
                    room,
                    LobbyPacket::Countdown { seconds: 0 },
                    None,
                );
            }
        } else if self.config.auto_countdown
            && !room.countdown.active
            && room.can_start(self.config.min_players)
        {
            start_countdown(&mut self.outbound, room, self.config.countdown_secs);
        }
    }

    pub fn request_start(&mut self, conn: ConnectionId) {
        let Some((room_id, _)) = self.identified_seat(conn) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if room.in_game || room.countdown.active {
            return;
        }

        if room.can_start(self.config.min_players) {
            start_countdown(&mut self.outbound, room, self.config.countdown_secs);
        } else {
            self.send_error(
                conn,
                LobbyErrorCode::CannotStart,
                "all players must be ready",
            );
        }
    }

    pub fn leave(&mut self, conn: ConnectionId) {
        let Some((room_id, slot)) = self.seat_of(conn) else {
            return;
        };
        self.memberships.insert(conn, None);

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        room.vacate(slot);
        log::info!("Slot {} left room {}", slot, room_id);

        broadcast(
            &mut self.outbound,
            room,
            LobbyPacket::PlayerLeft { slot },
            None,
        );
        if room.cancel_countdown() {
            log::info!("Room {} countdown cancelled by departure", room_id);
            broadcast(
                &mut self.outbound,
                room,
                LobbyPacket::Countdown { seconds: 0 },
                None,
            );
        }

        if room.is_empty() && !room.in_game {
            self.rooms.remove(&room_id);
            log::info!("Room {} destroyed", room_id);
        }
    }

    /// Advances every running countdown by `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        let mut started = Vec::new();

        for room in self.rooms.values_mut() {
            match room.tick_countdown(dt) {
                CountdownTick::Idle => {}
                CountdownTick::Announce(seconds) => {
                    broadcast(
                        &mut self.outbound,
                        room,
                        LobbyPacket::Countdown { seconds },
                        None,
                    );
                }
                CountdownTick::Expired if room.can_start(self.config.min_players) => {
                    started.push(room.id)
                }
                CountdownTick::Expired => {
                    log::info!("Room {} no longer startable, countdown dropped", room.id);
                    broadcast(
                        &mut self.outbound,
                        room,
                        LobbyPacket::Countdown { seconds: 0 },
                        None,
                    );
                }
            }
        }

        for room_id in started {
            self.begin_game(room_id);
        }
    }

    /// Returns an in-game room to the filling state once its session ends.
    pub fn finish_game(&mut self, room_id: RoomId) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        room.in_game = false;
        room.clear_ready();
        if room.is_empty() {
            self.rooms.remove(&room_id);
            log::info!("Room {} destroyed after game", room_id);
        } else {
            log::info!("Room {} back to filling", room_id);
        }
    }

    fn begin_game(&mut self, room_id: RoomId) {
        let seed = loop {
            let candidate: u32 = self.rng.r#gen();
            if candidate != 0 {
                break candidate;
            }
        };
        let session_port = self.allocate_session_port();
        let tick_rate = self.config.tick_rate;

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        room.in_game = true;

        broadcast(
            &mut self.outbound,
            room,
            LobbyPacket::GameStart {
                seed,
                tick_rate,
                session_port,
            },
            None,
        );

        let roster = room
            .seats()
            .map(|seat| ExpectedPlayer {
                identity: seat.player.identity,
                slot: seat.player.slot,
                name: seat.player.name.clone(),
            })
            .collect();

        log::info!(
            "Room {} starting game with {} players (seed {:#010x})",
            room_id,
            room.player_count(),
            seed
        );

        self.handoffs.push_back(SessionHandoff {
            room_id,
            seed,
            tick_rate,
            session_port,
            roster,
        });
    }

    fn reap_abandoned(&mut self, conn: ConnectionId) {
        let abandoned: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|room| room.creator == Some(conn) && room.is_empty() && !room.in_game)
            .map(|room| room.id)
            .collect();
        for room_id in abandoned {
            self.rooms.remove(&room_id);
            log::info!("Room {} destroyed, creator gone", room_id);
        }
    }

    fn allocate_session_port(&mut self) -> u16 {
        if self.config.session_port_base == 0 {
            return 0;
        }
        let offset = self.next_session_port % self.config.session_port_count.max(1);
        self.next_session_port = self.next_session_port.wrapping_add(1);
        self.config.session_port_base.saturating_add(offset)
    }

    fn generate_identity(&mut self) -> u64 {
        loop {
            let candidate: u64 = self.rng.r#gen();
            if candidate != 0 && self.issued_identities.insert(candidate) {
                return candidate;
            }
        }
    }

    fn seat_of(&self, conn: ConnectionId) -> Option<(RoomId, u8)> {
        let room_id = self.room_of(conn)?;
        let slot = self.rooms.get(&room_id)?.slot_of(conn)?;
        Some((room_id, slot))
    }

    fn identified_seat(&mut self, conn: ConnectionId) -> Option<(RoomId, u8)> {
        let Some((room_id, slot)) = self.seat_of(conn) else {
            self.send_error(conn, LobbyErrorCode::NotInRoom, "join a room first");
            return None;
        };
        let identified = self
            .rooms
            .get(&room_id)
            .and_then(|r| r.seat(slot))
            .is_some_and(|s| s.player.is_identified());
        if !identified {
            self.send_error(conn, LobbyErrorCode::NotIdentified, "identify first");
            return None;
        }
        Some((room_id, slot))
    }

    fn send(&mut self, conn: ConnectionId, packet: LobbyPacket) {
        self.outbound.push_back(Outbound { conn, packet });
    }

    fn send_error(&mut self, conn: ConnectionId, code: LobbyErrorCode, message: &str) {
        self.send(
            conn,
            LobbyPacket::Error {
                code,
                message: message.to_string(),
            },
        );
    }
}

fn player_join_packet(player: &PlayerInfo) -> LobbyPacket {
    LobbyPacket::PlayerJoin {
        slot: player.slot,
        identity: player.identity,
        name: player.name.clone(),
        ready: player.ready,
    }
}

fn broadcast(
    outbound: &mut VecDeque<Outbound>,
    room: &Room,
    packet: LobbyPacket,
    except: Option<ConnectionId>,
) {
    for seat in room.seats() {
        if Some(seat.conn) != except {
            outbound.push_back(Outbound {
                conn: seat.conn,
                packet: packet.clone(),
            });
        }
    }
}

fn start_countdown(outbound: &mut VecDeque<Outbound>, room: &mut Room, seconds: u8) {
    room.start_countdown(seconds);
    log::info!("Room {} countdown started ({}s)", room.id, seconds);
    broadcast(outbound, room, LobbyPacket::Countdown { seconds }, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RoomManager {
        RoomManager::new(LobbyConfig {
            seed: Some(7),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn room_lifecycle() {
        let mut manager = manager();
        let a = ConnectionId(1);

        manager.create_room(a, "alpha");
        assert_eq!(manager.room_count(), 1);
        manager.join_room(a, 1);
        assert_eq!(manager.room(1).unwrap().state(), RoomState::Filling);

        manager.leave(a);
        assert_eq!(manager.room_count(), 0);
    }

    #[test]
    fn expired_countdown_rechecks_readiness() {
        let mut manager = RoomManager::new(LobbyConfig {
            countdown_secs: 1,
            seed: Some(3),
            ..Default::default()
        })
        .unwrap();
        let (a, b) = (ConnectionId(1), ConnectionId(2));
        manager.create_room(a, "r");
        for conn in [a, b] {
            manager.join_room(conn, 1);
            manager.identify(conn, "p");
            manager.toggle_ready(conn);
        }
        assert!(manager.room(1).unwrap().countdown.active);

        // A seat filled without going through join keeps the countdown running.
        manager.rooms.get_mut(&1).unwrap().occupy(ConnectionId(3));
        manager.drain_outbound().count();
        for _ in 0..20 {
            manager.update(0.1);
        }

        assert_eq!(manager.room(1).unwrap().state(), RoomState::Filling);
        assert_eq!(manager.drain_handoffs().count(), 0);
        assert!(
            manager
                .drain_outbound()
                .any(|o| o.packet == LobbyPacket::Countdown { seconds: 0 })
        );
    }

    #[test]
    fn room_limit_is_enforced() {
        let mut manager = RoomManager::new(LobbyConfig {
            max_rooms: 1,
            seed: Some(1),
            ..Default::default()
        })
        .unwrap();
        let a = ConnectionId(1);

        manager.create_room(a, "one");
        manager.drain_outbound().count();
        manager.create_room(a, "two");

        let out: Vec<_> = manager.drain_outbound().collect();
        assert!(matches!(
            out.as_slice(),
            [Outbound {
                packet: LobbyPacket::Error {
                    code: LobbyErrorCode::RoomLimit,
                    ..
                },
                ..
            }]
        ));
    }

    #[test]
    fn identities_are_unique_and_stable() {
        let mut manager = manager();
        let (a, b) = (ConnectionId(1), ConnectionId(2));
        manager.create_room(a, "r");
        manager.join_room(a, 1);
        manager.join_room(b, 1);
        manager.identify(a, "ann");
        manager.identify(b, "bob");
        manager.identify(a, "ann again");

        let room = manager.room(1).unwrap();
        let ida = room.seat(1).unwrap().player.identity;
        let idb = room.seat(2).unwrap().player.identity;
        assert_ne!(ida, 0);
        assert_ne!(ida, idb);

        let acks: Vec<u64> = manager
            .drain_outbound()
            .filter(|o| o.conn == a)
            .filter_map(|o| match o.packet {
                LobbyPacket::ConnectAck { identity, .. } => Some(identity),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![ida, ida]);
    }

    #[test]
    fn ready_requires_identity() {
        let mut manager = manager();
        let a = ConnectionId(1);
        manager.create_room(a, "r");
        manager.join_room(a, 1);
        manager.drain_outbound().count();

        manager.toggle_ready(a);
        let out: Vec<_> = manager.drain_outbound().collect();
        assert!(matches!(
            out[0].packet,
            LobbyPacket::Error {
                code: LobbyErrorCode::NotIdentified,
                ..
            }
        ));
        assert!(!manager.room(1).unwrap().seat(1).unwrap().player.ready);
    }

    #[test]
    fn explicit_start_when_auto_countdown_disabled() {
        let mut manager = RoomManager::new(LobbyConfig {
            auto_countdown: false,
            seed: Some(3),
            ..Default::default()
        })
        .unwrap();
        let (a, b) = (ConnectionId(1), ConnectionId(2));
        manager.create_room(a, "r");
        for (conn, name) in [(a, "a"), (b, "b")] {
            manager.join_room(conn, 1);
            manager.identify(conn, name);
        }

        manager.toggle_ready(a);
        manager.request_start(a);
        assert!(!manager.room(1).unwrap().countdown.active);

        manager.toggle_ready(b);
        assert!(!manager.room(1).unwrap().countdown.active);
        manager.request_start(b);
        assert_eq!(manager.room(1).unwrap().state(), RoomState::CountingDown);
    }

    #[test]
    fn session_ports_cycle_through_range() {
        let mut manager = RoomManager::new(LobbyConfig {
            session_port_base: 40000,
            session_port_count: 2,
            seed: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(manager.allocate_session_port(), 40000);
        assert_eq!(manager.allocate_session_port(), 40001);
        assert_eq!(manager.allocate_session_port(), 40000);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = LobbyConfig {
            slots_per_room: 2,
            min_players: 3,
            ..Default::default()
        };
        assert!(matches!(
            RoomManager::new(config),
            Err(ConfigError::TooLarge {
                field: "min_players",
                ..
            })
        ));
    }
}
