use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::ConfigError;
use crate::net::{
    ConnectionManager, DeltaUpdate, ExpectedPlayer, InputAck, InputPacket, NetworkStats,
    SessionPacket, StateUpdate,
};
use crate::simulation::{FixedTimestep, LevelTransition, Simulation};
use crate::snapshot::{SimEntity, Snapshot, SnapshotHistory, SyncId, diff};

use super::delta::build_delta;
use super::{BroadcastMode, DisconnectReason, SessionConfig, SessionEvent};

struct LevelNotice {
    transition: LevelTransition,
    until: Instant,
}

/// Authoritative end of one game session. Pure: datagrams and time go in,
/// addressed packets come out through [`SessionServer::drain_outbound`].
pub struct SessionServer<S: Simulation> {
    config: SessionConfig,
    connections: ConnectionManager,
    simulation: S,
    history: SnapshotHistory,
    timestep: FixedTimestep,
    tick: u32,
    sequence: u32,
    start: Instant,
    last_update: Instant,
    level_notice: Option<LevelNotice>,
    rng: ChaCha8Rng,
    outbound: VecDeque<(SocketAddr, SessionPacket)>,
    events: VecDeque<SessionEvent>,
    stats: NetworkStats,
}

impl<S: Simulation> SessionServer<S> {
    pub fn new(
        config: SessionConfig,
        roster: Vec<ExpectedPlayer>,
        simulation: S,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if roster.len() > config.max_clients {
            return Err(ConfigError::TooLarge {
                field: "roster",
                max: config.max_clients as u64,
                value: roster.len() as u64,
            });
        }

        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Ok(Self {
            connections: ConnectionManager::new(
                roster,
                config.max_clients,
                config.liveness_timeout(),
            ),
            simulation,
            history: SnapshotHistory::new(config.history_len),
            timestep: FixedTimestep::new(config.tick_rate),
            tick: 0,
            sequence: 0,
            start: now,
            last_update: now,
            level_notice: None,
            rng,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            stats: NetworkStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Sequence of the newest delta update, 0 before the first one.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn last_processed_input(&self, identity: u64) -> Option<u32> {
        self.connections
            .get(identity)
            .map(|player| player.last_processed_input)
    }

    pub fn drain_outbound(&mut self) -> impl Iterator<Item = (SocketAddr, SessionPacket)> + '_ {
        self.outbound.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    fn send(&mut self, addr: SocketAddr, packet: SessionPacket) {
        self.outbound.push_back((addr, packet));
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start).as_millis() as u64
    }

    /// Decodes and dispatches one datagram. Malformed packets and packets
    /// from senders that are not bound to the claimed identity are dropped.
    pub fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        self.stats.record_received(data.len());

        let packet = match SessionPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}: {}", addr, e);
                self.stats.record_dropped();
                return;
            }
        };

        match packet {
            SessionPacket::Hello { identity, name } => self.handle_hello(addr, identity, &name, now),
            SessionPacket::Input(input) => self.handle_input(addr, input, now),
            SessionPacket::StateAck { identity, sequence } => {
                self.handle_state_ack(addr, identity, sequence, now)
            }
            SessionPacket::Ping { timestamp } => {
                if let Some(identity) = self.connections.identity_at(&addr) {
                    self.touch(identity, now);
                    self.send(addr, SessionPacket::Pong { timestamp });
                }
            }
            SessionPacket::Pong { timestamp } => self.handle_pong(addr, timestamp, now),
            SessionPacket::Disconnect { identity } => self.handle_disconnect(addr, identity),
            other => log::debug!(
                "Ignoring client-bound opcode {:#04x} from {}",
                other.opcode(),
                addr
            ),
        }
    }

    fn touch(&mut self, identity: u64, now: Instant) {
        if let Some(player) = self.connections.get_mut(identity) {
            player.touch(now);
        }
    }

    fn handle_hello(&mut self, addr: SocketAddr, identity: u64, name: &str, now: Instant) {
        let ping_phase = self
            .rng
            .gen_range(0..self.config.ping_interval_ms.max(1));

        let (slot, ack_index, is_new, entity_id) = match self.connections.admit(identity, addr, now)
        {
            Ok((player, is_new)) => (player.slot, player.ack_index, is_new, player.entity_id),
            Err(e) => {
                log::warn!("Refusing {} ({:?}) from {}: {}", identity, name, addr, e);
                self.events.push_back(SessionEvent::ConnectionDenied {
                    addr,
                    reason: e.to_string(),
                });
                return;
            }
        };

        for evicted in self.connections.drain_superseded() {
            self.release(
                evicted.identity,
                evicted.ack_index,
                DisconnectReason::Superseded,
            );
        }

        let entity_id = if is_new {
            let entity_id = self.simulation.spawn_player(identity, slot);
            self.history.forget_client(ack_index);
            if let Some(player) = self.connections.get_mut(identity) {
                player.entity_id = entity_id;
                player.next_ping = now + Duration::from_millis(ping_phase);
            }
            log::info!(
                "Player {:#x} ({}) joined in slot {} from {}",
                identity,
                name,
                slot,
                addr
            );
            self.events.push_back(SessionEvent::ClientConnected {
                identity,
                slot,
                addr,
                entity_id,
            });
            entity_id
        } else {
            entity_id
        };

        let welcome = SessionPacket::Welcome {
            players_connected: self.connections.connected_count().min(u8::MAX as usize) as u8,
            server_tick: self.tick,
            entity_id,
        };
        self.send(addr, welcome);
    }

    fn handle_input(&mut self, addr: SocketAddr, input: InputPacket, now: Instant) {
        let Some(player) = self.connections.verify_mut(&addr, input.identity) else {
            log::debug!("Dropping input for {:#x} from unbound {}", input.identity, addr);
            return;
        };
        player.touch(now);
        if !player.offer_input(input) {
            log::debug!(
                "Discarding stale input {} from {:#x}",
                input.sequence,
                input.identity
            );
        }
    }

    fn handle_state_ack(&mut self, addr: SocketAddr, identity: u64, sequence: u32, now: Instant) {
        let Some(player) = self.connections.verify_mut(&addr, identity) else {
            return;
        };
        player.touch(now);
        let ack_index = player.ack_index;

        if sequence == 0 {
            log::debug!("Player {:#x} requested a resync", identity);
            self.history.forget_client(ack_index);
        } else if !self.history.acknowledge(ack_index, sequence) {
            log::debug!(
                "Ack {} from {:#x} refers to a retired snapshot",
                sequence,
                identity
            );
        }
    }

    fn handle_pong(&mut self, addr: SocketAddr, timestamp: u64, now: Instant) {
        let elapsed = self.elapsed_ms(now);
        let Some(identity) = self.connections.identity_at(&addr) else {
            return;
        };
        if let Some(player) = self.connections.get_mut(identity) {
            player.touch(now);
            if timestamp <= elapsed {
                player.rtt.update((elapsed - timestamp) as f32);
            }
        }
    }

    fn handle_disconnect(&mut self, addr: SocketAddr, identity: u64) {
        if self.connections.verify_mut(&addr, identity).is_none() {
            return;
        }
        self.drop_player(identity, DisconnectReason::Graceful);
    }

    fn drop_player(&mut self, identity: u64, reason: DisconnectReason) {
        let Some(player) = self.connections.remove(identity) else {
            return;
        };
        self.release(player.identity, player.ack_index, reason);
    }

    fn release(&mut self, identity: u64, ack_index: usize, reason: DisconnectReason) {
        self.simulation.despawn_player(identity);
        self.history.forget_client(ack_index);
        log::info!("Player {:#x} {}", identity, reason.as_str());
        self.events
            .push_back(SessionEvent::ClientDisconnected { identity, reason });
    }

    /// Sends DISCONNECT and drops the player.
    pub fn kick(&mut self, identity: u64) {
        if let Some(player) = self.connections.get(identity) {
            let addr = player.addr;
            self.send(addr, SessionPacket::Disconnect { identity });
        }
        self.drop_player(identity, DisconnectReason::Kicked);
    }

    pub fn shutdown(&mut self) {
        let identities: Vec<u64> = self.connections.iter().map(|p| p.identity).collect();
        for identity in identities {
            self.kick(identity);
        }
    }

    /// Runs every fixed tick that is due since the previous call, then
    /// handles liveness and keepalives.
    pub fn update(&mut self, now: Instant) {
        let delta = now.saturating_duration_since(self.last_update);
        self.last_update = now;
        self.timestep.accumulate(delta);

        while self.timestep.consume_tick() {
            self.run_tick(now);
        }

        for player in self.connections.cleanup_timed_out(now) {
            self.release(player.identity, player.ack_index, DisconnectReason::Timeout);
        }

        self.send_pings(now);
    }

    fn run_tick(&mut self, now: Instant) {
        let mut inputs = Vec::new();
        for player in self.connections.iter_mut() {
            if let Some(input) = player.take_input() {
                inputs.push(input);
            }
        }
        for input in inputs {
            self.simulation.apply_input(input.identity, input.buttons);
        }

        self.simulation.advance(self.timestep.dt());
        self.tick = self.tick.wrapping_add(1);

        if let Some(transition) = self.simulation.take_level_complete() {
            log::info!(
                "Level {} complete, next {}",
                transition.completed,
                transition.next
            );
            self.level_notice = Some(LevelNotice {
                transition,
                until: now + Duration::from_millis(self.config.level_notice_ms),
            });
            self.events.push_back(SessionEvent::LevelComplete(transition));
        }
        self.repeat_level_notice(now);

        match self.config.broadcast_mode {
            BroadcastMode::Full => self.broadcast_full(now),
            BroadcastMode::Delta => self.broadcast_delta(now),
        }
    }

    fn repeat_level_notice(&mut self, now: Instant) {
        let Some(notice) = &self.level_notice else {
            return;
        };
        if now > notice.until {
            self.level_notice = None;
            return;
        }
        let packet = SessionPacket::LevelComplete {
            completed: notice.transition.completed,
            next: notice.transition.next,
        };
        let addrs: Vec<SocketAddr> = self.connections.iter().map(|p| p.addr).collect();
        for addr in addrs {
            self.send(addr, packet.clone());
        }
    }

    fn input_acks(&self) -> Vec<InputAck> {
        let mut acks: Vec<InputAck> = self
            .connections
            .iter()
            .map(|player| InputAck {
                identity: player.identity,
                sequence: player.last_processed_input,
            })
            .collect();
        acks.sort_by_key(|ack| ack.identity);
        acks
    }

    fn broadcast_full(&mut self, now: Instant) {
        if self.connections.connected_count() == 0 {
            return;
        }
        let state = StateUpdate {
            tick: self.tick,
            server_time_ms: self.elapsed_ms(now) as u32,
            world_offset: self.simulation.world_offset(),
            acks: self.input_acks(),
            entities: self.simulation.entities(),
        };
        let packet = SessionPacket::State(state);
        let addrs: Vec<SocketAddr> = self.connections.iter().map(|p| p.addr).collect();
        for addr in addrs {
            self.send(addr, packet.clone());
        }
    }

    fn broadcast_delta(&mut self, now: Instant) {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            // 0 names the empty baseline; a wrapped ring holds nothing usable.
            self.sequence = 1;
            self.history.clear();
        }

        let entities = self.simulation.entities();
        let snapshot = Snapshot::capture(self.tick, entities.as_slice());

        if self.connections.connected_count() > 0 {
            let lookup: HashMap<SyncId, &SimEntity> = entities.iter().map(|e| (e.id, e)).collect();
            let acks = self.input_acks();
            let server_time_ms = self.elapsed_ms(now) as u32;
            let world_offset = self.simulation.world_offset();
            let empty = Snapshot::empty();

            let targets: Vec<(SocketAddr, usize)> = self
                .connections
                .iter()
                .map(|p| (p.addr, p.ack_index))
                .collect();

            for (addr, ack_index) in targets {
                let (base_sequence, baseline) =
                    self.history.baseline_for(ack_index).unwrap_or((0, &empty));
                let patch = diff(baseline, &snapshot);
                let body = build_delta(&patch, &lookup);

                let update = DeltaUpdate {
                    tick: self.tick,
                    server_time_ms,
                    sequence: self.sequence,
                    base_sequence,
                    world_offset,
                    acks: acks.clone(),
                    changed: body.changed,
                    destroyed: body.destroyed,
                    created: body.created,
                };
                self.outbound
                    .push_back((addr, SessionPacket::StateDelta(update)));
            }
        }

        self.history.push(self.sequence, snapshot);
    }

    fn send_pings(&mut self, now: Instant) {
        let timestamp = self.elapsed_ms(now);
        let interval = self.config.ping_interval();
        let mut due = Vec::new();
        for player in self.connections.iter_mut() {
            if now >= player.next_ping {
                player.next_ping = now + interval;
                due.push(player.addr);
            }
        }
        for addr in due {
            self.send(addr, SessionPacket::Ping { timestamp });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::InputFlags;
    use crate::simulation::{ArenaSimulation, MovementConfig};

    const ALPHA: u64 = 0xA1;
    const BRAVO: u64 = 0xB2;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn roster() -> Vec<ExpectedPlayer> {
        vec![
            ExpectedPlayer {
                identity: ALPHA,
                slot: 1,
                name: "alpha".into(),
            },
            ExpectedPlayer {
                identity: BRAVO,
                slot: 2,
                name: "bravo".into(),
            },
        ]
    }

    fn server(mode: BroadcastMode, now: Instant) -> SessionServer<ArenaSimulation> {
        let config = SessionConfig {
            broadcast_mode: mode,
            seed: Some(7),
            ..SessionConfig::default()
        };
        let simulation = ArenaSimulation::new(MovementConfig::default(), 7);
        SessionServer::new(config, roster(), simulation, now).unwrap()
    }

    fn hello(server: &mut SessionServer<ArenaSimulation>, identity: u64, port: u16, now: Instant) {
        let packet = SessionPacket::Hello {
            identity,
            name: "p".into(),
        };
        server.handle_datagram(addr(port), &packet.encode(), now);
    }

    fn packets_to(server: &mut SessionServer<ArenaSimulation>, port: u16) -> Vec<SessionPacket> {
        server
            .drain_outbound()
            .filter(|(to, _)| *to == addr(port))
            .map(|(_, packet)| packet)
            .collect()
    }

    #[test]
    fn roster_larger_than_capacity_is_rejected() {
        let config = SessionConfig {
            max_clients: 1,
            ..SessionConfig::default()
        };
        let simulation = ArenaSimulation::new(MovementConfig::default(), 1);
        let result = SessionServer::new(config, roster(), simulation, Instant::now());
        assert!(matches!(
            result,
            Err(ConfigError::TooLarge { field: "roster", .. })
        ));
    }

    #[test]
    fn hello_is_welcomed_with_controlled_entity() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, ALPHA, 5000, now);

        let packets = packets_to(&mut server, 5000);
        let Some(SessionPacket::Welcome {
            players_connected,
            entity_id,
            ..
        }) = packets.first()
        else {
            panic!("expected welcome, got {:?}", packets);
        };
        assert_eq!(*players_connected, 1);
        assert_ne!(*entity_id, 0);
        assert!(matches!(
            server.drain_events().next(),
            Some(SessionEvent::ClientConnected { identity: ALPHA, .. })
        ));
    }

    #[test]
    fn unknown_identity_is_denied() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, 0xDEAD, 5000, now);

        assert!(packets_to(&mut server, 5000).is_empty());
        assert_eq!(server.connections().connected_count(), 0);
        assert!(matches!(
            server.drain_events().next(),
            Some(SessionEvent::ConnectionDenied { .. })
        ));
    }

    #[test]
    fn one_input_per_tick_newest_wins() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Full, now);
        hello(&mut server, ALPHA, 5000, now);

        for sequence in [2, 4, 3] {
            let input = SessionPacket::Input(InputPacket {
                sequence,
                identity: ALPHA,
                buttons: InputFlags::RIGHT,
                client_time_ms: 0,
            });
            server.handle_datagram(addr(5000), &input.encode(), now);
        }
        server.update(now + Duration::from_millis(20));
        assert_eq!(server.last_processed_input(ALPHA), Some(4));
    }

    #[test]
    fn delta_baseline_follows_acks() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, ALPHA, 5000, now);
        server.drain_outbound().for_each(drop);

        server.update(now + Duration::from_millis(17));
        let first = packets_to(&mut server, 5000)
            .into_iter()
            .find_map(|p| match p {
                SessionPacket::StateDelta(delta) => Some(delta),
                _ => None,
            })
            .unwrap();
        assert_eq!(first.base_sequence, 0);
        assert!(!first.created.is_empty());

        let ack = SessionPacket::StateAck {
            identity: ALPHA,
            sequence: first.sequence,
        };
        server.handle_datagram(addr(5000), &ack.encode(), now);
        server.update(now + Duration::from_millis(34));

        let second = packets_to(&mut server, 5000)
            .into_iter()
            .find_map(|p| match p {
                SessionPacket::StateDelta(delta) => Some(delta),
                _ => None,
            })
            .unwrap();
        assert_eq!(second.base_sequence, first.sequence);
        assert!(second.created.is_empty());
    }

    #[test]
    fn resync_request_falls_back_to_empty_baseline() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, ALPHA, 5000, now);
        server.update(now + Duration::from_millis(17));
        let sequence = server.sequence();

        let ack = SessionPacket::StateAck {
            identity: ALPHA,
            sequence,
        };
        server.handle_datagram(addr(5000), &ack.encode(), now);
        assert!(server.history().is_acked(0, sequence));

        let resync = SessionPacket::StateAck {
            identity: ALPHA,
            sequence: 0,
        };
        server.handle_datagram(addr(5000), &resync.encode(), now);
        assert!(server.history().baseline_for(0).is_none());
    }

    #[test]
    fn superseded_player_is_released() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, ALPHA, 5000, now);
        hello(&mut server, BRAVO, 5000, now);

        assert_eq!(server.connections().connected_count(), 1);
        assert!(server.simulation().player(ALPHA).is_none());
        assert!(server.simulation().player(BRAVO).is_some());
        assert!(server.drain_events().any(|event| matches!(
            event,
            SessionEvent::ClientDisconnected {
                identity: ALPHA,
                reason: DisconnectReason::Superseded
            }
        )));
    }

    #[test]
    fn silent_player_times_out() {
        let now = Instant::now();
        let mut server = server(BroadcastMode::Delta, now);
        hello(&mut server, ALPHA, 5000, now);
        server.drain_events().for_each(drop);

        server.update(now + Duration::from_millis(5100));
        assert_eq!(server.connections().connected_count(), 0);
        assert!(server.drain_events().any(|event| matches!(
            event,
            SessionEvent::ClientDisconnected {
                identity: ALPHA,
                reason: DisconnectReason::Timeout
            }
        )));
    }
}
