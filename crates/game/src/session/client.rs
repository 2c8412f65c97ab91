use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::net::{
    DeltaUpdate, InputAck, InputFlags, InputPacket, NetworkStats, RttEstimator, SessionPacket,
    StateUpdate, sequence_greater_than,
};
use crate::simulation::{LevelTransition, MovementConfig};
use crate::snapshot::{DEFAULT_HISTORY_LEN, ReceivedState, SimEntity, StateBuffer, SyncId};

use super::DisconnectReason;
use super::prediction::ClientPrediction;

/// Inputs further behind than this are dropped instead of replayed.
const MAX_INPUT_BACKLOG: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Inputs sent per second, independent of any render rate.
    pub input_rate: u32,
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub hello_retry_ms: u64,
    pub liveness_timeout_ms: u64,
    pub history_len: usize,
    pub correction_speed: f32,
    pub error_threshold: f32,
    pub snap_threshold: f32,
    pub movement: MovementConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            input_rate: 60,
            ping_interval_ms: 1000,
            connect_timeout_ms: 5000,
            hello_retry_ms: 250,
            liveness_timeout_ms: 5000,
            history_len: DEFAULT_HISTORY_LEN,
            correction_speed: 20.0,
            error_threshold: 0.0001,
            snap_threshold: 32.0,
            movement: MovementConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        entity_id: SyncId,
        players: u8,
        server_tick: u32,
    },
    StateApplied {
        tick: u32,
    },
    /// A delta named a baseline this client no longer holds.
    ResyncRequested {
        base_sequence: u32,
    },
    LevelComplete(LevelTransition),
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Client end of a session. Pure like the server: feed it datagrams and
/// time, then drain the packets it wants sent to the server.
pub struct SessionClient {
    identity: u64,
    name: String,
    config: ClientConfig,
    state: ClientState,
    entity_id: SyncId,
    prediction: ClientPrediction,
    prediction_seeded: bool,
    buffer: StateBuffer,
    current: Option<ReceivedState>,
    last_sequence: u32,
    last_full_tick: Option<u32>,
    last_level: Option<LevelTransition>,
    buttons: InputFlags,
    input_sequence: u32,
    start: Instant,
    connect_started: Instant,
    last_received: Instant,
    last_update: Instant,
    next_hello: Instant,
    next_input: Instant,
    next_ping: Instant,
    rtt: RttEstimator,
    stats: NetworkStats,
    outbound: VecDeque<SessionPacket>,
    events: VecDeque<ClientEvent>,
}

impl SessionClient {
    pub fn new(identity: u64, name: impl Into<String>, config: ClientConfig, now: Instant) -> Self {
        let prediction = ClientPrediction::new(config.input_rate, config.movement.clone())
            .with_thresholds(
                config.correction_speed,
                config.error_threshold,
                config.snap_threshold,
            );

        let mut client = Self {
            identity,
            name: name.into(),
            state: ClientState::Connecting,
            entity_id: 0,
            prediction,
            prediction_seeded: false,
            buffer: StateBuffer::new(config.history_len),
            current: None,
            last_sequence: 0,
            last_full_tick: None,
            last_level: None,
            buttons: InputFlags::empty(),
            input_sequence: 0,
            start: now,
            connect_started: now,
            last_received: now,
            last_update: now,
            next_hello: now + Duration::from_millis(config.hello_retry_ms),
            next_input: now,
            next_ping: now + Duration::from_millis(config.ping_interval_ms),
            rtt: RttEstimator::default(),
            stats: NetworkStats::default(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            config,
        };
        client.send_hello();
        client
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Sync id of the controlled entity, 0 until the server spawned it.
    pub fn entity_id(&self) -> SyncId {
        self.entity_id
    }

    pub fn latest_state(&self) -> Option<&ReceivedState> {
        self.current.as_ref()
    }

    pub fn own_entity(&self) -> Option<&SimEntity> {
        self.current.as_ref()?.entity(self.entity_id)
    }

    pub fn prediction(&self) -> &ClientPrediction {
        &self.prediction
    }

    pub fn predicted_position(&self) -> Vec2 {
        self.prediction.predicted_position()
    }

    /// Sequence of the newest applied delta.
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn input_sequence(&self) -> u32 {
        self.input_sequence
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_buttons(&mut self, buttons: InputFlags) {
        self.buttons = buttons;
    }

    pub fn drain_outbound(&mut self) -> impl Iterator<Item = SessionPacket> + '_ {
        self.outbound.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start).as_millis() as u64
    }

    fn send_hello(&mut self) {
        self.outbound.push_back(SessionPacket::Hello {
            identity: self.identity,
            name: self.name.clone(),
        });
    }

    /// Leaves the session. Nothing is sent afterwards.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.outbound.push_back(SessionPacket::Disconnect {
            identity: self.identity,
        });
        self.close(DisconnectReason::Graceful);
    }

    fn close(&mut self, reason: DisconnectReason) {
        self.state = ClientState::Disconnected;
        log::info!("Session closed: {}", reason.as_str());
        self.events.push_back(ClientEvent::Disconnected { reason });
    }

    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.stats.record_received(data.len());

        let packet = match SessionPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed server datagram: {}", e);
                self.stats.record_dropped();
                return;
            }
        };
        self.last_received = now;

        match packet {
            SessionPacket::Welcome {
                players_connected,
                server_tick,
                entity_id,
            } => self.handle_welcome(players_connected, server_tick, entity_id),
            SessionPacket::State(state) => self.handle_full(state),
            SessionPacket::StateDelta(delta) => self.handle_delta(delta),
            SessionPacket::Ping { timestamp } => {
                self.outbound.push_back(SessionPacket::Pong { timestamp });
            }
            SessionPacket::Pong { timestamp } => {
                let elapsed = self.elapsed_ms(now);
                if timestamp <= elapsed {
                    self.rtt.update((elapsed - timestamp) as f32);
                }
            }
            SessionPacket::LevelComplete { completed, next } => {
                let transition = LevelTransition { completed, next };
                if self.last_level != Some(transition) {
                    self.last_level = Some(transition);
                    self.events.push_back(ClientEvent::LevelComplete(transition));
                }
            }
            SessionPacket::Disconnect { identity } if identity == self.identity => {
                self.close(DisconnectReason::Kicked);
            }
            other => log::debug!("Ignoring opcode {:#04x} from server", other.opcode()),
        }
    }

    fn handle_welcome(&mut self, players: u8, server_tick: u32, entity_id: SyncId) {
        self.entity_id = entity_id;
        if self.state != ClientState::Connecting {
            return;
        }
        self.state = ClientState::Connected;
        log::info!(
            "Joined session at tick {} controlling entity {} ({} players)",
            server_tick,
            entity_id,
            players
        );
        self.events.push_back(ClientEvent::Connected {
            entity_id,
            players,
            server_tick,
        });
    }

    fn handle_full(&mut self, state: StateUpdate) {
        if let Some(last) = self.last_full_tick {
            if !sequence_greater_than(state.tick, last) {
                log::debug!("Discarding stale state for tick {}", state.tick);
                return;
            }
        }
        self.last_full_tick = Some(state.tick);
        let received = ReceivedState::from_full(&state);
        self.accept(received, &state.acks);
    }

    fn handle_delta(&mut self, delta: DeltaUpdate) {
        if self.last_sequence != 0 && !sequence_greater_than(delta.sequence, self.last_sequence) {
            log::debug!(
                "Discarding out-of-order delta {} (applied {})",
                delta.sequence,
                self.last_sequence
            );
            return;
        }

        if delta.base_sequence != 0 && self.buffer.get(delta.base_sequence).is_none() {
            self.request_resync(delta.base_sequence);
            return;
        }
        let empty = BTreeMap::new();
        let base = match self.buffer.get(delta.base_sequence) {
            Some(state) if delta.base_sequence != 0 => &state.entities,
            _ => &empty,
        };

        let received = match ReceivedState::from_delta(base, &delta) {
            Ok(received) => received,
            Err(e) => {
                log::debug!("Delta {} does not apply: {}", delta.sequence, e);
                self.request_resync(delta.base_sequence);
                return;
            }
        };

        self.last_sequence = delta.sequence;
        self.buffer.push(received.clone());
        self.outbound.push_back(SessionPacket::StateAck {
            identity: self.identity,
            sequence: delta.sequence,
        });
        self.accept(received, &delta.acks);
    }

    fn request_resync(&mut self, base_sequence: u32) {
        log::debug!("Baseline {} missing, requesting resync", base_sequence);
        self.outbound.push_back(SessionPacket::StateAck {
            identity: self.identity,
            sequence: 0,
        });
        self.events
            .push_back(ClientEvent::ResyncRequested { base_sequence });
    }

    fn accept(&mut self, received: ReceivedState, acks: &[InputAck]) {
        let tick = received.tick;

        if let Some(own) = received.entity(self.entity_id) {
            self.prediction.set_speed_multiplier(own.speed_multiplier);
            if !self.prediction_seeded {
                self.prediction.reset(own.position);
                self.prediction_seeded = true;
            } else if let Some(ack) = acks.iter().find(|ack| ack.identity == self.identity) {
                self.prediction.reconcile(own.position, ack.sequence);
            }
        }

        self.current = Some(received);
        self.events.push_back(ClientEvent::StateApplied { tick });
    }

    /// Retries HELLO while connecting; once connected sends inputs at the
    /// configured rate, keepalive pings, and watches server liveness.
    pub fn update(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f32();
        self.last_update = now;

        match self.state {
            ClientState::Disconnected => {}
            ClientState::Connecting => {
                let waited = now.saturating_duration_since(self.connect_started);
                if waited > Duration::from_millis(self.config.connect_timeout_ms) {
                    log::warn!("No WELCOME after {:?}", waited);
                    self.close(DisconnectReason::Timeout);
                } else if now >= self.next_hello {
                    self.send_hello();
                    self.next_hello = now + Duration::from_millis(self.config.hello_retry_ms);
                }
            }
            ClientState::Connected => {
                let silent = now.saturating_duration_since(self.last_received);
                if silent > Duration::from_millis(self.config.liveness_timeout_ms) {
                    log::warn!("Server silent for {:?}", silent);
                    self.close(DisconnectReason::Timeout);
                    return;
                }
                self.send_inputs(now);
                self.prediction.update(dt);
                self.prediction.update_visuals(1.0);

                if now >= self.next_ping {
                    self.next_ping = now + Duration::from_millis(self.config.ping_interval_ms);
                    self.outbound.push_back(SessionPacket::Ping {
                        timestamp: self.elapsed_ms(now),
                    });
                }
            }
        }
    }

    fn send_inputs(&mut self, now: Instant) {
        let interval = Duration::from_secs_f64(1.0 / self.config.input_rate.max(1) as f64);
        if now.saturating_duration_since(self.next_input) > interval * MAX_INPUT_BACKLOG {
            self.next_input = now;
        }

        while now >= self.next_input {
            self.next_input += interval;
            self.input_sequence = self.input_sequence.wrapping_add(1);
            if self.input_sequence == 0 {
                self.input_sequence = 1;
            }

            if self.prediction_seeded {
                self.prediction.prepare_tick();
                self.prediction.apply_input(self.buttons);
                self.prediction.store_input(self.input_sequence);
            }

            self.outbound.push_back(SessionPacket::Input(InputPacket {
                sequence: self.input_sequence,
                identity: self.identity,
                buttons: self.buttons,
                client_time_ms: self.elapsed_ms(now) as u32,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{EntityChange, StateUpdate};
    use crate::snapshot::{DirtyFields, EntityType};

    const ME: u64 = 0x51;

    fn client(now: Instant) -> SessionClient {
        let mut client = SessionClient::new(ME, "me", ClientConfig::default(), now);
        client.drain_outbound().for_each(drop);
        let welcome = SessionPacket::Welcome {
            players_connected: 1,
            server_tick: 0,
            entity_id: 1,
        };
        client.handle_datagram(&welcome.encode(), now);
        client
    }

    fn player(x: f32) -> SimEntity {
        let mut entity = SimEntity::new(1, EntityType::Player);
        entity.owner = ME;
        entity.position = Vec2::new(x, 100.0);
        entity
    }

    fn delta(sequence: u32, base_sequence: u32) -> DeltaUpdate {
        DeltaUpdate {
            tick: sequence,
            sequence,
            base_sequence,
            ..DeltaUpdate::default()
        }
    }

    #[test]
    fn hello_is_queued_and_retried() {
        let now = Instant::now();
        let mut client = SessionClient::new(ME, "me", ClientConfig::default(), now);
        assert!(matches!(
            client.drain_outbound().next(),
            Some(SessionPacket::Hello { identity: ME, .. })
        ));

        client.update(now + Duration::from_millis(300));
        assert_eq!(client.drain_outbound().count(), 1);
        assert_eq!(client.state(), ClientState::Connecting);
    }

    #[test]
    fn connect_gives_up_after_timeout() {
        let now = Instant::now();
        let mut client = SessionClient::new(ME, "me", ClientConfig::default(), now);
        client.update(now + Duration::from_secs(6));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn delta_is_applied_and_acked() {
        let now = Instant::now();
        let mut client = client(now);
        client.drain_events().for_each(drop);

        let mut first = delta(1, 0);
        first.created.push(player(10.0));
        client.handle_datagram(&SessionPacket::StateDelta(first).encode(), now);

        assert_eq!(client.last_sequence(), 1);
        assert_eq!(
            client.drain_outbound().next(),
            Some(SessionPacket::StateAck {
                identity: ME,
                sequence: 1
            })
        );
        assert_eq!(client.own_entity().map(|e| e.position.x), Some(10.0));

        let mut second = delta(2, 1);
        let mut data = Vec::new();
        data.extend_from_slice(&20.0f32.to_le_bytes());
        data.extend_from_slice(&100.0f32.to_le_bytes());
        second.changed.push(EntityChange {
            id: 1,
            dirty: DirtyFields::POSITION,
            data,
        });
        client.handle_datagram(&SessionPacket::StateDelta(second).encode(), now);
        assert_eq!(client.own_entity().map(|e| e.position.x), Some(20.0));
    }

    #[test]
    fn stale_delta_is_discarded() {
        let now = Instant::now();
        let mut client = client(now);
        client.handle_datagram(&SessionPacket::StateDelta(delta(5, 0)).encode(), now);
        client.drain_outbound().for_each(drop);

        client.handle_datagram(&SessionPacket::StateDelta(delta(4, 0)).encode(), now);
        assert_eq!(client.last_sequence(), 5);
        assert_eq!(client.drain_outbound().count(), 0);
    }

    #[test]
    fn missing_baseline_requests_resync() {
        let now = Instant::now();
        let mut client = client(now);
        client.drain_events().for_each(drop);

        client.handle_datagram(&SessionPacket::StateDelta(delta(9, 7)).encode(), now);
        assert_eq!(client.last_sequence(), 0);
        assert_eq!(
            client.drain_outbound().next(),
            Some(SessionPacket::StateAck {
                identity: ME,
                sequence: 0
            })
        );
        assert_eq!(
            client.drain_events().next(),
            Some(ClientEvent::ResyncRequested { base_sequence: 7 })
        );
    }

    #[test]
    fn ping_is_echoed() {
        let now = Instant::now();
        let mut client = client(now);
        client.handle_datagram(&SessionPacket::Ping { timestamp: 1234 }.encode(), now);
        assert_eq!(
            client.drain_outbound().next(),
            Some(SessionPacket::Pong { timestamp: 1234 })
        );
    }

    #[test]
    fn level_notice_is_reported_once() {
        let now = Instant::now();
        let mut client = client(now);
        client.drain_events().for_each(drop);

        let notice = SessionPacket::LevelComplete {
            completed: 1,
            next: 2,
        };
        client.handle_datagram(&notice.encode(), now);
        client.handle_datagram(&notice.encode(), now);
        assert_eq!(client.drain_events().count(), 1);
    }

    #[test]
    fn older_full_state_is_ignored() {
        let now = Instant::now();
        let mut client = client(now);
        let state = |tick| {
            SessionPacket::State(StateUpdate {
                tick,
                entities: vec![player(tick as f32)],
                ..StateUpdate::default()
            })
        };
        client.handle_datagram(&state(10).encode(), now);
        client.handle_datagram(&state(8).encode(), now);
        assert_eq!(client.latest_state().map(|s| s.tick), Some(10));
    }

    #[test]
    fn inputs_follow_the_send_rate() {
        let now = Instant::now();
        let mut client = client(now);
        client.set_buttons(InputFlags::LEFT);
        client.update(now);
        client.update(now + Duration::from_millis(40));

        let inputs: Vec<u32> = client
            .drain_outbound()
            .filter_map(|p| match p {
                SessionPacket::Input(input) => Some(input.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(inputs, vec![1, 2, 3]);
    }
}
