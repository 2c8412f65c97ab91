use std::net::SocketAddr;
use std::time::{Duration, Instant};

use skirmish::net::InputPacket;
use skirmish::{
    ArenaSimulation, BroadcastMode, ClientConfig, ClientEvent, DisconnectReason, ExpectedPlayer,
    InputFlags, MovementConfig, SessionClient, SessionConfig, SessionEvent, SessionPacket,
    SessionServer, Simulation,
};

const ALPHA: u64 = 0x1111;
const BRAVO: u64 = 0x2222;

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

/// Wires a server and its clients together in memory.
struct Harness {
    server: SessionServer<ArenaSimulation>,
    clients: Vec<(SocketAddr, SessionClient)>,
    now: Instant,
    sent_to_clients: usize,
}

impl Harness {
    fn new(mode: BroadcastMode) -> Self {
        let now = Instant::now();
        let config = SessionConfig {
            broadcast_mode: mode,
            seed: Some(99),
            ..SessionConfig::default()
        };
        let simulation = ArenaSimulation::new(MovementConfig::default(), 99);
        Self {
            server: SessionServer::new(config, roster(), simulation, now).unwrap(),
            clients: Vec::new(),
            now,
            sent_to_clients: 0,
        }
    }

    fn join(&mut self, identity: u64, port: u16) -> usize {
        let client = SessionClient::new(identity, "bot", ClientConfig::default(), self.now);
        self.clients.push((addr(port), client));
        self.clients.len() - 1
    }

    /// Advances time, letting `deliver` decide which server packets arrive.
    fn step_with(&mut self, ms: u64, mut deliver: impl FnMut(usize) -> bool) {
        self.now += Duration::from_millis(ms);
        let now = self.now;

        for (from, client) in &mut self.clients {
            client.update(now);
            for packet in client.drain_outbound() {
                self.server.handle_datagram(*from, &packet.encode(), now);
            }
        }

        self.server.update(now);
        let outbound: Vec<_> = self.server.drain_outbound().collect();
        for (to, packet) in outbound {
            let index = self.sent_to_clients;
            self.sent_to_clients += 1;
            if !deliver(index) {
                continue;
            }
            if let Some((_, client)) = self.clients.iter_mut().find(|(a, _)| *a == to) {
                client.handle_datagram(&packet.encode(), now);
            }
        }
    }

    fn step(&mut self, ms: u64) {
        self.step_with(ms, |_| true);
    }

    fn client(&self, index: usize) -> &SessionClient {
        &self.clients[index].1
    }

    fn assert_converged(&self, index: usize) {
        let state = self
            .client(index)
            .latest_state()
            .expect("client has applied a state");
        let truth = self.server.simulation().entities();

        let client_ids: Vec<u32> = state.entities.keys().copied().collect();
        let server_ids: Vec<u32> = truth.iter().map(|e| e.id).collect();
        assert_eq!(client_ids, server_ids);

        for entity in &truth {
            let seen = &state.entities[&entity.id];
            assert_eq!(seen.position, entity.position, "entity {}", entity.id);
            assert_eq!(seen.health, entity.health, "entity {}", entity.id);
            assert_eq!(seen.entity_type, entity.entity_type);
        }
    }
}

#[test]
fn out_of_order_input_keeps_newest_sequence() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    harness.join(ALPHA, 6000);
    harness.step(1);

    let now = harness.now;
    for sequence in [5, 3] {
        let packet = SessionPacket::Input(InputPacket {
            sequence,
            identity: ALPHA,
            buttons: InputFlags::UP,
            client_time_ms: 0,
        });
        harness
            .server
            .handle_datagram(addr(6000), &packet.encode(), now);
    }
    harness.server.update(now + Duration::from_millis(20));
    assert_eq!(harness.server.last_processed_input(ALPHA), Some(5));

    let late = SessionPacket::Input(InputPacket {
        sequence: 3,
        identity: ALPHA,
        buttons: InputFlags::UP,
        client_time_ms: 0,
    });
    harness
        .server
        .handle_datagram(addr(6000), &late.encode(), now + Duration::from_millis(21));
    harness.server.update(now + Duration::from_millis(40));
    assert_eq!(harness.server.last_processed_input(ALPHA), Some(5));
}

#[test]
fn delta_clients_track_server_state() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    let a = harness.join(ALPHA, 6000);
    let b = harness.join(BRAVO, 6001);
    harness.clients[a].1.set_buttons(InputFlags::RIGHT | InputFlags::SHOOT);
    harness.clients[b].1.set_buttons(InputFlags::UP);

    for _ in 0..180 {
        harness.step(16);
    }

    assert!(harness.client(a).is_connected());
    assert!(harness.client(b).is_connected());
    harness.assert_converged(a);
    harness.assert_converged(b);
    assert!(harness.server.history().baseline_for(0).is_some());
}

#[test]
fn deltas_survive_packet_loss() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    let a = harness.join(ALPHA, 6000);
    harness.clients[a].1.set_buttons(InputFlags::LEFT | InputFlags::SHOOT);

    for _ in 0..120 {
        harness.step_with(16, |index| index % 3 != 1);
    }
    for _ in 0..5 {
        harness.step(16);
    }
    harness.assert_converged(a);
}

#[test]
fn full_mode_clients_track_server_state() {
    let mut harness = Harness::new(BroadcastMode::Full);
    let a = harness.join(ALPHA, 6000);
    harness.clients[a].1.set_buttons(InputFlags::DOWN);

    for _ in 0..60 {
        harness.step(16);
    }
    harness.assert_converged(a);
    assert_eq!(harness.server.sequence(), 0);
}

#[test]
fn predicted_position_matches_authority_without_loss() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    let a = harness.join(ALPHA, 6000);
    harness.clients[a].1.set_buttons(InputFlags::RIGHT);

    for _ in 0..90 {
        harness.step(16);
    }
    let server_x = harness.client(a).own_entity().unwrap().position.x;
    let predicted_x = harness.client(a).prediction().position().x;
    assert!(predicted_x + 0.01 >= server_x);
    assert!(predicted_x - server_x < 50.0);
}

#[test]
fn restarted_client_resyncs_from_empty_baseline() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    harness.join(ALPHA, 6000);
    for _ in 0..30 {
        harness.step(16);
    }
    assert!(harness.server.history().baseline_for(0).is_some());

    // A fresh client at the same address knows none of the acked baselines.
    harness.clients[0].1 = SessionClient::new(ALPHA, "bot", ClientConfig::default(), harness.now);
    let mut resynced = false;
    for _ in 0..10 {
        harness.step(16);
        resynced |= harness.clients[0]
            .1
            .drain_events()
            .any(|event| matches!(event, ClientEvent::ResyncRequested { .. }));
    }

    assert!(resynced);
    harness.assert_converged(0);
}

#[test]
fn unknown_sender_creates_no_state() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    harness.join(ALPHA, 6000);
    harness.step(16);
    harness.server.drain_events().for_each(drop);

    let now = harness.now;
    let spoofed = SessionPacket::Input(InputPacket {
        sequence: 9,
        identity: ALPHA,
        buttons: InputFlags::SHOOT,
        client_time_ms: 0,
    });
    harness
        .server
        .handle_datagram(addr(7777), &spoofed.encode(), now);
    let stranger = SessionPacket::Hello {
        identity: 0xBAD,
        name: "x".into(),
    };
    harness
        .server
        .handle_datagram(addr(7778), &stranger.encode(), now);
    harness.server.handle_datagram(addr(7779), &[0xFF, 1, 2], now);
    harness.server.handle_datagram(addr(7779), &[], now);

    assert_eq!(harness.server.connections().connected_count(), 1);
    assert!(
        harness
            .server
            .drain_outbound()
            .all(|(to, _)| to == addr(6000))
    );

    harness.server.update(now + Duration::from_millis(20));
    assert_ne!(harness.server.last_processed_input(ALPHA), Some(9));
}

#[test]
fn silent_client_is_released_after_liveness_window() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    harness.join(ALPHA, 6000);
    harness.join(BRAVO, 6001);
    harness.step(16);
    let entities_with_both = harness.server.simulation().entities().len();
    harness.server.drain_events().for_each(drop);

    // Bravo goes quiet; alpha keeps talking.
    harness.clients.truncate(1);
    for _ in 0..330 {
        harness.step(16);
    }

    let events: Vec<_> = harness.server.drain_events().collect();
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::ClientDisconnected {
            identity: BRAVO,
            reason: DisconnectReason::Timeout
        }
    )));
    assert_eq!(harness.server.connections().connected_count(), 1);
    assert!(harness.server.simulation().player(BRAVO).is_none());
    assert!(entities_with_both >= 2);
}

#[test]
fn graceful_disconnect_despawns_player() {
    let mut harness = Harness::new(BroadcastMode::Delta);
    let a = harness.join(ALPHA, 6000);
    harness.step(16);
    assert!(harness.server.simulation().player(ALPHA).is_some());

    harness.clients[a].1.disconnect();
    harness.step(16);
    assert_eq!(harness.server.connections().connected_count(), 0);
    assert!(harness.server.simulation().player(ALPHA).is_none());
}
