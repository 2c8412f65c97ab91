use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::snapshot::SyncId;

use super::protocol::{InputPacket, sequence_greater_than};
use super::stats::RttEstimator;

/// A player the lobby handed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedPlayer {
    pub identity: u64,
    pub slot: u8,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("identity {0:#018x} is not on the roster")]
    NotExpected(u64),
    #[error("session is full")]
    Full,
}

#[derive(Debug)]
pub struct ConnectedPlayer {
    pub identity: u64,
    pub slot: u8,
    pub name: String,
    pub addr: SocketAddr,
    /// Bit index in the snapshot ack masks.
    pub ack_index: usize,
    pub entity_id: SyncId,
    pub last_seen: Instant,
    pub last_processed_input: u32,
    pub pending_input: Option<InputPacket>,
    pub alive: bool,
    pub next_ping: Instant,
    pub rtt: RttEstimator,
}

impl ConnectedPlayer {
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.alive = true;
    }

    /// Keeps the newest unprocessed input. Returns false when the input is
    /// not newer than what is already processed or queued.
    pub fn offer_input(&mut self, input: InputPacket) -> bool {
        if !sequence_greater_than(input.sequence, self.last_processed_input) {
            return false;
        }
        if let Some(pending) = &self.pending_input {
            if !sequence_greater_than(input.sequence, pending.sequence) {
                return false;
            }
        }
        self.pending_input = Some(input);
        true
    }

    pub fn take_input(&mut self) -> Option<InputPacket> {
        let input = self.pending_input.take()?;
        self.last_processed_input = input.sequence;
        Some(input)
    }
}

/// Tracks which rostered players are connected and from where.
#[derive(Debug)]
pub struct ConnectionManager {
    roster: Vec<ExpectedPlayer>,
    by_addr: HashMap<SocketAddr, u64>,
    players: HashMap<u64, ConnectedPlayer>,
    superseded: Vec<ConnectedPlayer>,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(roster: Vec<ExpectedPlayer>, max_clients: usize, timeout: Duration) -> Self {
        Self {
            roster,
            by_addr: HashMap::new(),
            players: HashMap::new(),
            superseded: Vec::new(),
            max_clients,
            timeout,
        }
    }

    pub fn roster(&self) -> &[ExpectedPlayer] {
        &self.roster
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expected(&self, identity: u64) -> bool {
        self.roster.iter().any(|p| p.identity == identity)
    }

    /// Admits or refreshes a rostered player. The bool is true on first
    /// admission. A known identity at a new address is rebound. Whoever was
    /// bound to that address before is removed and parked for
    /// [`drain_superseded`](Self::drain_superseded).
    pub fn admit(
        &mut self,
        identity: u64,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(&mut ConnectedPlayer, bool), AdmissionError> {
        let Some(ack_index) = self.roster.iter().position(|p| p.identity == identity) else {
            return Err(AdmissionError::NotExpected(identity));
        };

        if self.players.contains_key(&identity) {
            let player = self
                .players
                .get_mut(&identity)
                .ok_or(AdmissionError::NotExpected(identity))?;
            if player.addr != addr {
                log::info!("Player {:#x} moved from {} to {}", identity, player.addr, addr);
                let old_addr = player.addr;
                player.addr = addr;
                self.by_addr.remove(&old_addr);
                self.supersede(addr, identity);
            }
            let player = self
                .players
                .get_mut(&identity)
                .ok_or(AdmissionError::NotExpected(identity))?;
            player.touch(now);
            return Ok((player, false));
        }

        let displaces = self
            .by_addr
            .get(&addr)
            .is_some_and(|previous| self.players.contains_key(previous));
        if self.players.len() - usize::from(displaces) >= self.max_clients {
            return Err(AdmissionError::Full);
        }

        self.supersede(addr, identity);
        let expected = &self.roster[ack_index];
        let player = self.players.entry(identity).or_insert(ConnectedPlayer {
            identity,
            slot: expected.slot,
            name: expected.name.clone(),
            addr,
            ack_index,
            entity_id: 0,
            last_seen: now,
            last_processed_input: 0,
            pending_input: None,
            alive: true,
            next_ping: now,
            rtt: RttEstimator::default(),
        });
        Ok((player, true))
    }

    /// Binds `addr` to `identity`, evicting a different identity bound there.
    fn supersede(&mut self, addr: SocketAddr, identity: u64) {
        let Some(previous) = self.by_addr.insert(addr, identity) else {
            return;
        };
        if previous == identity {
            return;
        }
        if let Some(player) = self.players.remove(&previous) {
            log::info!(
                "Player {:#x} at {} superseded by {:#x}",
                previous,
                addr,
                identity
            );
            self.superseded.push(player);
        }
    }

    /// Players evicted because another identity took over their address.
    pub fn drain_superseded(&mut self) -> Vec<ConnectedPlayer> {
        std::mem::take(&mut self.superseded)
    }

    pub fn identity_at(&self, addr: &SocketAddr) -> Option<u64> {
        self.by_addr.get(addr).copied()
    }

    pub fn get(&self, identity: u64) -> Option<&ConnectedPlayer> {
        self.players.get(&identity)
    }

    pub fn get_mut(&mut self, identity: u64) -> Option<&mut ConnectedPlayer> {
        self.players.get_mut(&identity)
    }

    /// Looks up the sender and requires the claimed identity to match the
    /// one bound to that address.
    pub fn verify_mut(&mut self, addr: &SocketAddr, identity: u64) -> Option<&mut ConnectedPlayer> {
        if self.by_addr.get(addr) != Some(&identity) {
            return None;
        }
        self.players.get_mut(&identity)
    }

    pub fn remove(&mut self, identity: u64) -> Option<ConnectedPlayer> {
        let player = self.players.remove(&identity)?;
        self.by_addr.remove(&player.addr);
        Some(player)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectedPlayer> {
        self.players.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectedPlayer> {
        self.players.values_mut()
    }

    pub fn cleanup_timed_out(&mut self, now: Instant) -> Vec<ConnectedPlayer> {
        let timed_out: Vec<u64> = self
            .players
            .values()
            .filter(|p| p.is_timed_out(now, self.timeout))
            .map(|p| p.identity)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|identity| self.remove(identity))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.players.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::InputFlags;

    fn roster() -> Vec<ExpectedPlayer> {
        vec![
            ExpectedPlayer {
                identity: 0xA,
                slot: 1,
                name: "alpha".into(),
            },
            ExpectedPlayer {
                identity: 0xB,
                slot: 2,
                name: "bravo".into(),
            },
        ]
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn input(sequence: u32) -> InputPacket {
        InputPacket {
            sequence,
            identity: 0xA,
            buttons: InputFlags::UP,
            client_time_ms: 0,
        }
    }

    #[test]
    fn only_rostered_players_are_admitted() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));

        assert_eq!(
            manager.admit(0xC, addr(1), now).map(|(_, new)| new),
            Err(AdmissionError::NotExpected(0xC))
        );
        let (player, new) = manager.admit(0xB, addr(2), now).unwrap();
        assert!(new);
        assert_eq!(player.ack_index, 1);
        assert_eq!(player.name, "bravo");
        assert_eq!(manager.connected_count(), 1);
    }

    #[test]
    fn rebind_moves_address() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));
        manager.admit(0xA, addr(1), now).unwrap();

        let (_, new) = manager.admit(0xA, addr(9), now).unwrap();
        assert!(!new);
        assert_eq!(manager.identity_at(&addr(9)), Some(0xA));
        assert_eq!(manager.identity_at(&addr(1)), None);
        assert!(manager.verify_mut(&addr(1), 0xA).is_none());
    }

    #[test]
    fn new_identity_at_bound_address_supersedes_old_one() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));
        manager.admit(0xA, addr(1), now).unwrap();
        assert!(manager.drain_superseded().is_empty());

        let (_, new) = manager.admit(0xB, addr(1), now).unwrap();
        assert!(new);
        assert_eq!(manager.connected_count(), 1);
        assert_eq!(manager.identity_at(&addr(1)), Some(0xB));

        let evicted = manager.drain_superseded();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].identity, 0xA);
        assert!(manager.drain_superseded().is_empty());
    }

    #[test]
    fn rebinding_onto_anothers_address_supersedes_it() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));
        manager.admit(0xA, addr(1), now).unwrap();
        manager.admit(0xB, addr(2), now).unwrap();

        manager.admit(0xB, addr(1), now).unwrap();
        assert_eq!(manager.connected_count(), 1);
        assert_eq!(manager.identity_at(&addr(2)), None);
        let evicted: Vec<u64> = manager
            .drain_superseded()
            .iter()
            .map(|p| p.identity)
            .collect();
        assert_eq!(evicted, vec![0xA]);
    }

    #[test]
    fn capacity_is_enforced() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 1, Duration::from_secs(5));
        manager.admit(0xA, addr(1), now).unwrap();
        assert_eq!(
            manager.admit(0xB, addr(2), now).map(|(_, new)| new),
            Err(AdmissionError::Full)
        );
    }

    #[test]
    fn stale_inputs_are_ignored() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));
        let (player, _) = manager.admit(0xA, addr(1), now).unwrap();

        assert!(player.offer_input(input(5)));
        assert!(!player.offer_input(input(3)));
        assert_eq!(player.take_input().map(|i| i.sequence), Some(5));
        assert!(!player.offer_input(input(4)));
        assert_eq!(player.last_processed_input, 5);
    }

    #[test]
    fn timed_out_players_are_removed() {
        let start = Instant::now();
        let mut manager = ConnectionManager::new(roster(), 8, Duration::from_secs(5));
        manager.admit(0xA, addr(1), start).unwrap();
        manager.admit(0xB, addr(2), start + Duration::from_secs(4)).unwrap();

        let removed = manager.cleanup_timed_out(start + Duration::from_secs(6));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].identity, 0xA);
        assert!(manager.get(0xB).is_some());
    }
}
