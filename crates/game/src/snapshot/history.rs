use super::Snapshot;

pub const DEFAULT_HISTORY_LEN: usize = 32;

/// One bit per client in each slot's ack mask.
pub const MAX_ACK_CLIENTS: usize = 64;

#[derive(Debug)]
struct HistorySlot {
    sequence: u32,
    snapshot: Snapshot,
    acked: u64,
}

/// Server-side ring of recently broadcast snapshots, indexed by
/// `sequence % capacity`.
///
/// Acks are only recorded when the slot still holds the acknowledged
/// sequence, so a late ack for an overwritten slot never marks the newer
/// occupant as a valid baseline.
#[derive(Debug)]
pub struct SnapshotHistory {
    slots: Vec<Option<HistorySlot>>,
    latest: Option<u32>,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            latest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, sequence: u32) -> usize {
        sequence as usize % self.slots.len()
    }

    pub fn push(&mut self, sequence: u32, snapshot: Snapshot) {
        let index = self.index(sequence);
        self.slots[index] = Some(HistorySlot {
            sequence,
            snapshot,
            acked: 0,
        });
        self.latest = Some(sequence);
    }

    pub fn latest_sequence(&self) -> Option<u32> {
        self.latest
    }

    pub fn get(&self, sequence: u32) -> Option<&Snapshot> {
        self.slots[self.index(sequence)]
            .as_ref()
            .filter(|slot| slot.sequence == sequence)
            .map(|slot| &slot.snapshot)
    }

    /// Returns false when the sequence is no longer stored.
    pub fn acknowledge(&mut self, client: usize, sequence: u32) -> bool {
        if client >= MAX_ACK_CLIENTS {
            return false;
        }
        let index = self.index(sequence);
        match self.slots[index].as_mut() {
            Some(slot) if slot.sequence == sequence => {
                slot.acked |= 1 << client;
                true
            }
            _ => false,
        }
    }

    pub fn is_acked(&self, client: usize, sequence: u32) -> bool {
        client < MAX_ACK_CLIENTS
            && self.slots[self.index(sequence)]
                .as_ref()
                .is_some_and(|slot| slot.sequence == sequence && slot.acked & (1 << client) != 0)
    }

    /// Newest snapshot the client has confirmed, scanning back from the
    /// latest pushed sequence.
    pub fn baseline_for(&self, client: usize) -> Option<(u32, &Snapshot)> {
        let latest = self.latest?;
        for back in 0..self.slots.len() as u32 {
            let Some(sequence) = latest.checked_sub(back) else {
                break;
            };
            if self.is_acked(client, sequence) {
                return self.get(sequence).map(|snapshot| (sequence, snapshot));
            }
        }
        None
    }

    pub fn forget_client(&mut self, client: usize) {
        if client >= MAX_ACK_CLIENTS {
            return;
        }
        for slot in self.slots.iter_mut().flatten() {
            slot.acked &= !(1 << client);
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.latest = None;
    }
}
