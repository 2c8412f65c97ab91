use std::collections::BTreeMap;

use super::{SimEntity, SyncId};

/// A fully applied world state as seen by a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceivedState {
    pub sequence: u32,
    pub tick: u32,
    pub server_time_ms: u32,
    pub world_offset: f32,
    pub entities: BTreeMap<SyncId, SimEntity>,
}

impl ReceivedState {
    pub fn entity(&self, id: SyncId) -> Option<&SimEntity> {
        self.entities.get(&id)
    }
}

/// Client ring of applied states, keyed by sequence so delta bases can be
/// looked up in O(1).
#[derive(Debug)]
pub struct StateBuffer {
    states: Vec<Option<ReceivedState>>,
    capacity: usize,
}

impl StateBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            states: (0..capacity).map(|_| None).collect(),
            capacity,
        }
    }

    pub fn push(&mut self, state: ReceivedState) {
        let index = (state.sequence as usize) % self.capacity;
        self.states[index] = Some(state);
    }

    pub fn get(&self, sequence: u32) -> Option<&ReceivedState> {
        let index = (sequence as usize) % self.capacity;
        self.states[index]
            .as_ref()
            .filter(|s| s.sequence == sequence)
    }

    pub fn latest(&self) -> Option<&ReceivedState> {
        self.states
            .iter()
            .filter_map(|s| s.as_ref())
            .max_by_key(|s| s.sequence)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.states {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.states.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(sequence: u32) -> ReceivedState {
        ReceivedState {
            sequence,
            tick: sequence * 2,
            ..Default::default()
        }
    }

    #[test]
    fn o1_lookup() {
        let mut buffer = StateBuffer::new(32);

        for sequence in 1..100 {
            buffer.push(state(sequence));
        }

        assert_eq!(buffer.get(90).map(|s| s.tick), Some(180));
        assert!(buffer.get(30).is_none());
        assert_eq!(buffer.latest().map(|s| s.sequence), Some(99));
        assert_eq!(buffer.len(), 32);
    }
}
