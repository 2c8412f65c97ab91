//! Schema-agnostic delta engine.
//!
//! State is modelled as a sorted set of `(entity, kind) -> payload` records.
//! Diffing two sets yields a [`Patch`]; applying the patch to the older set
//! reproduces the newer one.

mod buffer;
mod diff;
mod entity;
mod history;

pub use buffer::{ReceivedState, StateBuffer};
pub use diff::{Patch, PatchOp, diff, diff_filtered};
pub use entity::{DirtyFields, ENTITY_RECORD_LEN, EntityType, SimEntity, SyncId, kind};
pub use history::{DEFAULT_HISTORY_LEN, MAX_ACK_CLIENTS, SnapshotHistory};

pub type ComponentKind = u16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    pub entity: u32,
    pub kind: ComponentKind,
    pub payload: Vec<u8>,
}

impl ComponentRecord {
    pub fn key(&self) -> (u32, ComponentKind) {
        (self.entity, self.kind)
    }
}

/// Anything that can project its state into component records.
pub trait ComponentSource {
    fn collect(&self, out: &mut Vec<ComponentRecord>);
}

/// Anything a [`Patch`] can be applied to.
pub trait ComponentSink {
    fn apply_record(&mut self, record: &ComponentRecord);
    fn remove_record(&mut self, entity: u32, kind: ComponentKind);
}

/// Sorted, duplicate-free record set captured at one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    tick: u32,
    records: Vec<ComponentRecord>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorts the records by key. Later duplicates win.
    pub fn new(tick: u32, mut records: Vec<ComponentRecord>) -> Self {
        records.reverse();
        records.sort_by_key(ComponentRecord::key);
        records.dedup_by_key(|r| r.key());
        Self { tick, records }
    }

    pub fn capture<S: ComponentSource + ?Sized>(tick: u32, source: &S) -> Self {
        let mut records = Vec::new();
        source.collect(&mut records);
        Self::new(tick, records)
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn set_tick(&mut self, tick: u32) {
        self.tick = tick;
    }

    pub fn records(&self) -> &[ComponentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, entity: u32, kind: ComponentKind) -> Option<&ComponentRecord> {
        self.records
            .binary_search_by_key(&(entity, kind), ComponentRecord::key)
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn contains_entity(&self, entity: u32) -> bool {
        let start = self.records.partition_point(|r| r.entity < entity);
        self.records.get(start).is_some_and(|r| r.entity == entity)
    }

    pub fn apply(&mut self, patch: &Patch) {
        patch.apply_to(self);
        self.tick = patch.tick;
    }
}

impl ComponentSink for Snapshot {
    fn apply_record(&mut self, record: &ComponentRecord) {
        match self
            .records
            .binary_search_by_key(&record.key(), ComponentRecord::key)
        {
            Ok(i) => self.records[i].payload.clone_from(&record.payload),
            Err(i) => self.records.insert(i, record.clone()),
        }
    }

    fn remove_record(&mut self, entity: u32, kind: ComponentKind) {
        if let Ok(i) = self
            .records
            .binary_search_by_key(&(entity, kind), ComponentRecord::key)
        {
            self.records.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity: u32, kind: ComponentKind, byte: u8) -> ComponentRecord {
        ComponentRecord {
            entity,
            kind,
            payload: vec![byte],
        }
    }

    #[test]
    fn new_sorts_and_keeps_last_duplicate() {
        let snapshot = Snapshot::new(
            1,
            vec![record(3, 0, 1), record(1, 2, 2), record(1, 1, 3), record(3, 0, 9)],
        );
        let keys: Vec<_> = snapshot.records().iter().map(ComponentRecord::key).collect();
        assert_eq!(keys, vec![(1, 1), (1, 2), (3, 0)]);
        assert_eq!(snapshot.get(3, 0).unwrap().payload, vec![9]);
    }

    #[test]
    fn sink_keeps_order() {
        let mut snapshot = Snapshot::new(0, vec![record(1, 0, 0), record(5, 0, 0)]);
        snapshot.apply_record(&record(3, 1, 7));
        snapshot.apply_record(&record(1, 0, 4));
        snapshot.remove_record(5, 0);

        let keys: Vec<_> = snapshot.records().iter().map(ComponentRecord::key).collect();
        assert_eq!(keys, vec![(1, 0), (3, 1)]);
        assert_eq!(snapshot.get(1, 0).unwrap().payload, vec![4]);
        assert!(snapshot.contains_entity(3));
        assert!(!snapshot.contains_entity(5));
    }
}
