use std::cmp::Ordering;

use super::{ComponentKind, ComponentRecord, ComponentSink, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Upsert(ComponentRecord),
    Remove { entity: u32, kind: ComponentKind },
}

impl PatchOp {
    pub fn key(&self) -> (u32, ComponentKind) {
        match self {
            PatchOp::Upsert(record) => record.key(),
            PatchOp::Remove { entity, kind } => (*entity, *kind),
        }
    }
}

/// Ordered set of operations turning the base snapshot into the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub base_tick: u32,
    pub tick: u32,
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn apply_to<S: ComponentSink + ?Sized>(&self, sink: &mut S) {
        for op in &self.ops {
            match op {
                PatchOp::Upsert(record) => sink.apply_record(record),
                PatchOp::Remove { entity, kind } => sink.remove_record(*entity, *kind),
            }
        }
    }
}

pub fn diff(previous: &Snapshot, current: &Snapshot) -> Patch {
    diff_filtered(previous, current, |_, _| true)
}

/// Merge walk over both sorted record sets. Records of `current` rejected by
/// `filter` count as absent, so the receiver drops them if it held them.
pub fn diff_filtered<F>(previous: &Snapshot, current: &Snapshot, mut filter: F) -> Patch
where
    F: FnMut(u32, ComponentKind) -> bool,
{
    let prev = previous.records();
    let cur: Vec<&ComponentRecord> = current
        .records()
        .iter()
        .filter(|r| filter(r.entity, r.kind))
        .collect();
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < prev.len() || j < cur.len() {
        let order = match (prev.get(i), cur.get(j)) {
            (Some(p), Some(c)) => p.key().cmp(&c.key()),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };

        match order {
            Ordering::Less => {
                let (entity, kind) = prev[i].key();
                ops.push(PatchOp::Remove { entity, kind });
                i += 1;
            }
            Ordering::Greater => {
                ops.push(PatchOp::Upsert(cur[j].clone()));
                j += 1;
            }
            Ordering::Equal => {
                if prev[i].payload != cur[j].payload {
                    ops.push(PatchOp::Upsert(cur[j].clone()));
                }
                i += 1;
                j += 1;
            }
        }
    }

    Patch {
        base_tick: previous.tick(),
        tick: current.tick(),
        ops,
    }
}
