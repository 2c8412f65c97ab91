use std::collections::{BTreeMap, HashMap};

use crate::codec::{ByteReader, CodecError};
use crate::net::{DeltaUpdate, EntityChange, StateUpdate};
use crate::snapshot::{DirtyFields, Patch, PatchOp, ReceivedState, SimEntity, SyncId, kind};

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("changed entity {0} is not in the baseline")]
    UnknownEntity(SyncId),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Entity-level view of a component patch, ready for a STATE_DELTA.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaBody {
    pub changed: Vec<EntityChange>,
    pub destroyed: Vec<SyncId>,
    pub created: Vec<SimEntity>,
}

/// Groups patch operations per entity. A CORE upsert means the receiver
/// needs the whole record, a CORE removal means the entity is gone, and any
/// other upsert sets the matching dirty bit.
pub fn build_delta(patch: &Patch, current: &HashMap<SyncId, &SimEntity>) -> DeltaBody {
    let mut body = DeltaBody::default();
    let ops = &patch.ops;
    let mut start = 0;

    while start < ops.len() {
        let entity = ops[start].key().0;
        let end = ops[start..]
            .iter()
            .position(|op| op.key().0 != entity)
            .map_or(ops.len(), |offset| start + offset);
        let group = &ops[start..end];
        start = end;

        let core_removed = group
            .iter()
            .any(|op| matches!(op, PatchOp::Remove { kind: k, .. } if *k == kind::CORE));
        if core_removed {
            body.destroyed.push(entity);
            continue;
        }

        let core_written = group
            .iter()
            .any(|op| matches!(op, PatchOp::Upsert(r) if r.kind == kind::CORE));
        if core_written {
            if let Some(full) = current.get(&entity) {
                body.created.push((*full).clone());
            }
            continue;
        }

        let mut dirty = DirtyFields::empty();
        let mut data = Vec::new();
        for op in group {
            if let PatchOp::Upsert(record) = op {
                dirty |= DirtyFields::for_kind(record.kind);
                data.extend_from_slice(&record.payload);
            }
        }
        if !dirty.is_empty() {
            body.changed.push(EntityChange {
                id: entity,
                dirty,
                data,
            });
        }
    }

    body
}

/// Rebuilds the state a delta describes on top of `base`.
pub fn apply_delta(
    base: &BTreeMap<SyncId, SimEntity>,
    delta: &DeltaUpdate,
) -> Result<BTreeMap<SyncId, SimEntity>, DeltaError> {
    let mut entities = base.clone();

    for id in &delta.destroyed {
        entities.remove(id);
    }

    for change in &delta.changed {
        if change.dirty.contains(DirtyFields::DESTROYED) {
            entities.remove(&change.id);
            continue;
        }
        let entity = entities
            .get_mut(&change.id)
            .ok_or(DeltaError::UnknownEntity(change.id))?;
        entity.read_dirty(change.dirty, &mut ByteReader::new(&change.data))?;
    }

    for entity in &delta.created {
        entities.insert(entity.id, entity.clone());
    }

    Ok(entities)
}

pub fn apply_full(state: &StateUpdate) -> BTreeMap<SyncId, SimEntity> {
    state
        .entities
        .iter()
        .map(|entity| (entity.id, entity.clone()))
        .collect()
}

impl ReceivedState {
    pub fn from_delta(
        base: &BTreeMap<SyncId, SimEntity>,
        delta: &DeltaUpdate,
    ) -> Result<Self, DeltaError> {
        Ok(Self {
            sequence: delta.sequence,
            tick: delta.tick,
            server_time_ms: delta.server_time_ms,
            world_offset: delta.world_offset,
            entities: apply_delta(base, delta)?,
        })
    }

    pub fn from_full(state: &StateUpdate) -> Self {
        Self {
            sequence: 0,
            tick: state.tick,
            server_time_ms: state.server_time_ms,
            world_offset: state.world_offset,
            entities: apply_full(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;
    use crate::snapshot::{EntityType, Snapshot, diff};

    fn entity(id: SyncId, x: f32) -> SimEntity {
        let mut entity = SimEntity::new(id, EntityType::Enemy);
        entity.position = Vec2::new(x, 0.0);
        entity.health = 40;
        entity
    }

    fn lookup(entities: &[SimEntity]) -> HashMap<SyncId, &SimEntity> {
        entities.iter().map(|e| (e.id, e)).collect()
    }

    fn wire_delta(body: DeltaBody) -> DeltaUpdate {
        DeltaUpdate {
            sequence: 2,
            base_sequence: 1,
            changed: body.changed,
            destroyed: body.destroyed,
            created: body.created,
            ..DeltaUpdate::default()
        }
    }

    #[test]
    fn patch_groups_into_entity_categories() {
        let before = vec![entity(1, 0.0), entity(2, 5.0)];
        let mut moved = entity(1, 3.0);
        moved.health = 30;
        let after = vec![moved, entity(3, 7.0)];

        let patch = diff(
            &Snapshot::capture(1, before.as_slice()),
            &Snapshot::capture(2, after.as_slice()),
        );
        let body = build_delta(&patch, &lookup(&after));

        assert_eq!(body.destroyed, vec![2]);
        assert_eq!(body.created.len(), 1);
        assert_eq!(body.created[0].id, 3);
        assert_eq!(body.changed.len(), 1);
        assert_eq!(
            body.changed[0].dirty,
            DirtyFields::POSITION | DirtyFields::HEALTH
        );
        assert_eq!(body.changed[0].data.len(), 8 + 2);
    }

    #[test]
    fn applied_delta_matches_target() {
        let before = vec![entity(1, 0.0), entity(2, 5.0), entity(4, 1.0)];
        let mut after = vec![entity(1, 9.0), entity(4, 1.0), entity(6, 2.0)];
        after[1].score = 77;

        let patch = diff(
            &Snapshot::capture(1, before.as_slice()),
            &Snapshot::capture(2, after.as_slice()),
        );
        let delta = wire_delta(build_delta(&patch, &lookup(&after)));

        let base: BTreeMap<_, _> = before.into_iter().map(|e| (e.id, e)).collect();
        let rebuilt = apply_delta(&base, &delta).unwrap();
        let expected: BTreeMap<_, _> = after.into_iter().map(|e| (e.id, e)).collect();
        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn change_to_missing_entity_is_rejected() {
        let delta = DeltaUpdate {
            changed: vec![EntityChange {
                id: 99,
                dirty: DirtyFields::FLAGS,
                data: vec![1],
            }],
            ..DeltaUpdate::default()
        };
        assert!(matches!(
            apply_delta(&BTreeMap::new(), &delta),
            Err(DeltaError::UnknownEntity(99))
        ));
    }

    #[test]
    fn destroyed_bit_removes_entity() {
        let base: BTreeMap<_, _> = [(5, entity(5, 0.0))].into_iter().collect();
        let delta = DeltaUpdate {
            changed: vec![EntityChange {
                id: 5,
                dirty: DirtyFields::DESTROYED,
                data: Vec::new(),
            }],
            ..DeltaUpdate::default()
        };
        assert!(apply_delta(&base, &delta).unwrap().is_empty());
    }
}
