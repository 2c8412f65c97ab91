mod arena;

use std::collections::HashMap;

use glam::Vec2;

use crate::snapshot::{ComponentRecord, ComponentSource, EntityType, SimEntity, SyncId};

pub use arena::{Arena, EntityKey, SyncIdAllocator};

/// Internal simulation state of one object. Only part of it is projected
/// onto the wire as a [`SimEntity`].
#[derive(Debug, Clone)]
pub struct Entity {
    pub sync_id: SyncId,
    pub entity_type: EntityType,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: u16,
    pub flags: u8,
    pub owner: u64,
    pub score: u32,
    pub powerups: u8,
    pub speed_multiplier: f32,
    pub weapon: u8,
    pub fire_rate: f32,
    pub fire_cooldown: f32,
    /// Seconds left before the entity expires on its own.
    pub lifetime: Option<f32>,
}

impl Entity {
    pub fn new(sync_id: SyncId, entity_type: EntityType) -> Self {
        Self {
            sync_id,
            entity_type,
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            health: 0,
            flags: 0,
            owner: 0,
            score: 0,
            powerups: 0,
            speed_multiplier: 1.0,
            weapon: 0,
            fire_rate: 0.0,
            fire_cooldown: 0.0,
            lifetime: None,
        }
    }

    pub fn to_sim_entity(&self) -> SimEntity {
        SimEntity {
            id: self.sync_id,
            entity_type: self.entity_type,
            position: self.position,
            velocity: self.velocity,
            health: self.health,
            flags: self.flags,
            owner: self.owner,
            score: self.score,
            powerups: self.powerups,
            speed_multiplier: self.speed_multiplier,
            weapon: self.weapon,
            fire_rate: self.fire_rate,
        }
    }
}

#[derive(Debug, Default)]
pub struct World {
    tick: u32,
    entities: Arena<Entity>,
    by_sync_id: HashMap<SyncId, EntityKey>,
    sync_ids: SyncIdAllocator,
    removed: Vec<SyncId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn advance_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        self.removed.clear();
    }

    pub fn spawn(&mut self, entity_type: EntityType) -> EntityKey {
        let sync_id = self.sync_ids.allocate();
        let key = self.entities.insert(Entity::new(sync_id, entity_type));
        self.by_sync_id.insert(sync_id, key);
        key
    }

    pub fn despawn(&mut self, key: EntityKey) -> Option<Entity> {
        let entity = self.entities.remove(key)?;
        self.by_sync_id.remove(&entity.sync_id);
        self.removed.push(entity.sync_id);
        Some(entity)
    }

    pub fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(key)
    }

    pub fn key_of(&self, sync_id: SyncId) -> Option<EntityKey> {
        self.by_sync_id.get(&sync_id).copied()
    }

    pub fn get_by_sync_id(&self, sync_id: SyncId) -> Option<&Entity> {
        self.key_of(sync_id).and_then(|key| self.entities.get(key))
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityKey, &Entity)> {
        self.entities.iter()
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = (EntityKey, &mut Entity)> {
        self.entities.iter_mut()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Sync ids despawned since the last `advance_tick`.
    pub fn removed_entities(&self) -> &[SyncId] {
        &self.removed
    }

    /// Wire projection, ordered by sync id.
    pub fn project(&self) -> Vec<SimEntity> {
        let mut projected: Vec<SimEntity> = self
            .entities
            .iter()
            .map(|(_, entity)| entity.to_sim_entity())
            .collect();
        projected.sort_by_key(|e| e.id);
        projected
    }
}

impl ComponentSource for World {
    fn collect(&self, out: &mut Vec<ComponentRecord>) {
        for (_, entity) in self.entities.iter() {
            entity.to_sim_entity().records(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    #[test]
    fn sync_id_survives_slot_reuse() {
        let mut world = World::new();
        let bullet = world.spawn(EntityType::Bullet);
        let old_id = world.get(bullet).unwrap().sync_id;
        world.despawn(bullet);

        let enemy = world.spawn(EntityType::Enemy);
        assert_eq!(enemy.index, bullet.index);
        assert_ne!(world.get(enemy).unwrap().sync_id, old_id);
        assert!(world.get(bullet).is_none());
        assert!(world.get_by_sync_id(old_id).is_none());
        assert_eq!(world.removed_entities(), &[old_id]);
    }

    #[test]
    fn capture_covers_every_entity() {
        let mut world = World::new();
        world.spawn(EntityType::Player);
        world.spawn(EntityType::Obstacle);

        let snapshot = Snapshot::capture(world.tick(), &world);
        assert_eq!(snapshot.len(), 2 * crate::snapshot::kind::ALL.len());
        assert_eq!(world.project().len(), 2);
    }
}
