use bitflags::bitflags;
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter, CodecError};

use super::{ComponentKind, ComponentRecord, ComponentSource};

/// Wire-visible entity id. Never recycled within a session.
pub type SyncId = u32;

/// Size of one full entity record on the wire.
pub const ENTITY_RECORD_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum EntityType {
    #[default]
    Player = 0,
    Enemy = 1,
    Bullet = 2,
    Powerup = 3,
    Obstacle = 4,
    Boss = 5,
}

impl TryFrom<u8> for EntityType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Player),
            1 => Ok(Self::Enemy),
            2 => Ok(Self::Bullet),
            3 => Ok(Self::Powerup),
            4 => Ok(Self::Obstacle),
            5 => Ok(Self::Boss),
            _ => Err(CodecError::InvalidTag {
                what: "entity type",
                value,
            }),
        }
    }
}

/// Component kinds a [`SimEntity`] is split into for diffing. Every kind
/// except `CORE` maps onto one dirty-field bit.
pub mod kind {
    use super::ComponentKind;

    pub const CORE: ComponentKind = 0;
    pub const POSITION: ComponentKind = 1;
    pub const VELOCITY: ComponentKind = 2;
    pub const HEALTH: ComponentKind = 3;
    pub const FLAGS: ComponentKind = 4;
    pub const SCORE: ComponentKind = 5;
    pub const POWERUPS: ComponentKind = 6;
    pub const WEAPON: ComponentKind = 7;

    pub const ALL: [ComponentKind; 8] = [CORE, POSITION, VELOCITY, HEALTH, FLAGS, SCORE, POWERUPS, WEAPON];
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFields: u8 {
        const POSITION = 1 << 0;
        const VELOCITY = 1 << 1;
        const HEALTH = 1 << 2;
        const FLAGS = 1 << 3;
        const SCORE = 1 << 4;
        const POWERUPS = 1 << 5;
        const WEAPON = 1 << 6;
        const DESTROYED = 1 << 7;
    }
}

impl DirtyFields {
    pub fn for_kind(kind: ComponentKind) -> Self {
        match kind {
            kind::POSITION => Self::POSITION,
            kind::VELOCITY => Self::VELOCITY,
            kind::HEALTH => Self::HEALTH,
            kind::FLAGS => Self::FLAGS,
            kind::SCORE => Self::SCORE,
            kind::POWERUPS => Self::POWERUPS,
            kind::WEAPON => Self::WEAPON,
            _ => Self::empty(),
        }
    }

    /// Bytes the present fields occupy in a changed-entity entry.
    pub fn payload_len(self) -> usize {
        let mut len = 0;
        for kind in &kind::ALL[1..] {
            if self.contains(Self::for_kind(*kind)) {
                len += field_len(*kind);
            }
        }
        len
    }
}

fn field_len(kind: ComponentKind) -> usize {
    match kind {
        kind::CORE => 9,
        kind::POSITION | kind::VELOCITY => 8,
        kind::HEALTH => 2,
        kind::FLAGS => 1,
        kind::SCORE => 4,
        kind::POWERUPS | kind::WEAPON => 2,
        _ => 0,
    }
}

/// Flat projection of simulation state that crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SimEntity {
    pub id: SyncId,
    pub entity_type: EntityType,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: u16,
    pub flags: u8,
    /// Identity hash of the owning player, 0 if none.
    pub owner: u64,
    pub score: u32,
    pub powerups: u8,
    pub speed_multiplier: f32,
    pub weapon: u8,
    pub fire_rate: f32,
}

impl SimEntity {
    pub fn new(id: SyncId, entity_type: EntityType) -> Self {
        Self {
            id,
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
        }
    }

    fn speed_fixed(&self) -> u8 {
        (self.speed_multiplier * 10.0).round().clamp(0.0, 255.0) as u8
    }

    fn fire_rate_fixed(&self) -> u8 {
        (self.fire_rate * 20.0).round().clamp(0.0, 255.0) as u8
    }

    fn write_field(&self, kind: ComponentKind, w: &mut ByteWriter) {
        match kind {
            kind::CORE => {
                w.write_u8(self.entity_type as u8);
                w.write_u64(self.owner);
            }
            kind::POSITION => {
                w.write_f32(self.position.x);
                w.write_f32(self.position.y);
            }
            kind::VELOCITY => {
                w.write_f32(self.velocity.x);
                w.write_f32(self.velocity.y);
            }
            kind::HEALTH => w.write_u16(self.health),
            kind::FLAGS => w.write_u8(self.flags),
            kind::SCORE => w.write_u32(self.score),
            kind::POWERUPS => {
                w.write_u8(self.powerups);
                w.write_u8(self.speed_fixed());
            }
            kind::WEAPON => {
                w.write_u8(self.weapon);
                w.write_u8(self.fire_rate_fixed());
            }
            _ => {}
        }
    }

    fn read_field(&mut self, kind: ComponentKind, r: &mut ByteReader<'_>) -> Result<(), CodecError> {
        match kind {
            kind::CORE => {
                self.entity_type = EntityType::try_from(r.read_u8()?)?;
                self.owner = r.read_u64()?;
            }
            kind::POSITION => self.position = Vec2::new(r.read_f32()?, r.read_f32()?),
            kind::VELOCITY => self.velocity = Vec2::new(r.read_f32()?, r.read_f32()?),
            kind::HEALTH => self.health = r.read_u16()?,
            kind::FLAGS => self.flags = r.read_u8()?,
            kind::SCORE => self.score = r.read_u32()?,
            kind::POWERUPS => {
                self.powerups = r.read_u8()?;
                self.speed_multiplier = r.read_u8()? as f32 / 10.0;
            }
            kind::WEAPON => {
                self.weapon = r.read_u8()?;
                self.fire_rate = r.read_u8()? as f32 / 20.0;
            }
            _ => {}
        }
        Ok(())
    }

    /// Serialized payload for one component kind.
    pub fn component_payload(&self, kind: ComponentKind) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(field_len(kind));
        self.write_field(kind, &mut w);
        w.into_bytes()
    }

    pub fn records(&self, out: &mut Vec<ComponentRecord>) {
        for kind in kind::ALL {
            out.push(ComponentRecord {
                entity: self.id,
                kind,
                payload: self.component_payload(kind),
            });
        }
    }

    pub fn apply_component(&mut self, kind: ComponentKind, payload: &[u8]) -> Result<(), CodecError> {
        let mut r = ByteReader::new(payload);
        self.read_field(kind, &mut r)
    }

    /// Writes the fields selected by `dirty` in bit order.
    pub fn write_dirty(&self, dirty: DirtyFields, w: &mut ByteWriter) {
        for kind in &kind::ALL[1..] {
            if dirty.contains(DirtyFields::for_kind(*kind)) {
                self.write_field(*kind, w);
            }
        }
    }

    pub fn read_dirty(&mut self, dirty: DirtyFields, r: &mut ByteReader<'_>) -> Result<(), CodecError> {
        for kind in &kind::ALL[1..] {
            if dirty.contains(DirtyFields::for_kind(*kind)) {
                self.read_field(*kind, r)?;
            }
        }
        Ok(())
    }

    /// Fixed-order 40 byte record.
    pub fn write_record(&self, w: &mut ByteWriter) {
        w.write_u32(self.id);
        w.write_u8(self.entity_type as u8);
        w.write_f32(self.position.x);
        w.write_f32(self.position.y);
        w.write_f32(self.velocity.x);
        w.write_f32(self.velocity.y);
        w.write_u16(self.health);
        w.write_u8(self.flags);
        w.write_u64(self.owner);
        w.write_u32(self.score);
        w.write_u8(self.powerups);
        w.write_u8(self.speed_fixed());
        w.write_u8(self.weapon);
        w.write_u8(self.fire_rate_fixed());
    }

    pub fn read_record(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = r.read_u32()?;
        let entity_type = EntityType::try_from(r.read_u8()?)?;
        Ok(Self {
            id,
            entity_type,
            position: Vec2::new(r.read_f32()?, r.read_f32()?),
            velocity: Vec2::new(r.read_f32()?, r.read_f32()?),
            health: r.read_u16()?,
            flags: r.read_u8()?,
            owner: r.read_u64()?,
            score: r.read_u32()?,
            powerups: r.read_u8()?,
            speed_multiplier: r.read_u8()? as f32 / 10.0,
            weapon: r.read_u8()?,
            fire_rate: r.read_u8()? as f32 / 20.0,
        })
    }
}

impl ComponentSource for [SimEntity] {
    fn collect(&self, out: &mut Vec<ComponentRecord>) {
        for entity in self {
            entity.records(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimEntity {
        SimEntity {
            id: 42,
            entity_type: EntityType::Player,
            position: Vec2::new(10.5, -3.25),
            velocity: Vec2::new(1.0, 0.0),
            health: 100,
            flags: 0b101,
            owner: 0xABCD,
            score: 1200,
            powerups: 0b11,
            speed_multiplier: 1.5,
            weapon: 2,
            fire_rate: 4.0,
        }
    }

    #[test]
    fn record_is_forty_bytes() {
        let mut w = ByteWriter::new();
        sample().write_record(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), ENTITY_RECORD_LEN);

        let decoded = SimEntity::read_record(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn fixed_point_fields_quantize() {
        let mut entity = sample();
        entity.speed_multiplier = 1.234;
        entity.fire_rate = 2.51;
        let mut w = ByteWriter::new();
        entity.write_record(&mut w);
        let decoded = SimEntity::read_record(&mut ByteReader::new(&w.into_bytes())).unwrap();
        assert!((decoded.speed_multiplier - 1.2).abs() < 1e-6);
        assert!((decoded.fire_rate - 2.5).abs() < 1e-6);
    }

    #[test]
    fn dirty_payload_matches_declared_length() {
        let dirty = DirtyFields::POSITION | DirtyFields::HEALTH | DirtyFields::WEAPON;
        let mut w = ByteWriter::new();
        sample().write_dirty(dirty, &mut w);
        assert_eq!(w.len(), dirty.payload_len());
        assert_eq!(dirty.payload_len(), 8 + 2 + 2);

        let mut target = SimEntity::new(42, EntityType::Player);
        target
            .read_dirty(dirty, &mut ByteReader::new(&w.into_bytes()))
            .unwrap();
        assert_eq!(target.position, sample().position);
        assert_eq!(target.health, 100);
        assert_eq!(target.weapon, 2);
        assert_eq!(target.score, 0);
    }

    #[test]
    fn components_rebuild_entity() {
        let mut records = Vec::new();
        sample().records(&mut records);
        assert_eq!(records.len(), kind::ALL.len());

        let mut rebuilt = SimEntity::new(42, EntityType::Enemy);
        for record in &records {
            rebuilt.apply_component(record.kind, &record.payload).unwrap();
        }
        assert_eq!(rebuilt, sample());
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        assert!(EntityType::try_from(9).is_err());
    }
}
