use bitflags::bitflags;

use crate::codec::{ByteReader, ByteWriter, CodecError, NAME_LEN, ensure_min_len};
use crate::snapshot::{DirtyFields, ENTITY_RECORD_LEN, SimEntity, SyncId};

pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

pub mod opcode {
    pub const HELLO: u8 = 0x01;
    pub const WELCOME: u8 = 0x02;
    pub const INPUT: u8 = 0x03;
    pub const STATE: u8 = 0x04;
    pub const STATE_DELTA: u8 = 0x05;
    pub const STATE_ACK: u8 = 0x06;
    pub const PING: u8 = 0x07;
    pub const PONG: u8 = 0x08;
    pub const LEVEL_COMPLETE: u8 = 0x09;
    pub const DISCONNECT: u8 = 0x0A;
}

const STATE_HEADER_LEN: usize = 4 + 4 + 2 + 4 + 1;
const DELTA_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4 + 1 + 2 + 2 + 2 + 1 + 4;
const ACK_ENTRY_LEN: usize = 8 + 4;
const CHANGED_ENTRY_MIN_LEN: usize = 4 + 1;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFlags: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const SHOOT = 1 << 4;
    }
}

/// Last input sequence the server processed for one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputAck {
    pub identity: u64,
    pub sequence: u32,
}

impl InputAck {
    fn write(&self, w: &mut ByteWriter) {
        w.write_u64(self.identity);
        w.write_u32(self.sequence);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            identity: r.read_u64()?,
            sequence: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPacket {
    pub sequence: u32,
    pub identity: u64,
    pub buttons: InputFlags,
    /// Only used for latency estimation, never for ordering.
    pub client_time_ms: u32,
}

/// Full authoritative state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateUpdate {
    pub tick: u32,
    pub server_time_ms: u32,
    pub world_offset: f32,
    pub acks: Vec<InputAck>,
    pub entities: Vec<SimEntity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub id: SyncId,
    pub dirty: DirtyFields,
    /// Present fields, in dirty-bit order.
    pub data: Vec<u8>,
}

/// State relative to an earlier update the receiver already holds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaUpdate {
    pub tick: u32,
    pub server_time_ms: u32,
    pub sequence: u32,
    /// 0 means the empty baseline.
    pub base_sequence: u32,
    pub world_offset: f32,
    pub acks: Vec<InputAck>,
    pub changed: Vec<EntityChange>,
    pub destroyed: Vec<SyncId>,
    pub created: Vec<SimEntity>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionPacket {
    Hello {
        identity: u64,
        name: String,
    },
    Welcome {
        players_connected: u8,
        server_tick: u32,
        entity_id: SyncId,
    },
    Input(InputPacket),
    State(StateUpdate),
    StateDelta(DeltaUpdate),
    StateAck {
        identity: u64,
        sequence: u32,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    LevelComplete {
        completed: u8,
        next: u8,
    },
    Disconnect {
        identity: u64,
    },
}

fn write_count(w: &mut ByteWriter, len: usize) -> usize {
    let count = len.min(u16::MAX as usize);
    w.write_u16(count as u16);
    count
}

fn write_acks(w: &mut ByteWriter, acks: &[InputAck]) {
    for ack in acks.iter().take(u8::MAX as usize) {
        ack.write(w);
    }
}

fn read_acks(r: &mut ByteReader<'_>, count: u8) -> Result<Vec<InputAck>, CodecError> {
    (0..count).map(|_| InputAck::read(r)).collect()
}

impl SessionPacket {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Hello { .. } => opcode::HELLO,
            Self::Welcome { .. } => opcode::WELCOME,
            Self::Input(_) => opcode::INPUT,
            Self::State(_) => opcode::STATE,
            Self::StateDelta(_) => opcode::STATE_DELTA,
            Self::StateAck { .. } => opcode::STATE_ACK,
            Self::Ping { .. } => opcode::PING,
            Self::Pong { .. } => opcode::PONG,
            Self::LevelComplete { .. } => opcode::LEVEL_COMPLETE,
            Self::Disconnect { .. } => opcode::DISCONNECT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(64);
        w.write_u8(self.opcode());

        match self {
            Self::Hello { identity, name } => {
                w.write_u64(*identity);
                w.write_fixed_str(name, NAME_LEN);
            }
            Self::Welcome {
                players_connected,
                server_tick,
                entity_id,
            } => {
                w.write_u8(*players_connected);
                w.write_u32(*server_tick);
                w.write_u32(*entity_id);
            }
            Self::Input(input) => {
                w.write_u32(input.sequence);
                w.write_u64(input.identity);
                w.write_u8(input.buttons.bits());
                w.write_u32(input.client_time_ms);
            }
            Self::State(state) => encode_state(&mut w, state),
            Self::StateDelta(delta) => encode_delta(&mut w, delta),
            Self::StateAck { identity, sequence } => {
                w.write_u64(*identity);
                w.write_u32(*sequence);
            }
            Self::Ping { timestamp } | Self::Pong { timestamp } => w.write_u64(*timestamp),
            Self::LevelComplete { completed, next } => {
                w.write_u8(*completed);
                w.write_u8(*next);
            }
            Self::Disconnect { identity } => w.write_u64(*identity),
        }

        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure_min_len(data, 1)?;
        let op = data[0];
        ensure_min_len(data, 1 + min_payload_len(op)?)?;

        let mut r = ByteReader::new(&data[1..]);
        let packet = match op {
            opcode::HELLO => Self::Hello {
                identity: r.read_u64()?,
                name: r.read_fixed_str(NAME_LEN)?,
            },
            opcode::WELCOME => Self::Welcome {
                players_connected: r.read_u8()?,
                server_tick: r.read_u32()?,
                entity_id: r.read_u32()?,
            },
            opcode::INPUT => Self::Input(InputPacket {
                sequence: r.read_u32()?,
                identity: r.read_u64()?,
                buttons: InputFlags::from_bits_truncate(r.read_u8()?),
                client_time_ms: r.read_u32()?,
            }),
            opcode::STATE => Self::State(decode_state(&mut r)?),
            opcode::STATE_DELTA => Self::StateDelta(decode_delta(&mut r)?),
            opcode::STATE_ACK => Self::StateAck {
                identity: r.read_u64()?,
                sequence: r.read_u32()?,
            },
            opcode::PING => Self::Ping {
                timestamp: r.read_u64()?,
            },
            opcode::PONG => Self::Pong {
                timestamp: r.read_u64()?,
            },
            opcode::LEVEL_COMPLETE => Self::LevelComplete {
                completed: r.read_u8()?,
                next: r.read_u8()?,
            },
            opcode::DISCONNECT => Self::Disconnect {
                identity: r.read_u64()?,
            },
            other => return Err(CodecError::UnknownOpcode(other)),
        };

        Ok(packet)
    }
}

fn encode_state(w: &mut ByteWriter, state: &StateUpdate) {
    w.write_u32(state.tick);
    w.write_u32(state.server_time_ms);
    let count = write_count(w, state.entities.len());
    w.write_f32(state.world_offset);
    w.write_u8(state.acks.len().min(u8::MAX as usize) as u8);
    write_acks(w, &state.acks);
    for entity in &state.entities[..count] {
        entity.write_record(w);
    }
}

fn decode_state(r: &mut ByteReader<'_>) -> Result<StateUpdate, CodecError> {
    let tick = r.read_u32()?;
    let server_time_ms = r.read_u32()?;
    let entity_count = r.read_u16()? as usize;
    let world_offset = r.read_f32()?;
    let ack_count = r.read_u8()?;

    let needed = ack_count as usize * ACK_ENTRY_LEN + entity_count * ENTITY_RECORD_LEN;
    if r.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: r.remaining(),
        });
    }

    let acks = read_acks(r, ack_count)?;
    let entities = (0..entity_count)
        .map(|_| SimEntity::read_record(r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StateUpdate {
        tick,
        server_time_ms,
        world_offset,
        acks,
        entities,
    })
}

fn encode_delta(w: &mut ByteWriter, delta: &DeltaUpdate) {
    w.write_u32(delta.tick);
    w.write_u32(delta.server_time_ms);
    w.write_u32(delta.sequence);
    w.write_u32(delta.base_sequence);
    w.write_f32(delta.world_offset);
    w.write_u8(delta.acks.len().min(u8::MAX as usize) as u8);
    let changed = write_count(w, delta.changed.len());
    let destroyed = write_count(w, delta.destroyed.len());
    let created = write_count(w, delta.created.len());
    w.write_u8(0);
    let size_offset = w.len();
    w.write_u32(0);

    let body_start = w.len();
    write_acks(w, &delta.acks);
    for change in &delta.changed[..changed] {
        w.write_u32(change.id);
        w.write_u8(change.dirty.bits());
        w.write_bytes(&change.data);
    }
    for id in &delta.destroyed[..destroyed] {
        w.write_u32(*id);
    }
    for entity in &delta.created[..created] {
        entity.write_record(w);
    }
    let body_len = (w.len() - body_start) as u32;
    w.patch_u32(size_offset, body_len);
}

fn decode_delta(r: &mut ByteReader<'_>) -> Result<DeltaUpdate, CodecError> {
    let tick = r.read_u32()?;
    let server_time_ms = r.read_u32()?;
    let sequence = r.read_u32()?;
    let base_sequence = r.read_u32()?;
    let world_offset = r.read_f32()?;
    let ack_count = r.read_u8()?;
    let changed_count = r.read_u16()? as usize;
    let destroyed_count = r.read_u16()? as usize;
    let created_count = r.read_u16()? as usize;
    let compression = r.read_u8()?;
    let _uncompressed_size = r.read_u32()?;

    if compression != 0 {
        return Err(CodecError::InvalidTag {
            what: "compression",
            value: compression,
        });
    }

    let needed = ack_count as usize * ACK_ENTRY_LEN
        + changed_count * CHANGED_ENTRY_MIN_LEN
        + destroyed_count * 4
        + created_count * ENTITY_RECORD_LEN;
    if r.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: r.remaining(),
        });
    }

    let acks = read_acks(r, ack_count)?;

    let mut changed = Vec::with_capacity(changed_count);
    for _ in 0..changed_count {
        let id = r.read_u32()?;
        let dirty = DirtyFields::from_bits_retain(r.read_u8()?);
        let data = r.read_bytes(dirty.payload_len())?.to_vec();
        changed.push(EntityChange { id, dirty, data });
    }

    let destroyed = (0..destroyed_count)
        .map(|_| r.read_u32())
        .collect::<Result<Vec<_>, _>>()?;
    let created = (0..created_count)
        .map(|_| SimEntity::read_record(r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DeltaUpdate {
        tick,
        server_time_ms,
        sequence,
        base_sequence,
        world_offset,
        acks,
        changed,
        destroyed,
        created,
    })
}

fn min_payload_len(op: u8) -> Result<usize, CodecError> {
    let len = match op {
        opcode::HELLO => 8 + NAME_LEN,
        opcode::WELCOME => 1 + 4 + 4,
        opcode::INPUT => 4 + 8 + 1 + 4,
        opcode::STATE => STATE_HEADER_LEN,
        opcode::STATE_DELTA => DELTA_HEADER_LEN,
        opcode::STATE_ACK => 8 + 4,
        opcode::PING | opcode::PONG => 8,
        opcode::LEVEL_COMPLETE => 2,
        opcode::DISCONNECT => 8,
        other => return Err(CodecError::UnknownOpcode(other)),
    };
    Ok(len)
}
