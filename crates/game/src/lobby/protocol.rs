use crate::codec::{ByteReader, ByteWriter, CodecError, NAME_LEN, ensure_min_len};

pub type RoomId = u32;

pub const ERROR_TEXT_LEN: usize = 64;

pub mod opcode {
    pub const LIST_ROOMS_REQ: u8 = 0x01;
    pub const LIST_ROOMS_ACK: u8 = 0x02;
    pub const CREATE_ROOM_REQ: u8 = 0x03;
    pub const CREATE_ROOM_ACK: u8 = 0x04;
    pub const JOIN_ROOM_REQ: u8 = 0x05;
    pub const JOIN_ROOM_ACK: u8 = 0x06;
    pub const CONNECT_REQ: u8 = 0x07;
    pub const CONNECT_ACK: u8 = 0x08;
    pub const PLAYER_JOIN: u8 = 0x09;
    pub const READY_REQ: u8 = 0x0A;
    pub const PLAYER_READY: u8 = 0x0B;
    pub const START_REQ: u8 = 0x0C;
    pub const GAME_START: u8 = 0x0D;
    pub const DISCONNECT: u8 = 0x0E;
    pub const PLAYER_LEFT: u8 = 0x0F;
    pub const COUNTDOWN: u8 = 0x10;
    pub const ERROR_MSG: u8 = 0x11;
}

const ROOM_RECORD_LEN: usize = 4 + NAME_LEN + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinStatus {
    Success = 0,
    RoomFull = 1,
    RoomNotFound = 2,
    RoomInGame = 3,
}

impl TryFrom<u8> for JoinStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::RoomFull),
            2 => Ok(Self::RoomNotFound),
            3 => Ok(Self::RoomInGame),
            _ => Err(CodecError::InvalidTag {
                what: "join status",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LobbyErrorCode {
    RoomLimit = 1,
    NotInRoom = 2,
    NotIdentified = 3,
    CannotStart = 4,
    Malformed = 5,
}

impl TryFrom<u8> for LobbyErrorCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RoomLimit),
            2 => Ok(Self::NotInRoom),
            3 => Ok(Self::NotIdentified),
            4 => Ok(Self::CannotStart),
            5 => Ok(Self::Malformed),
            _ => Err(CodecError::InvalidTag {
                what: "lobby error",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub player_count: u8,
    pub max_players: u8,
    pub in_game: bool,
}

impl RoomRecord {
    fn write(&self, w: &mut ByteWriter) {
        w.write_u32(self.id);
        w.write_fixed_str(&self.name, NAME_LEN);
        w.write_u8(self.player_count);
        w.write_u8(self.max_players);
        w.write_bool(self.in_game);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: r.read_u32()?,
            name: r.read_fixed_str(NAME_LEN)?,
            player_count: r.read_u8()?,
            max_players: r.read_u8()?,
            in_game: r.read_bool()?,
        })
    }
}

/// Every packet exchanged with the room manager, both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyPacket {
    ListRoomsReq,
    ListRoomsAck {
        rooms: Vec<RoomRecord>,
    },
    CreateRoomReq {
        name: String,
    },
    CreateRoomAck {
        room: RoomRecord,
    },
    JoinRoomReq {
        room_id: RoomId,
    },
    JoinRoomAck {
        status: JoinStatus,
        room_id: RoomId,
        slot: u8,
    },
    ConnectReq {
        name: String,
    },
    ConnectAck {
        slot: u8,
        identity: u64,
    },
    PlayerJoin {
        slot: u8,
        identity: u64,
        name: String,
        ready: bool,
    },
    ReadyReq,
    PlayerReady {
        slot: u8,
        ready: bool,
    },
    StartReq,
    GameStart {
        seed: u32,
        tick_rate: u16,
        session_port: u16,
    },
    Disconnect,
    PlayerLeft {
        slot: u8,
    },
    Countdown {
        seconds: u8,
    },
    Error {
        code: LobbyErrorCode,
        message: String,
    },
}

impl LobbyPacket {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::ListRoomsReq => opcode::LIST_ROOMS_REQ,
            Self::ListRoomsAck { .. } => opcode::LIST_ROOMS_ACK,
            Self::CreateRoomReq { .. } => opcode::CREATE_ROOM_REQ,
            Self::CreateRoomAck { .. } => opcode::CREATE_ROOM_ACK,
            Self::JoinRoomReq { .. } => opcode::JOIN_ROOM_REQ,
            Self::JoinRoomAck { .. } => opcode::JOIN_ROOM_ACK,
            Self::ConnectReq { .. } => opcode::CONNECT_REQ,
            Self::ConnectAck { .. } => opcode::CONNECT_ACK,
            Self::PlayerJoin { .. } => opcode::PLAYER_JOIN,
            Self::ReadyReq => opcode::READY_REQ,
            Self::PlayerReady { .. } => opcode::PLAYER_READY,
            Self::StartReq => opcode::START_REQ,
            Self::GameStart { .. } => opcode::GAME_START,
            Self::Disconnect => opcode::DISCONNECT,
            Self::PlayerLeft { .. } => opcode::PLAYER_LEFT,
            Self::Countdown { .. } => opcode::COUNTDOWN,
            Self::Error { .. } => opcode::ERROR_MSG,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(64);
        w.write_u8(self.opcode());

        match self {
            Self::ListRoomsReq | Self::ReadyReq | Self::StartReq | Self::Disconnect => {}
            Self::ListRoomsAck { rooms } => {
                let count = rooms.len().min(u8::MAX as usize);
                w.write_u8(count as u8);
                for room in &rooms[..count] {
                    room.write(&mut w);
                }
            }
            Self::CreateRoomReq { name } | Self::ConnectReq { name } => {
                w.write_fixed_str(name, NAME_LEN);
            }
            Self::CreateRoomAck { room } => room.write(&mut w),
            Self::JoinRoomReq { room_id } => w.write_u32(*room_id),
            Self::JoinRoomAck {
                status,
                room_id,
                slot,
            } => {
                w.write_u8(*status as u8);
                w.write_u32(*room_id);
                w.write_u8(*slot);
            }
            Self::ConnectAck { slot, identity } => {
                w.write_u8(*slot);
                w.write_u64(*identity);
            }
            Self::PlayerJoin {
                slot,
                identity,
                name,
                ready,
            } => {
                w.write_u8(*slot);
                w.write_u64(*identity);
                w.write_fixed_str(name, NAME_LEN);
                w.write_bool(*ready);
            }
            Self::PlayerReady { slot, ready } => {
                w.write_u8(*slot);
                w.write_bool(*ready);
            }
            Self::GameStart {
                seed,
                tick_rate,
                session_port,
            } => {
                w.write_u32(*seed);
                w.write_u16(*tick_rate);
                w.write_u16(*session_port);
            }
            Self::PlayerLeft { slot } => w.write_u8(*slot),
            Self::Countdown { seconds } => w.write_u8(*seconds),
            Self::Error { code, message } => {
                w.write_u8(*code as u8);
                w.write_fixed_str(message, ERROR_TEXT_LEN);
            }
        }

        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure_min_len(data, 1)?;
        let op = data[0];
        ensure_min_len(data, 1 + min_payload_len(op)?)?;

        let mut r = ByteReader::new(&data[1..]);
        let packet = match op {
            opcode::LIST_ROOMS_REQ => Self::ListRoomsReq,
            opcode::LIST_ROOMS_ACK => {
                let count = r.read_u8()? as usize;
                ensure_min_len(data, 2 + count * ROOM_RECORD_LEN)?;
                let rooms = (0..count)
                    .map(|_| RoomRecord::read(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::ListRoomsAck { rooms }
            }
            opcode::CREATE_ROOM_REQ => Self::CreateRoomReq {
                name: r.read_fixed_str(NAME_LEN)?,
            },
            opcode::CREATE_ROOM_ACK => Self::CreateRoomAck {
                room: RoomRecord::read(&mut r)?,
            },
            opcode::JOIN_ROOM_REQ => Self::JoinRoomReq {
                room_id: r.read_u32()?,
            },
            opcode::JOIN_ROOM_ACK => Self::JoinRoomAck {
                status: JoinStatus::try_from(r.read_u8()?)?,
                room_id: r.read_u32()?,
                slot: r.read_u8()?,
            },
            opcode::CONNECT_REQ => Self::ConnectReq {
                name: r.read_fixed_str(NAME_LEN)?,
            },
            opcode::CONNECT_ACK => Self::ConnectAck {
                slot: r.read_u8()?,
                identity: r.read_u64()?,
            },
            opcode::PLAYER_JOIN => Self::PlayerJoin {
                slot: r.read_u8()?,
                identity: r.read_u64()?,
                name: r.read_fixed_str(NAME_LEN)?,
                ready: r.read_bool()?,
            },
            opcode::READY_REQ => Self::ReadyReq,
            opcode::PLAYER_READY => Self::PlayerReady {
                slot: r.read_u8()?,
                ready: r.read_bool()?,
            },
            opcode::START_REQ => Self::StartReq,
            opcode::GAME_START => Self::GameStart {
                seed: r.read_u32()?,
                tick_rate: r.read_u16()?,
                session_port: r.read_u16()?,
            },
            opcode::DISCONNECT => Self::Disconnect,
            opcode::PLAYER_LEFT => Self::PlayerLeft { slot: r.read_u8()? },
            opcode::COUNTDOWN => Self::Countdown {
                seconds: r.read_u8()?,
            },
            opcode::ERROR_MSG => Self::Error {
                code: LobbyErrorCode::try_from(r.read_u8()?)?,
                message: r.read_fixed_str(ERROR_TEXT_LEN)?,
            },
            other => return Err(CodecError::UnknownOpcode(other)),
        };

        Ok(packet)
    }
}

fn min_payload_len(op: u8) -> Result<usize, CodecError> {
    let len = match op {
        opcode::LIST_ROOMS_REQ | opcode::READY_REQ | opcode::START_REQ | opcode::DISCONNECT => 0,
        opcode::LIST_ROOMS_ACK => 1,
        opcode::CREATE_ROOM_REQ | opcode::CONNECT_REQ => NAME_LEN,
        opcode::CREATE_ROOM_ACK => ROOM_RECORD_LEN,
        opcode::JOIN_ROOM_REQ => 4,
        opcode::JOIN_ROOM_ACK => 6,
        opcode::CONNECT_ACK => 9,
        opcode::PLAYER_JOIN => 1 + 8 + NAME_LEN + 1,
        opcode::PLAYER_READY => 2,
        opcode::GAME_START => 8,
        opcode::PLAYER_LEFT | opcode::COUNTDOWN => 1,
        opcode::ERROR_MSG => 1 + ERROR_TEXT_LEN,
        other => return Err(CodecError::UnknownOpcode(other)),
    };
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_list_layout() {
        let packet = LobbyPacket::ListRoomsAck {
            rooms: vec![RoomRecord {
                id: 7,
                name: "alpha".into(),
                player_count: 1,
                max_players: 4,
                in_game: false,
            }],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 2 + ROOM_RECORD_LEN);
        assert_eq!(bytes[0], opcode::LIST_ROOMS_ACK);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..6], &7u32.to_le_bytes());
        assert_eq!(LobbyPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn game_start_layout() {
        let bytes = LobbyPacket::GameStart {
            seed: 0xDEAD_BEEF,
            tick_rate: 60,
            session_port: 27100,
        }
        .encode();
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[1..5], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[5..7], &60u16.to_le_bytes());
    }

    #[test]
    fn undersized_packets_are_rejected() {
        assert!(matches!(
            LobbyPacket::decode(&[opcode::JOIN_ROOM_REQ, 1, 2]),
            Err(CodecError::TooShort { .. })
        ));
        assert!(matches!(
            LobbyPacket::decode(&[opcode::LIST_ROOMS_ACK, 2, 0, 0]),
            Err(CodecError::TooShort { .. })
        ));
        assert_eq!(LobbyPacket::decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn unknown_opcode_and_bad_status() {
        assert_eq!(
            LobbyPacket::decode(&[0x7F]),
            Err(CodecError::UnknownOpcode(0x7F))
        );
        assert!(matches!(
            LobbyPacket::decode(&[opcode::JOIN_ROOM_ACK, 9, 0, 0, 0, 0, 0]),
            Err(CodecError::InvalidTag { .. })
        ));
    }

    #[test]
    fn join_ack_statuses_decode() {
        for status in [
            JoinStatus::Success,
            JoinStatus::RoomFull,
            JoinStatus::RoomNotFound,
            JoinStatus::RoomInGame,
        ] {
            let packet = LobbyPacket::JoinRoomAck {
                status,
                room_id: 3,
                slot: 0,
            };
            assert_eq!(LobbyPacket::decode(&packet.encode()).unwrap(), packet);
        }
    }
}
