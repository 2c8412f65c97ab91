mod connection;
mod endpoint;
mod protocol;
mod stats;
mod stream;

pub use connection::{AdmissionError, ConnectedPlayer, ConnectionManager, ExpectedPlayer};
pub use endpoint::NetworkEndpoint;
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, DeltaUpdate, EntityChange, InputAck, InputFlags, InputPacket,
    MAX_DATAGRAM_SIZE, SessionPacket, StateUpdate, opcode, sequence_greater_than,
};
pub use stats::{NetworkStats, RttEstimator};
pub use stream::FramedStream;
