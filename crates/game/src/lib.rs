pub mod codec;
pub mod error;
pub mod lobby;
pub mod net;
pub mod session;
pub mod simulation;
pub mod snapshot;
pub mod world;

pub use codec::{ByteReader, ByteWriter, CodecError, FrameDecoder, FrameError, MAX_FRAME_SIZE};
pub use error::ConfigError;
pub use lobby::{
    ConnectionId, JoinStatus, LobbyConfig, LobbyConnection, LobbyPacket, LobbyServer, RoomId,
    RoomManager, RoomState, SessionHandoff,
};
pub use net::{
    ConnectionManager, DEFAULT_PORT, DEFAULT_TICK_RATE, ExpectedPlayer, InputFlags,
    NetworkEndpoint, NetworkStats, SessionPacket,
};
pub use session::{
    BroadcastMode, ClientConfig, ClientEvent, ClientState, DisconnectReason, SessionClient,
    SessionConfig, SessionConnection, SessionEvent, SessionHost, SessionServer,
};
pub use simulation::{ArenaSimulation, FixedTimestep, MovementConfig, Simulation};
pub use snapshot::{
    ComponentRecord, ComponentSink, ComponentSource, EntityType, Patch, PatchOp, SimEntity,
    Snapshot, SnapshotHistory, SyncId, diff,
};
pub use world::{EntityKey, World};
