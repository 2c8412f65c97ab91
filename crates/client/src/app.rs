use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};

use skirmish::lobby::{RoomId, RoomRecord};
use skirmish::{
    ClientConfig, ClientEvent, JoinStatus, LobbyConnection, LobbyPacket, MovementConfig,
    SessionConnection,
};

use crate::bot::Bot;

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

pub struct AppConfig {
    pub server: SocketAddr,
    pub name: String,
    pub room: Option<String>,
    pub lobby_timeout: Duration,
    pub connect_timeout: Duration,
    pub duration: Option<Duration>,
    pub seed: u64,
}

/// What the lobby hands over once a game starts.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub room_id: RoomId,
    pub identity: u64,
    pub slot: u8,
    pub seed: u32,
    pub session_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LobbyStep {
    Listing,
    Creating,
    Joining(RoomId),
    Identifying(RoomId),
    Waiting(RoomId),
}

pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn run(&self) -> Result<()> {
        let mut lobby = LobbyConnection::connect(self.config.server)
            .with_context(|| format!("connecting to lobby at {}", self.config.server))?;
        let ticket = self.run_lobby(&mut lobby)?;
        log::info!(
            "Game starting in room {} as slot {} (session {})",
            ticket.room_id,
            ticket.slot,
            ticket.session_addr
        );

        let result = self.run_session(&ticket);

        if lobby.is_open() {
            if let Err(e) = lobby.send(&LobbyPacket::Disconnect) {
                log::debug!("Could not say goodbye to the lobby: {}", e);
            }
        }
        result
    }

    fn run_lobby(&self, lobby: &mut LobbyConnection) -> Result<Ticket> {
        lobby.send(&LobbyPacket::ListRoomsReq)?;
        let mut step = LobbyStep::Listing;
        let mut identity = None;
        let deadline = Instant::now() + self.config.lobby_timeout;

        loop {
            if Instant::now() >= deadline {
                bail!("no game started within {:?}", self.config.lobby_timeout);
            }
            if !lobby.is_open() {
                bail!("lobby closed the connection");
            }

            for packet in lobby.poll()? {
                match packet {
                    LobbyPacket::ListRoomsAck { rooms } if step == LobbyStep::Listing => {
                        log::info!("{} room(s) listed", rooms.len());
                        match self.pick_room(&rooms) {
                            Some(room) => {
                                lobby.send(&LobbyPacket::JoinRoomReq { room_id: room.id })?;
                                step = LobbyStep::Joining(room.id);
                            }
                            None => {
                                let name = self
                                    .config
                                    .room
                                    .clone()
                                    .unwrap_or_else(|| format!("{}'s room", self.config.name));
                                lobby.send(&LobbyPacket::CreateRoomReq { name })?;
                                step = LobbyStep::Creating;
                            }
                        }
                    }
                    LobbyPacket::CreateRoomAck { room } if step == LobbyStep::Creating => {
                        log::info!("Created room {} '{}'", room.id, room.name);
                        lobby.send(&LobbyPacket::JoinRoomReq { room_id: room.id })?;
                        step = LobbyStep::Joining(room.id);
                    }
                    LobbyPacket::JoinRoomAck { status, room_id, slot } => {
                        let LobbyStep::Joining(requested) = step else {
                            continue;
                        };
                        if requested != room_id {
                            log::warn!("Asked for room {} but got room {}", requested, room_id);
                        }
                        if status != JoinStatus::Success {
                            bail!("joining room {} failed: {:?}", room_id, status);
                        }
                        log::info!("Joined room {} in slot {}", room_id, slot);
                        lobby.send(&LobbyPacket::ConnectReq {
                            name: self.config.name.clone(),
                        })?;
                        step = LobbyStep::Identifying(room_id);
                    }
                    LobbyPacket::ConnectAck { slot, identity: id } => {
                        let LobbyStep::Identifying(room_id) = step else {
                            continue;
                        };
                        log::debug!("Identity {:#x} for slot {}", id, slot);
                        identity = Some((id, slot));
                        lobby.send(&LobbyPacket::ReadyReq)?;
                        step = LobbyStep::Waiting(room_id);
                    }
                    LobbyPacket::PlayerJoin { slot, name, ready, .. } => {
                        log::info!("Slot {}: {} (ready: {})", slot, name, ready);
                    }
                    LobbyPacket::PlayerReady { slot, ready } => {
                        log::info!("Slot {} ready: {}", slot, ready);
                    }
                    LobbyPacket::PlayerLeft { slot } => {
                        log::info!("Slot {} left", slot);
                    }
                    LobbyPacket::Countdown { seconds } => {
                        if seconds == 0 {
                            log::info!("Countdown cancelled");
                        } else {
                            log::info!("Starting in {}...", seconds);
                        }
                    }
                    LobbyPacket::GameStart {
                        seed,
                        tick_rate,
                        session_port,
                    } => {
                        let LobbyStep::Waiting(room_id) = step else {
                            continue;
                        };
                        let (identity, slot) =
                            identity.ok_or_else(|| anyhow!("game started before identify"))?;
                        if session_port == 0 {
                            bail!("server did not announce a session port");
                        }
                        log::info!("Game start: seed {}, {} Hz", seed, tick_rate);
                        return Ok(Ticket {
                            room_id,
                            identity,
                            slot,
                            seed,
                            session_addr: SocketAddr::new(self.config.server.ip(), session_port),
                        });
                    }
                    LobbyPacket::Error { code, message } => {
                        log::warn!("Lobby error {:?}: {}", code, message);
                        if step == LobbyStep::Creating {
                            bail!("could not create a room: {}", message);
                        }
                    }
                    other => log::debug!("Ignoring lobby packet {:?}", other),
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// The requested room (by name or numeric id) when given, otherwise any open one.
    fn pick_room<'a>(&self, rooms: &'a [RoomRecord]) -> Option<&'a RoomRecord> {
        let open = |room: &&RoomRecord| !room.in_game && room.player_count < room.max_players;
        match &self.config.room {
            Some(wanted) => {
                let id = wanted.parse::<RoomId>().ok();
                rooms
                    .iter()
                    .filter(open)
                    .find(|room| &room.name == wanted || Some(room.id) == id)
            }
            None => rooms.iter().find(open),
        }
    }

    fn run_session(&self, ticket: &Ticket) -> Result<()> {
        let mut connection = SessionConnection::connect(
            ticket.session_addr,
            ticket.identity,
            &self.config.name,
            ClientConfig::default(),
        )
        .context("opening session socket")?;

        if !connection.wait_connected(self.config.connect_timeout)? {
            bail!("session at {} did not answer", ticket.session_addr);
        }

        let start = Instant::now();
        let mut bot = Bot::new(
            self.config.seed ^ u64::from(ticket.seed),
            &MovementConfig::default(),
            start,
        );
        let mut next_status = start + STATUS_INTERVAL;

        loop {
            let now = Instant::now();
            if self
                .config
                .duration
                .is_some_and(|limit| now.duration_since(start) >= limit)
            {
                log::info!("Play time over");
                break;
            }

            let mut finished = false;
            for event in connection.poll(now)? {
                match event {
                    ClientEvent::Connected { entity_id, players, .. } => {
                        log::info!("Controlling entity {} with {} players", entity_id, players);
                    }
                    ClientEvent::LevelComplete(transition) => {
                        if transition.next == 0 {
                            log::info!("Final level {} complete", transition.completed);
                            finished = true;
                        } else {
                            log::info!(
                                "Level {} complete, next {}",
                                transition.completed,
                                transition.next
                            );
                        }
                    }
                    ClientEvent::ResyncRequested { base_sequence } => {
                        log::debug!("Resync requested, missing baseline {}", base_sequence);
                    }
                    ClientEvent::Disconnected { reason } => {
                        log::info!("Session ended: {}", reason.as_str());
                        return Ok(());
                    }
                    ClientEvent::StateApplied { .. } => {}
                }
            }
            if finished {
                break;
            }

            let client = connection.client_mut();
            let position = client.own_entity().map(|_| client.predicted_position());
            let buttons = bot.buttons(position, now);
            client.set_buttons(buttons);

            if now >= next_status {
                next_status = now + STATUS_INTERVAL;
                let client = connection.client();
                let stats = client.stats();
                log::info!(
                    "seq {} input {} rtt {:.1}ms rx {} tx {} dropped {}",
                    client.last_sequence(),
                    client.input_sequence(),
                    client.rtt().srtt(),
                    stats.packets_received,
                    stats.packets_sent,
                    stats.packets_dropped
                );
            }

            thread::sleep(POLL_INTERVAL);
        }

        connection.disconnect()?;
        Ok(())
    }
}
