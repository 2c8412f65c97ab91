use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use skirmish::lobby::RoomId;
use skirmish::{ArenaSimulation, LobbyServer, SessionConfig, SessionHandoff, SessionHost};

use crate::config::ServerConfig;

const LOBBY_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct RunningSession {
    room_id: RoomId,
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Lobby on TCP plus one session thread per started room.
pub struct GameServer {
    lobby: LobbyServer,
    bind_host: String,
    session_config: SessionConfig,
    sessions: Vec<RunningSession>,
    finished_tx: Sender<RoomId>,
    finished_rx: Receiver<RoomId>,
}

impl GameServer {
    pub fn new(bind_host: &str, lobby_port: u16, config: ServerConfig) -> Result<Self> {
        let lobby = LobbyServer::bind((bind_host, lobby_port), config.lobby)
            .with_context(|| format!("binding lobby on {}:{}", bind_host, lobby_port))?;
        let (finished_tx, finished_rx) = mpsc::channel();

        Ok(Self {
            lobby,
            bind_host: bind_host.to_string(),
            session_config: config.session,
            sessions: Vec::new(),
            finished_tx,
            finished_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.lobby.local_addr()
    }

    pub fn run(&mut self, deadline: Option<Instant>) -> Result<()> {
        log::info!("Lobby listening on {}", self.local_addr());

        while self.lobby.is_running() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::info!("Run time elapsed");
                break;
            }
            self.poll_once()?;
            thread::sleep(LOBBY_POLL_INTERVAL);
        }

        self.shutdown();
        Ok(())
    }

    pub fn poll_once(&mut self) -> Result<()> {
        self.lobby.poll().context("lobby poll failed")?;

        for handoff in self.lobby.drain_handoffs() {
            if let Err(e) = self.start_session(&handoff) {
                log::error!("Room {} could not start its session: {:#}", handoff.room_id, e);
                self.lobby.manager_mut().finish_game(handoff.room_id);
            }
        }

        let finished: Vec<RoomId> = self.finished_rx.try_iter().collect();
        for room_id in finished {
            self.reap(room_id);
            self.lobby.manager_mut().finish_game(room_id);
        }
        Ok(())
    }

    fn start_session(&mut self, handoff: &SessionHandoff) -> Result<()> {
        let config = SessionConfig {
            tick_rate: u32::from(handoff.tick_rate),
            seed: Some(u64::from(handoff.seed)),
            ..self.session_config.clone()
        };
        let simulation = ArenaSimulation::new(config.movement.clone(), u64::from(handoff.seed));
        let mut host = SessionHost::bind(
            (self.bind_host.as_str(), handoff.session_port),
            config,
            handoff.roster.clone(),
            simulation,
        )
        .with_context(|| format!("binding session port {}", handoff.session_port))?;

        let room_id = handoff.room_id;
        let addr = host.local_addr();
        let running = host.running();
        let finished = self.finished_tx.clone();

        let handle = thread::Builder::new()
            .name(format!("session-{}", room_id))
            .spawn(move || {
                host.run();
                report_finished(&finished, room_id);
            })
            .context("spawning session thread")?;

        log::info!(
            "Room {} handed to session on {} ({} players)",
            room_id,
            addr,
            handoff.roster.len()
        );
        self.sessions.push(RunningSession {
            room_id,
            addr,
            running,
            handle,
        });
        Ok(())
    }

    fn reap(&mut self, room_id: RoomId) {
        let Some(index) = self.sessions.iter().position(|s| s.room_id == room_id) else {
            return;
        };
        let session = self.sessions.swap_remove(index);
        if session.handle.join().is_err() {
            log::error!("Session thread for room {} panicked", room_id);
        }
        log::info!("Session on {} for room {} finished", session.addr, room_id);
    }

    pub fn shutdown(&mut self) {
        self.lobby.shutdown();
        for session in &self.sessions {
            session.running.store(false, Ordering::SeqCst);
        }
        for session in self.sessions.drain(..) {
            if session.handle.join().is_err() {
                log::error!("Session thread for room {} panicked", session.room_id);
            }
        }
        log::info!("Server stopped");
    }
}

fn report_finished(finished: &Sender<RoomId>, room_id: RoomId) {
    if finished.send(room_id).is_err() {
        log::debug!("Room {} finished after the server stopped", room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_rooms_reach_the_lobby_loop() {
        let (tx, rx) = mpsc::channel();
        report_finished(&tx, 4);
        report_finished(&tx, 9);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![4, 9]);

        drop(rx);
        report_finished(&tx, 5);
    }

    #[test]
    fn lobby_starts_with_no_sessions() {
        let mut server = GameServer::new("127.0.0.1", 0, ServerConfig::default()).unwrap();
        server.poll_once().unwrap();
        assert!(server.sessions.is_empty());
        server.shutdown();
    }
}
