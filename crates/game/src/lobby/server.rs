use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::net::FramedStream;

use super::{ConnectionId, LobbyConfig, RoomManager, SessionHandoff};

/// Drives a [`RoomManager`] over non-blocking TCP.
pub struct LobbyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    peers: HashMap<ConnectionId, FramedStream>,
    next_conn: u64,
    manager: RoomManager,
    last_poll: Instant,
    running: Arc<AtomicBool>,
}

impl LobbyServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: LobbyConfig) -> io::Result<Self> {
        let manager = RoomManager::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            peers: HashMap::new(),
            next_conn: 1,
            manager,
            last_poll: Instant::now(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut RoomManager {
        &mut self.manager
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn drain_handoffs(&mut self) -> Vec<SessionHandoff> {
        self.manager.drain_handoffs().collect()
    }

    /// One pass of the poll loop: accept, read, advance countdowns, write.
    pub fn poll(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_poll).as_secs_f32();
        self.last_poll = now;

        self.accept_pending()?;

        let mut closed = Vec::new();
        for (&conn, peer) in self.peers.iter_mut() {
            match peer.fill() {
                Ok(true) => {}
                Ok(false) => {
                    log::info!("{:?} ({}) closed the connection", conn, peer.peer_addr());
                    closed.push(conn);
                }
                Err(e) => {
                    log::info!("{:?} ({}) dropped: {}", conn, peer.peer_addr(), e);
                    closed.push(conn);
                    continue;
                }
            }

            loop {
                match peer.next_frame() {
                    Ok(Some(frame)) => self.manager.handle_packet(conn, &frame),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("{:?} ({}) protocol violation: {}", conn, peer.peer_addr(), e);
                        closed.push(conn);
                        break;
                    }
                }
            }
        }

        for conn in closed {
            self.drop_peer(conn);
        }

        self.manager.update(dt);
        self.flush_outbound();

        Ok(())
    }

    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let peer = match FramedStream::new(stream) {
                        Ok(peer) => peer,
                        Err(e) => {
                            log::warn!("Failed to configure stream from {}: {}", addr, e);
                            continue;
                        }
                    };
                    let conn = ConnectionId(self.next_conn);
                    self.next_conn += 1;
                    self.peers.insert(conn, peer);
                    self.manager.connect(conn);
                    log::info!("{:?} connected from {}", conn, addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn drop_peer(&mut self, conn: ConnectionId) {
        if self.peers.remove(&conn).is_some() {
            self.manager.disconnect(conn);
        }
    }

    fn flush_outbound(&mut self) {
        for outbound in self.manager.drain_outbound() {
            if let Some(peer) = self.peers.get_mut(&outbound.conn) {
                peer.queue(&outbound.packet.encode());
            }
        }

        let mut failed = Vec::new();
        for (&conn, peer) in self.peers.iter_mut() {
            if let Err(e) = peer.flush() {
                log::info!("{:?} write failed: {}", conn, e);
                failed.push(conn);
            }
        }

        if failed.is_empty() {
            return;
        }
        for conn in failed {
            self.drop_peer(conn);
        }
        // Departure notices produced by the drops above.
        self.flush_outbound();
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
