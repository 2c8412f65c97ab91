use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::protocol::{MAX_DATAGRAM_SIZE, SessionPacket};
use super::stats::NetworkStats;

/// Non-blocking UDP socket carrying session packets.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    stats: NetworkStats,
    recv_buffer: Box<[u8; MAX_DATAGRAM_SIZE]>,
    running: Arc<AtomicBool>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            stats: NetworkStats::default(),
            recv_buffer: Box::new([0u8; MAX_DATAGRAM_SIZE]),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn send_bytes_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte datagram exceeds {}", data.len(), MAX_DATAGRAM_SIZE),
            ));
        }

        // A full send buffer counts as loss; the protocol tolerates it.
        let sent = match self.socket.send_to(data, addr) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.record_dropped();
                return Ok(0);
            }
            result => result?,
        };
        self.stats.record_sent(sent);
        Ok(sent)
    }

    pub fn send_to(&mut self, packet: &SessionPacket, addr: SocketAddr) -> io::Result<usize> {
        self.send_bytes_to(&packet.encode(), addr)
    }

    pub fn send(&mut self, packet: &SessionPacket) -> io::Result<usize> {
        match self.remote_addr {
            Some(addr) => self.send_to(packet, addr),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "endpoint has no session peer",
            )),
        }
    }

    /// Every datagram currently queued on the socket. Empty datagrams are
    /// discarded; decoding is left to the caller.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            let (size, from) = match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(datagrams),
                // ICMP port unreachable from a departed peer surfaces here on some platforms.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };
            if size == 0 {
                continue;
            }
            self.stats.record_received(size);
            datagrams.push((self.recv_buffer[..size].to_vec(), from));
        }
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
