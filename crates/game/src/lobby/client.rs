use std::io;
use std::net::SocketAddr;

use crate::net::FramedStream;

use super::protocol::LobbyPacket;

/// Client side of the reliable lobby connection.
pub struct LobbyConnection {
    stream: FramedStream,
    open: bool,
}

impl LobbyConnection {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        log::info!("Connecting to lobby at {}", addr);
        Ok(Self {
            stream: FramedStream::connect(addr)?,
            open: true,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn send(&mut self, packet: &LobbyPacket) -> io::Result<()> {
        self.stream.queue(&packet.encode());
        self.stream.flush()
    }

    /// Returns every packet that has fully arrived. Undecodable frames are skipped.
    pub fn poll(&mut self) -> io::Result<Vec<LobbyPacket>> {
        if !self.open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "lobby connection closed",
            ));
        }

        self.stream.flush()?;
        if !self.stream.fill()? {
            self.open = false;
        }

        let mut packets = Vec::new();
        loop {
            match self.stream.next_frame() {
                Ok(Some(frame)) => match LobbyPacket::decode(&frame) {
                    Ok(packet) => packets.push(packet),
                    Err(e) => log::debug!("Dropping malformed lobby packet: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    self.open = false;
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }

        Ok(packets)
    }
}
