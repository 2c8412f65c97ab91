use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

use crate::codec::{FrameDecoder, FrameError, encode_frame};

const READ_CHUNK: usize = 4096;

/// Non-blocking TCP stream carrying length-prefixed frames.
#[derive(Debug)]
pub struct FramedStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
    decoder: FrameDecoder,
    write_buf: Vec<u8>,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            stream,
            peer_addr,
            decoder: FrameDecoder::new(),
            write_buf: Vec::new(),
        })
    }

    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Pulls every byte currently available into the frame decoder.
    /// Returns `Ok(false)` once the peer has closed the stream.
    pub fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.decoder.push(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        self.decoder.next_frame()
    }

    pub fn queue(&mut self, payload: &[u8]) {
        self.write_buf.extend_from_slice(&encode_frame(payload));
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Writes as much of the queued data as the socket accepts right now.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
