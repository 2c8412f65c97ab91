use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crate::net::{ExpectedPlayer, NetworkEndpoint};
use crate::simulation::Simulation;

use super::client::{ClientConfig, ClientEvent, SessionClient};
use super::server::SessionServer;
use super::{SessionConfig, SessionEvent};

/// A [`SessionServer`] bound to a UDP socket.
pub struct SessionHost<S: Simulation> {
    endpoint: NetworkEndpoint,
    server: SessionServer<S>,
    started: Instant,
    had_players: bool,
}

impl<S: Simulation> SessionHost<S> {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
        roster: Vec<ExpectedPlayer>,
        simulation: S,
    ) -> io::Result<Self> {
        let now = Instant::now();
        let server = SessionServer::new(config, roster, simulation, now)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let endpoint = NetworkEndpoint::bind(addr)?;

        Ok(Self {
            endpoint,
            server,
            started: now,
            had_players: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn server(&self) -> &SessionServer<S> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut SessionServer<S> {
        &mut self.server
    }

    pub fn endpoint(&self) -> &NetworkEndpoint {
        &self.endpoint
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.endpoint.running()
    }

    pub fn shutdown(&self) {
        self.endpoint.shutdown();
    }

    /// True once everyone who joined has left, or when nobody showed up
    /// within twice the liveness window.
    pub fn is_finished(&self, now: Instant) -> bool {
        if self.server.connections().connected_count() > 0 {
            return false;
        }
        self.had_players
            || now.saturating_duration_since(self.started) > self.server.config().liveness_timeout() * 2
    }

    /// One pass of the poll loop: read everything queued, run due ticks,
    /// send what the session produced.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        let received = datagrams_or_log(self.endpoint.receive(), self.endpoint.local_addr());
        for (data, addr) in received {
            self.server.handle_datagram(addr, &data, now);
        }
        self.server.update(now);
        self.flush();

        let events: Vec<SessionEvent> = self.server.drain_events().collect();
        if events
            .iter()
            .any(|event| matches!(event, SessionEvent::ClientConnected { .. }))
        {
            self.had_players = true;
        }
        events
    }

    fn flush(&mut self) {
        let outbound: Vec<_> = self.server.drain_outbound().collect();
        for (addr, packet) in outbound {
            if let Err(e) = self.endpoint.send_to(&packet, addr) {
                log::debug!("Send to {} failed: {}", addr, e);
            }
        }
    }

    /// Polls until shut down or finished, sleeping out the rest of each tick.
    pub fn run(&mut self) {
        let tick = self.server.config().tick_duration();
        log::info!("Session listening on {}", self.local_addr());

        while self.endpoint.is_running() {
            let frame_start = Instant::now();
            for event in self.poll(frame_start) {
                log::debug!("Session event: {:?}", event);
            }
            if self.is_finished(frame_start) {
                break;
            }

            let spent = frame_start.elapsed();
            if spent < tick {
                std::thread::sleep(tick - spent);
            }
        }

        self.server.shutdown();
        self.flush();
        log::info!("Session on {} ended at tick {}", self.local_addr(), self.server.tick());
    }
}

/// A failed read loses this pass's datagrams; the session keeps ticking.
fn datagrams_or_log(
    received: io::Result<Vec<(Vec<u8>, SocketAddr)>>,
    local: SocketAddr,
) -> Vec<(Vec<u8>, SocketAddr)> {
    received.unwrap_or_else(|e| {
        log::warn!("Receive on {} failed: {}", local, e);
        Vec::new()
    })
}

/// A [`SessionClient`] talking to one server over UDP.
pub struct SessionConnection {
    endpoint: NetworkEndpoint,
    client: SessionClient,
    server_addr: SocketAddr,
}

impl SessionConnection {
    pub fn connect(
        server_addr: SocketAddr,
        identity: u64,
        name: &str,
        config: ClientConfig,
    ) -> io::Result<Self> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = NetworkEndpoint::bind(bind_addr)?;
        endpoint.set_remote(server_addr);

        let mut connection = Self {
            endpoint,
            client: SessionClient::new(identity, name, config, Instant::now()),
            server_addr,
        };
        connection.flush()?;
        Ok(connection)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SessionClient {
        &mut self.client
    }

    pub fn endpoint(&self) -> &NetworkEndpoint {
        &self.endpoint
    }

    /// Drains every queued datagram, not just one, then advances the client.
    pub fn poll(&mut self, now: Instant) -> io::Result<Vec<ClientEvent>> {
        for (data, addr) in self.endpoint.receive()? {
            if addr != self.server_addr {
                log::debug!("Ignoring datagram from {}", addr);
                continue;
            }
            self.client.handle_datagram(&data, now);
        }
        self.client.update(now);
        self.flush()?;
        Ok(self.client.drain_events().collect())
    }

    pub fn disconnect(&mut self) -> io::Result<()> {
        self.client.disconnect();
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        let outbound: Vec<_> = self.client.drain_outbound().collect();
        for packet in outbound {
            self.endpoint.send(&packet)?;
        }
        Ok(())
    }

    /// Polls for up to `timeout`, returning true once connected.
    pub fn wait_connected(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.poll(Instant::now())?;
            if self.client.is_connected() {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(false)
    }
}
