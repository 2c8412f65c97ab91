//! Authoritative session over unreliable datagrams.

mod client;
mod delta;
mod host;
mod prediction;
mod server;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, check_range};
use crate::simulation::{LevelTransition, MovementConfig};
use crate::snapshot::{DEFAULT_HISTORY_LEN, MAX_ACK_CLIENTS, SyncId};

pub use client::{ClientConfig, ClientEvent, ClientState, SessionClient};
pub use delta::{DeltaBody, DeltaError, apply_delta, apply_full, build_delta};
pub use host::{SessionConnection, SessionHost};
pub use prediction::ClientPrediction;
pub use server::SessionServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    Full,
    #[default]
    Delta,
}

impl FromStr for BroadcastMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "delta" => Ok(Self::Delta),
            other => Err(format!("unknown broadcast mode '{}'", other)),
        }
    }
}

impl fmt::Display for BroadcastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Delta => "delta",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub liveness_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub broadcast_mode: BroadcastMode,
    pub history_len: usize,
    /// How long LEVEL_COMPLETE keeps being repeated.
    pub level_notice_ms: u64,
    pub seed: Option<u64>,
    pub movement: MovementConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_clients: 16,
            liveness_timeout_ms: 5000,
            ping_interval_ms: 1000,
            broadcast_mode: BroadcastMode::Delta,
            history_len: DEFAULT_HISTORY_LEN,
            level_notice_ms: 1000,
            seed: None,
            movement: MovementConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("tick_rate", self.tick_rate as u64, 1, 1000)?;
        check_range("max_clients", self.max_clients as u64, 1, MAX_ACK_CLIENTS as u64)?;
        check_range("history_len", self.history_len as u64, 2, 1024)?;
        check_range("liveness_timeout_ms", self.liveness_timeout_ms, 100, 600_000)?;
        check_range("ping_interval_ms", self.ping_interval_ms, 10, 600_000)?;
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ClientConnected {
        identity: u64,
        slot: u8,
        addr: SocketAddr,
        entity_id: SyncId,
    },
    ClientDisconnected {
        identity: u64,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    LevelComplete(LevelTransition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    /// Another rostered identity took over the player's address.
    Superseded,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Superseded => "replaced at its address",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cap_matches_ack_width() {
        let mut config = SessionConfig::default();
        assert!(config.validate().is_ok());

        config.max_clients = MAX_ACK_CLIENTS;
        assert!(config.validate().is_ok());

        config.max_clients = MAX_ACK_CLIENTS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge {
                field: "max_clients",
                ..
            })
        ));
    }

    #[test]
    fn broadcast_mode_parses() {
        assert_eq!("FULL".parse::<BroadcastMode>(), Ok(BroadcastMode::Full));
        assert_eq!("delta".parse::<BroadcastMode>(), Ok(BroadcastMode::Delta));
        assert!("zip".parse::<BroadcastMode>().is_err());
    }
}
