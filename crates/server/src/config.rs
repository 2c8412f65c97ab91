use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use skirmish::{LobbyConfig, SessionConfig};

/// Everything the server binary can read from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub lobby: LobbyConfig,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.lobby.validate()?;
        config.session.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish::BroadcastMode;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.lobby.slots_per_room, LobbyConfig::default().slots_per_room);
        assert_eq!(config.session.broadcast_mode, BroadcastMode::Delta);
    }

    #[test]
    fn sections_override_defaults() {
        let config = ServerConfig::parse(
            r#"
            [lobby]
            max_rooms = 4
            countdown_secs = 5

            [session]
            broadcast_mode = "full"
            liveness_timeout_ms = 8000

            [session.movement]
            player_speed = 300.0
            "#,
        )
        .unwrap();

        assert_eq!(config.lobby.max_rooms, 4);
        assert_eq!(config.lobby.countdown_secs, 5);
        assert_eq!(config.session.broadcast_mode, BroadcastMode::Full);
        assert_eq!(config.session.liveness_timeout_ms, 8000);
        assert_eq!(config.session.movement.player_speed, 300.0);
        assert_eq!(config.session.tick_rate, 60);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let result = ServerConfig::parse(
            r#"
            [session]
            max_clients = 100
            "#,
        );
        assert!(result.is_err());
    }
}
