mod config;
mod server;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::GameServer;
use skirmish::BroadcastMode;

#[derive(Parser)]
#[command(name = "skirmish-server")]
#[command(about = "Skirmish lobby and session server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = skirmish::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "TOML file with [lobby] and [session] tables")]
    config: Option<PathBuf>,

    #[arg(long, help = "First UDP port for game sessions (default: lobby port + 1)")]
    session_port: Option<u16>,

    #[arg(short, long)]
    tick_rate: Option<u16>,

    #[arg(long)]
    max_rooms: Option<usize>,

    #[arg(long)]
    slots: Option<u8>,

    #[arg(long)]
    min_players: Option<u8>,

    #[arg(long, help = "Countdown length in seconds")]
    countdown: Option<u8>,

    #[arg(long, help = "full or delta")]
    broadcast: Option<BroadcastMode>,

    #[arg(long, help = "Fixed seed for reproducible games")]
    seed: Option<u64>,

    #[arg(long, help = "Stop after this many seconds")]
    run_for: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(tick_rate) = self.tick_rate {
            config.lobby.tick_rate = tick_rate;
            config.session.tick_rate = u32::from(tick_rate);
        }
        if let Some(max_rooms) = self.max_rooms {
            config.lobby.max_rooms = max_rooms;
        }
        if let Some(slots) = self.slots {
            config.lobby.slots_per_room = slots;
        }
        if let Some(min_players) = self.min_players {
            config.lobby.min_players = min_players;
        }
        if let Some(countdown) = self.countdown {
            config.lobby.countdown_secs = countdown;
        }
        if let Some(mode) = self.broadcast {
            config.session.broadcast_mode = mode;
        }
        if let Some(seed) = self.seed {
            config.lobby.seed = Some(seed);
        }
        if let Some(port) = self.session_port {
            config.lobby.session_port_base = port;
        }
        if config.lobby.session_port_base == 0 {
            config.lobby.session_port_base = self.port.wrapping_add(1);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.lobby.validate()?;
    config.session.validate()?;

    log::info!(
        "Rooms: {} x {} slots, {} to start, {} Hz, {} broadcasts",
        config.lobby.max_rooms,
        config.lobby.slots_per_room,
        config.lobby.min_players,
        config.lobby.tick_rate,
        config.session.broadcast_mode
    );

    let mut server = GameServer::new(&args.bind, args.port, config)?;
    let deadline = args
        .run_for
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    server.run(deadline)?;

    Ok(())
}
