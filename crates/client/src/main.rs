mod app;
mod bot;

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use app::{App, AppConfig};

#[derive(Parser)]
#[command(name = "skirmish-client")]
#[command(about = "Headless skirmish client driven by a scripted bot")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:27015", help = "Lobby address")]
    server: String,

    #[arg(short, long, default_value = "bot")]
    name: String,

    #[arg(short, long, help = "Room to join by name or id; created when no open room matches")]
    room: Option<String>,

    #[arg(long, default_value_t = 120, help = "Seconds to wait in the lobby")]
    lobby_timeout: u64,

    #[arg(long, help = "Leave the game after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 0, help = "Bot seed")]
    seed: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no address", addr))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = AppConfig {
        server: resolve(&args.server)?,
        name: args.name,
        room: args.room,
        lobby_timeout: Duration::from_secs(args.lobby_timeout),
        connect_timeout: Duration::from_secs(5),
        duration: args.duration.map(Duration::from_secs),
        seed: args.seed,
    };

    App::new(config).run()
}
