use std::{error::Error, net::SocketAddr, time::Duration};

use clap::Parser;
use log::info;
use tether::{Framing, ParameterStore, Server, ServerConfig, config::DEFAULT_POOL_SIZE};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(long, default_value = "127.0.0.1:8163")]
    address: SocketAddr,
    /// Number of connections served at once
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE)]
    pool_size: usize,
    /// Disconnect clients idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
    /// Frame encoding spoken by clients
    #[arg(long, value_enum, default_value_t = Framing::Line)]
    framing: Framing,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        address: cli.address,
        pool_size: cli.pool_size,
        idle_timeout: cli.idle_timeout_secs.map(Duration::from_secs),
        framing: cli.framing,
        ..Default::default()
    };

    let store = ParameterStore::new();
    let server = Server::listen(config)?.on_request(move |origin| {
        info!("new session {origin}");
        Box::new(store.clone())
    });

    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        stop.stop();
    })?;

    server.run()?;
    Ok(())
}
