use std::{
    error::Error,
    io::{self, Write},
    time::Duration,
};

use clap::Parser;
use tether::{Client, ClientConfig, Framing, Input, PromptError, TransportError, prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8163")]
    address: String,
    /// Give up on a response after this many seconds
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
    /// Frame encoding spoken by the server
    #[arg(long, value_enum, default_value_t = Framing::Line)]
    framing: Framing,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig {
        address: cli.address,
        read_timeout: Some(Duration::from_secs(cli.timeout_secs)),
        framing: cli.framing,
        ..Default::default()
    };

    let mut client = Client::connect_with(&config)?;
    let codec = tether::Codec::new(config.framing);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let request = match prompt(stdin.lock(), stdout.lock(), &codec) {
            Ok(Input::Exit) => break,
            Ok(Input::Blank) => continue,
            Ok(Input::Send(request)) => request,
            Err(PromptError::Parse(e)) => {
                eprintln!("error: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match client.request(&request) {
            Ok(response) => {
                writeln!(stdout, "{response}")?;
            }
            Err(e) if e.is_recoverable() => eprintln!("error: {e}"),
            Err(TransportError::Closed) => {
                eprintln!("server closed the connection");
                return Ok(());
            }
            Err(e) => {
                eprintln!("connection failed: {e}");
                return Err(e.into());
            }
        }
    }

    if let Err(e) = client.close() {
        eprintln!("failed to close the connection cleanly: {e}");
    }
    Ok(())
}
