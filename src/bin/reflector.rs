//! The reflector server binary. Requires at least two public IPv4
//! addresses on the host, so varied-source responses are possible.

use clap::Parser;

use natscope::{Reflector, DEFAULT_PORTS};

#[derive(Parser, Debug)]
#[command(name = "reflector", version, about = "Reflector server for NAT probing")]
struct Cli {
    /// UDP listener ports.
    #[arg(long = "port", value_name = "PORT", default_values_t = DEFAULT_PORTS)]
    port: Vec<u16>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let reflector = Reflector::bind_public(&cli.port).await?;
    reflector.run().await?;
    Ok(())
}
