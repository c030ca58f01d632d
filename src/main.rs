//! natscope: probe and characterize the NAT in front of this host.

use std::time::Duration;

use anyhow::bail;
use clap::Parser;

use natscope::{analysis, display, probe, Options};

#[derive(Parser, Debug)]
#[command(name = "natscope", version, about = "Detect and characterize NAT devices")]
struct Cli {
    /// Reflector servers to probe against.
    #[arg(long = "server", value_name = "HOST", default_values_t = probe::DEFAULT_SERVERS.map(String::from))]
    server: Vec<String>,

    /// UDP ports to probe on every server.
    #[arg(long = "port", value_name = "PORT", default_values_t = probe::DEFAULT_PORTS)]
    port: Vec<u16>,

    /// DNS resolution timeout, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    resolve_timeout_ms: u64,

    /// NAT mapping probe duration, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    mapping_duration_ms: u64,

    /// Transmit interval for mapping probes, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 200)]
    mapping_interval_ms: u64,

    /// Number of mapping sockets to use.
    #[arg(long, default_value_t = 3)]
    mapping_sockets: usize,

    /// Firewall probe duration, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    firewall_duration_ms: u64,

    /// Transmit interval for firewall probes, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 50)]
    firewall_interval_ms: u64,

    /// Write the uninterpreted results to stdout.
    #[arg(long)]
    print_results: bool,

    /// Anonymize IP addresses in results.
    #[arg(long)]
    anonymize: bool,

    /// Skip the interpreted analysis.
    #[arg(long)]
    no_analysis: bool,

    /// Output format for results and analyses (text or json).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    format: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let json = match cli.format.as_str() {
        "text" => false,
        "json" => true,
        other => bail!("unknown --format value {other:?}"),
    };

    let opts = Options {
        servers: cli.server,
        ports: cli.port,
        resolve_timeout: Duration::from_millis(cli.resolve_timeout_ms),
        mapping_duration: Duration::from_millis(cli.mapping_duration_ms),
        mapping_interval: Duration::from_millis(cli.mapping_interval_ms),
        mapping_sockets: cli.mapping_sockets,
        firewall_duration: Duration::from_millis(cli.firewall_duration_ms),
        firewall_interval: Duration::from_millis(cli.firewall_interval_ms),
    };

    let mut result = probe::probe(&opts).await?;
    if cli.anonymize {
        result.anonymize();
    }

    if cli.print_results {
        if json {
            println!("{}", display::render_json(&result)?);
        } else {
            println!("{result}");
        }
    }

    if !cli.no_analysis {
        let analysis = analysis::analyze(&result);
        if json {
            println!("{}", display::render_json(&analysis)?);
        } else {
            println!("{analysis}");
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
