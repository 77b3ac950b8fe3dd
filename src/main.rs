use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use ferry::config::{parse_ports, Options};
use ferry::{DEFAULT_RELAY_ADDR, DEFAULT_RELAY_PORTS};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Send files between computers with a code phrase", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Relay host
    #[arg(long, global = true, env = "FERRY_RELAY", default_value = DEFAULT_RELAY_ADDR)]
    relay: String,

    /// Comma separated relay ports, tried in order
    #[arg(long, global = true, env = "FERRY_RELAY_PORTS")]
    relay_ports: Option<String>,

    /// Skip local network discovery and always use the relay
    #[arg(long, global = true)]
    no_local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files or folders
    Send {
        /// Files or folders to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Use this code phrase instead of a generated one
        #[arg(short, long)]
        code: Option<String>,
        /// Recreate the relative path of each file on the receiver
        #[arg(long)]
        keep_path: bool,
    },
    /// Receive files
    Receive {
        /// Code phrase from the sender (will prompt if not provided)
        phrase: Option<String>,
        /// Directory to save into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// Accept the offer without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Run as a relay server
    Relay {
        /// Interface to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Comma separated ports to listen on
        #[arg(short, long)]
        ports: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let relay_ports = match &cli.relay_ports {
        Some(list) => parse_ports(list)?,
        None => DEFAULT_RELAY_PORTS.to_vec(),
    };
    let options = Options {
        relay_address: cli.relay,
        relay_ports: relay_ports.clone(),
        disable_local: cli.no_local,
        ..Options::default()
    };

    match cli.command {
        Commands::Send { paths, code, keep_path } => {
            ferry::commands::send::run(options, paths, code, keep_path).await?;
        }
        Commands::Receive { phrase, out, yes } => {
            ferry::commands::receive::run(options, phrase, out, yes).await?;
        }
        Commands::Relay { host, ports } => {
            let ports = match ports {
                Some(list) => parse_ports(&list)?,
                None => relay_ports,
            };
            ferry::commands::relay::run(host, ports).await?;
        }
    }

    Ok(())
}
