mod commands;
mod config;
mod error;
mod export;
mod orchestrator;
mod prompt;
mod records;
mod ui;

use std::net::IpAddr;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::CreateArgs;
use crate::config::MoatConfig;
use crate::prompt::Console;

/// Provision an instance and reach it through a private WireGuard tunnel.
#[derive(Parser, Debug)]
#[command(name = "moat", version, args_conflicts_with_subcommands = true)]
struct Cli {
    /// More log output on stderr (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    create: CreateArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an instance (the default when no subcommand is given)
    Create(CreateArgs),

    /// Destroy a deployment and release everything created for it
    Destroy {
        #[arg(long)]
        name: String,

        /// Where to look the instance up when no record exists
        #[arg(long)]
        provider: Option<String>,
    },

    /// Recorded deployments and managed instances with their live state
    Status,

    /// Rewrite the peer configs with the instance's current address
    Export {
        #[arg(long)]
        name: String,

        /// Use this address instead of the recorded one
        #[arg(long)]
        address: Option<IpAddr>,

        /// Ask the provider for the current address
        #[arg(long, conflicts_with = "address")]
        refresh: bool,

        /// Skip printing QR codes
        #[arg(long)]
        no_qr: bool,
    },

    /// Show peer configs as terminal QR codes
    Qr {
        #[arg(long)]
        name: String,

        /// Only this peer (1-based)
        #[arg(long)]
        peer: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            error::report(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> error::Result<()> {
    let config = MoatConfig::from_env()?;
    let mut console = Console::stdio();

    let Cli { command, create, .. } = cli;
    match command.unwrap_or(Command::Create(create)) {
        Command::Create(args) => commands::create(args, &config, &mut console).await,
        Command::Destroy { name, provider } => {
            commands::destroy(&name, provider.as_deref(), &config, &mut console).await
        }
        Command::Status => commands::status(&config, &mut console).await,
        Command::Export {
            name,
            address,
            refresh,
            no_qr,
        } => commands::export(&name, address, refresh, !no_qr, &config, &mut console).await,
        Command::Qr { name, peer } => commands::qr(&name, peer, &config, &mut console),
    }
}
