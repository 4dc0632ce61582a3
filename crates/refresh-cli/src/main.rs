mod cmd;
mod output;
mod remote;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "refresh",
    about = "Daily financial data refresh pipeline: run, schedule, and inspect",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .refresh/)
    #[arg(long, global = true, env = "REFRESH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter .refresh/config.yaml
    Init,

    /// Validate the config for common mistakes
    Check,

    /// Run the full pipeline once, now
    Run,

    /// Run a single data step, now
    Step {
        /// balance-update, deals-update, universe-update, or weights-update
        name: String,
    },

    /// Show when the scheduler fires next
    Next {
        /// Evaluate from this instant instead of the current time (RFC 3339)
        #[arg(long)]
        now: Option<String>,
    },

    /// Show recent step executions
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Run the scheduler loop and the HTTP control surface until Ctrl-C
    Daemon {
        /// Port for the control surface (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
        /// Do not start the control surface
        #[arg(long)]
        no_server: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Daemon { .. } | Commands::Run | Commands::Step { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Check => cmd::check::run(&root, cli.json),
        Commands::Run => cmd::run::run(&root, cli.json),
        Commands::Step { name } => cmd::step::run(&root, &name, cli.json),
        Commands::Next { now } => cmd::next::run(&root, now.as_deref(), cli.json),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json),
        Commands::Daemon { port, no_server } => cmd::daemon::run(&root, port, no_server),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
