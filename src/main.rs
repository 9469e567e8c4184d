use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use castr::config::Settings;
use castr::event::{self, Verdict};
use castr::relay::{self, RelayState};
use castr::server;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "castr", author, version, about = "In-memory Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the relay WebSocket and HTTP services.
    Serve,
    /// Verify the id and signature of event JSON files.
    Verify {
        /// Paths to JSON event files to check.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => {
            let cfg = Settings::from_env(&cli.env)?;
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let state = Arc::new(RelayState::new(cfg));
            tracing::info!(%http_addr, %ws_addr, "starting relay");
            tokio::try_join!(
                server::serve_http(http_addr, std::future::pending()),
                relay::serve_ws(ws_addr, state, std::future::pending()),
            )?;
        }
        Commands::Verify { files } => {
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let ev: event::Event = serde_json::from_str(&data)?;
                match ev.verify()? {
                    Verdict::Ok => println!("{f}: ok"),
                    Verdict::BadId => anyhow::bail!("{f}: event id does not match"),
                    Verdict::BadSig => anyhow::bail!("{f}: bad signature"),
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    // Configure logging from the environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    run(Cli::parse()).await
}
