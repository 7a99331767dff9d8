#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use wabridge::channels::WhatsAppWebConnector;
use wabridge::config::Config;
use wabridge::daemon;
use wabridge::session::{CredentialStore, FileCredentialStore};

#[derive(Parser, Debug)]
#[command(name = "wabridge")]
#[command(version)]
#[command(about = "WhatsApp Web bridge with webhook relay and MCP tools.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.wabridge/config.toml)
    #[arg(long, global = true, env = "WABRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge: session, gateway and change-feed (default)
    Serve {
        /// Port to listen on; defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Delete stored credentials so the next start pairs from scratch
    ResetSession,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_init(cli.config.as_deref())?;

    // RUST_LOG wins over the configured level
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        host: None,
    }) {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if !cfg!(feature = "whatsapp-web") {
                anyhow::bail!(
                    "This build has no WhatsApp engine. \
                    Rebuild with: cargo build --features whatsapp-web"
                );
            }
            info!(
                "Starting WhatsApp bridge on {}:{}",
                config.gateway.host, config.gateway.port
            );
            let connector = Arc::new(WhatsAppWebConnector::new(
                config.auth_dir(),
                config.session.pair_phone.clone(),
            ));
            daemon::run(config, connector).await
        }

        Commands::ResetSession => {
            let store = FileCredentialStore::new(config.auth_dir());
            store.clear().await?;
            println!("Session credentials removed from {}", store.location());
            println!("Start the bridge again and scan the new QR code at /qr");
            Ok(())
        }
    }
}
