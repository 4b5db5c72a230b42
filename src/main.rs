//! a3s-inbox - multi-channel inbox server
//!
//! Receives provider webhooks, stores normalized messages and serves the
//! merged audience context.

use a3s_inbox::config::InboxConfig;
use a3s_inbox::{http, telemetry, InboxService};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "a3s-inbox")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Multi-channel inbox: webhooks, credentials and audience context")]
struct Cli {
    /// Configuration file path (.hcl)
    #[arg(short, long, env = "A3S_INBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration and exit
    Check,

    /// Print a new base64 encryption key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Keygen = cli.command {
        println!("{}", a3s_inbox::crypto::generate_key());
        return Ok(());
    }

    let mut config = InboxConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if cli.verbose {
        config.log.level = "debug".into();
    }
    telemetry::init(&config.log)?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Commands::Check => {
            InboxService::from_config(&config).context("Invalid configuration")?;
            println!("Configuration OK");
            Ok(())
        }
        Commands::Keygen => Ok(()),
    }
}

async fn serve(config: InboxConfig) -> Result<()> {
    let service = Arc::new(InboxService::from_config(&config).context("Failed to build service")?);
    let app = http::build_app(service);

    let addr: std::net::SocketAddr = config
        .server
        .bind_addr()
        .parse()
        .context("Invalid listen address")?;
    tracing::info!(%addr, "a3s-inbox listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutting down...");
    Ok(())
}
