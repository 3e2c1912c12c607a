//! remotectl Agent
//!
//! Enrolls the machine on first run, then keeps the remote-control
//! connection to the management service alive.

use anyhow::{Context, Result};
use clap::Parser;
use remotectl_agent::connection::ConnectionOptions;
use remotectl_agent::{
    AgentConfig, AgentSettings, ClientIdentity, Enrollment, RemoteConnection, WebServiceHandler,
};
use remotectl_protocol::{ClaimedClientData, RegistrationResponse};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// remotectl Agent - remote control channel for a backup client
#[derive(Parser, Debug)]
#[command(name = "remotectl-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "remotectl-agent.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("remotectl agent v{}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    let mut settings = AgentSettings::load(&config.settings_file)
        .await
        .with_context(|| format!("loading settings from {}", config.settings_file.display()))?;

    let credentials = match settings.claimed() {
        Some(credentials) => credentials,
        None => {
            let credentials = enroll(&config, &settings, &cancel).await?;
            settings.apply_claim(&credentials);
            settings.save().await?;
            info!("Machine claimed, credentials saved");
            credentials
        }
    };

    let options = ConnectionOptions::from_config(&config.connection, settings.machine_id.clone());
    let handler = Arc::new(WebServiceHandler::new(&config.webservice, settings)?);
    let connection = RemoteConnection::new(credentials, handler, options, &cancel)?;

    info!("Connecting to management service");
    connection.run().await?;

    Ok(())
}

async fn enroll(
    config: &AgentConfig,
    settings: &AgentSettings,
    cancel: &CancellationToken,
) -> Result<ClaimedClientData> {
    let identity = ClientIdentity::detect(settings.machine_id.clone(), settings.machine_id.clone());
    let enrollment = Enrollment::new(config.registration.url.as_str(), identity, cancel)?;

    let registration = enrollment
        .register(
            Some(config.registration.max_retries),
            Some(config.registration.retry_interval()),
        )
        .await
        .context("registering machine")?;

    let claimed = match registration {
        RegistrationResponse::Claimed(claimed) => claimed,
        RegistrationResponse::Pending(data) => {
            info!("Machine registered, claim it by visiting: {}", data.claim_link);
            enrollment.claim().await.context("waiting for claim")?
        }
    };

    if claimed.server_certificates.is_empty() {
        warn!("Claim returned no server certificates, relying on certificate refresh");
    }

    Ok(claimed)
}
