//! CLI for busadapter
//!
//! Subcommands:
//! - `publish`: send one message
//! - `subscribe`: print messages on a subject until interrupted
//! - `request`: send a request and print the reply
//! - `respond`: echo requests on a subject back to the sender
//! - `ping`: check that the broker answers

use std::time::Duration;

use busadapter::utils::logging;
use busadapter::{BusAdapter, BusError, Settings, load_config};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "busadapter", about = "Talk to a message bus from the command line")]
struct Cli {
    /// Broker host, overriding configuration
    #[arg(long, env = "BUSADAPTER_HOST")]
    host: Option<String>,
    /// Broker port, overriding configuration
    #[arg(long, env = "BUSADAPTER_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a message
    Publish { subject: String, message: String },
    /// Print every message received on a subject
    Subscribe { subject: String },
    /// Send a request and wait for one reply
    Request {
        subject: String,
        message: String,
        /// Reply timeout in milliseconds (defaults to client.request_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Answer requests on a subject with an optional prefix plus the request body
    Respond {
        subject: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Check broker liveness
    Ping,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.logging.level);

    if let Some(host) = cli.host {
        settings.broker.host = host;
    }
    if let Some(port) = cli.port {
        settings.broker.port = port;
    }

    if let Err(e) = run(cli.command, &settings).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, settings: &Settings) -> Result<(), BusError> {
    let adapter = BusAdapter::from_settings(settings);

    match command {
        Command::Publish { subject, message } => {
            adapter.connect().await?;
            adapter.publish(&subject, message.as_bytes())?;
            // let the writer flush before the client is dropped
            adapter.ping().await;
            info!(%subject, "message published");
        }
        Command::Subscribe { subject } => {
            adapter.subscribe(&subject, move |payload| {
                println!("{}", String::from_utf8_lossy(&payload));
            })?;
            adapter.connect().await?;
            info!(%subject, "listening; press Ctrl-C to stop");
            wait_for_shutdown().await;
        }
        Command::Request {
            subject,
            message,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| settings.client.request_timeout());
            adapter.connect().await?;
            let reply = adapter
                .request_reply(&subject, message.as_bytes(), timeout)
                .await?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        Command::Respond { subject, prefix } => {
            adapter.respond_to_channel(&subject, move |payload| {
                let mut reply = prefix.clone().into_bytes();
                reply.extend_from_slice(&payload);
                reply
            })?;
            adapter.connect().await?;
            info!(%subject, "responding; press Ctrl-C to stop");
            wait_for_shutdown().await;
        }
        Command::Ping => {
            adapter.connect().await?;
            if adapter.ping().await {
                println!("pong");
            } else {
                println!("no answer from {}", settings.broker.address());
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received. Exiting gracefully.");
}
