//! # peercall
//!
//! One binary, two roles:
//! - `peercall relay` runs the signaling relay
//! - `peercall call` runs a call endpoint against a relay
//!
//! Configuration comes from `PEERCALL__*` environment variables, `.env` and
//! an optional `config.toml`; command-line flags override the call section.

mod endpoint;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(about = "Two-party WebRTC calls over a WebSocket signaling relay")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Relay {
        /// Listen port (overrides relay.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Register with the relay and place or answer a call
    Call {
        /// Identity to register under
        #[arg(long)]
        id: String,

        /// Identity to call once registered
        #[arg(long)]
        target: Option<String>,

        /// Relay WebSocket URL (overrides call.relay_url)
        #[arg(long, env = "PEERCALL_RELAY_URL")]
        relay: Option<String>,

        /// Do not answer incoming calls
        #[arg(long)]
        no_auto_accept: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = peercall_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting peercall v{}", env!("CARGO_PKG_VERSION"));

    match Args::parse().command {
        Command::Relay { port } => {
            let mut relay = config.relay.clone();
            if let Some(port) = port {
                relay.port = port;
            }
            peercall_relay::serve(&relay).await?;
        }
        Command::Call { id, target, relay, no_auto_accept } => {
            let mut call = config.call.clone();
            if let Some(url) = relay {
                call.relay_url = url;
            }
            let options = endpoint::Options {
                id,
                target,
                auto_accept: !no_auto_accept,
            };
            endpoint::run(&call, options).await?;
        }
    }

    Ok(())
}
