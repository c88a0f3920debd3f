//! CleanPath relay CLI
//!
//! Runs the relay behind a plain TCP listener and probes running relays.

mod config;
mod probe;
mod tcp_boundary;

use clap::{Parser, Subcommand};
use cleanpath_relay::CleanPathProxy;
use cleanpath_transport::TcpDialer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use config::Config;

/// CleanPath - relay TCP and TLS for clients that cannot open sockets
#[derive(Parser)]
#[command(name = "cleanpath")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Negotiate a destination through a running relay
    Probe {
        /// Relay address
        #[arg(required = true)]
        relay: String,

        /// Destination host:port
        #[arg(required = true)]
        destination: String,

        /// Initial payload to forward, as hex
        #[arg(long)]
        initial_payload: Option<String>,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config path
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Serve { bind } => {
            serve(bind, &config).await?;
        }
        Commands::Probe {
            relay,
            destination,
            initial_payload,
            timeout,
        } => {
            run_probe(relay, destination, initial_payload, timeout).await?;
        }
        Commands::Config { save } => {
            show_config(&config, &config_path, save)?;
        }
    }

    Ok(())
}

/// Accept TCP clients and relay them until Ctrl+C
async fn serve(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let listen_addr = match bind {
        Some(bind) => bind.parse()?,
        None => config.parse_listen_addr()?,
    };

    let relay_config = config.relay_config()?;
    let dialer = Arc::new(TcpDialer::new().with_keepalive(config.keepalive()));
    let proxy = CleanPathProxy::new(relay_config, dialer)?;

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("CleanPath relay listening on {}", listener.local_addr()?);
    tracing::info!(
        "Default destination {}, TLS policy {:?}",
        proxy.config().default_destination,
        proxy.config().tls_policy
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    if let Err(e) = tcp_boundary::serve_connection(proxy, stream, peer).await {
                        tracing::warn!(%peer, "Connection ended with error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    let sessions = proxy.sessions().await;
    for session in &sessions {
        if let Err(e) = proxy.disconnect(&session.id).await {
            tracing::debug!("Session {} already gone: {}", session.id, e);
        }
    }
    tracing::info!("Closed {} session(s)", sessions.len());

    Ok(())
}

/// Probe a relay and print the reply
async fn run_probe(
    relay: String,
    destination: String,
    initial_payload: Option<String>,
    timeout: u64,
) -> anyhow::Result<()> {
    let initial_payload = initial_payload
        .map(|h| hex::decode(h.trim()))
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid initial payload hex: {}", e))?;

    println!("Relay: {}", relay);
    println!("Destination: {}", destination);

    let reply = probe::probe(
        &relay,
        &destination,
        initial_payload,
        Duration::from_secs(timeout),
    )
    .await?;
    print!("{}", probe::describe(&reply));

    if reply.is_error() {
        anyhow::bail!("Relay refused the request");
    }
    Ok(())
}

/// Print (and optionally save) the configuration
fn show_config(config: &Config, path: &std::path::Path, save: bool) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);

    if save {
        config.save(path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
