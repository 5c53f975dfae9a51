//! meshtun CLI
//!
//! Runs a reference relay, runs a relay mesh, or generates an identity.

mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshtun_core::{PeerChange, PresenceTable};
use meshtun_relay::{AddressMesh, Identity, RelayServer};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;

/// meshtun - relay mesh and tunnel tooling
#[derive(Parser)]
#[command(name = "meshtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path [default: ~/.config/meshtun/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        /// Listen address (overrides [relay] bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Maintain links to a set of relays and log peer presence
    Mesh {
        /// Relay address; repeat for several (overrides [mesh] relays)
        #[arg(short, long = "relay")]
        relays: Vec<String>,
    },

    /// Generate a new identity
    Keygen {
        /// Output file for the secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Relay { bind } => {
            if let Some(bind) = bind {
                config.relay.bind = bind;
            }
            config.validate()?;
            run_relay(&config).await?;
        }
        Commands::Mesh { relays } => {
            if !relays.is_empty() {
                config.mesh.relays = relays;
            }
            config.validate()?;
            run_mesh(&config).await?;
        }
        Commands::Keygen { output } => {
            generate_identity(output.as_deref())?;
        }
    }

    Ok(())
}

/// Load the configured identity, or a throwaway one if no key file exists
fn load_identity(config: &Config) -> anyhow::Result<Identity> {
    let path = &config.identity.secret_key_file;
    let identity = if path.exists() {
        let secret = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading secret key {}", path.display()))?,
        );
        Identity::from_hex(&secret).with_context(|| format!("parsing secret key {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "no secret key file, using a temporary identity");
        Identity::generate()
    };

    Ok(match &config.identity.mesh_key {
        Some(mesh_key) => identity.with_mesh_key(mesh_key.clone()),
        None => identity,
    })
}

/// Run the reference relay until Ctrl+C
async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let bind = config.relay_bind_addr()?;
    let identity = load_identity(config)?;
    let server = RelayServer::bind_with_identity(bind, config.relay.server_config(), identity)
        .await
        .with_context(|| format!("binding relay on {bind}"))?;

    println!("meshtun relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", server.local_addr());
    println!("Relay ID: {}", hex::encode(&server.relay_id()[..8]));
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    tracing::info!(clients = server.client_count(), "stopping relay");
    server.shutdown().await;

    Ok(())
}

/// Run a relay mesh until Ctrl+C, logging reachability changes
async fn run_mesh(config: &Config) -> anyhow::Result<()> {
    if config.mesh.relays.is_empty() {
        tracing::warn!("no relays configured; the mesh will stay empty");
    }

    let identity = Arc::new(load_identity(config)?);
    let presence = Arc::new(PresenceTable::new());
    let mut changes = presence.subscribe();

    println!("meshtun mesh");
    println!("Node: {}", identity.public_key());

    let mesh = AddressMesh::new(identity, config.mesh.settings.clone(), presence.clone());
    let diff = mesh.set_addresses(&config.mesh.relays)?;
    for address in &diff.added {
        println!("Relay: {address}");
    }
    println!("Press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            change = changes.recv() => match change {
                Ok(PeerChange::Reachable(peer)) => {
                    tracing::info!(peer = %peer.short(), relays = ?presence.relays_for(&peer), "peer reachable");
                }
                Ok(PeerChange::Unreachable(peer)) => {
                    tracing::info!(peer = %peer.short(), "peer unreachable");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, reachable = presence.len(), "presence log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("\nShutting down...");
    for link in mesh.snapshot() {
        tracing::debug!(address = %link.address, link = %link.id, status = ?link.status, "closing link");
    }
    mesh.close().await;

    Ok(())
}

/// Generate a new identity and optionally write its secret key
fn generate_identity(output: Option<&Path>) -> anyhow::Result<()> {
    println!("Generating new Ed25519 identity...");

    let identity = Identity::generate();
    println!("Public key: {}", identity.public_key());

    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_secret(path, &identity.secret_hex())
            .with_context(|| format!("writing {}", path.display()))?;

        println!("Secret key saved to: {}", path.display());
        println!("\nKeep this file secure! It contains your secret key.");
    } else {
        println!("\nSecret key not saved (use --output to save)");
    }

    Ok(())
}

fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_bytes())?;
    file.write_all(b"\n")
}
