//! Socksrouter - SOCKS4/4a and SOCKS5 proxy server
//!
//! This is the main entry point for the Socksrouter application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use socksrouter::config::{load_config, Config};
use socksrouter::run_server;
use socksrouter::store::{HostStore, NetworkStore, UserStore};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Socksrouter - multi-listener SOCKS proxy with access control and private networks
#[derive(Parser, Debug)]
#[command(name = "socksrouter")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `socksrouter=trace` (overridden by RUST_LOG)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    /// Edit the stores instead of running the proxy
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a user, or replace the password of an existing one
    AddUser { username: String, password: String },
    /// Delete a user
    DeleteUser { username: String },
    /// Create a private network over an IPv4 CIDR range
    CreateNetwork { name: String, ip_range: String },
    /// Add a user to a private network
    JoinNetwork { username: String, network_id: String },
    /// Remove a user from a private network
    LeaveNetwork { username: String, network_id: String },
    /// Record private DNS addresses for a host name
    AddHost {
        hostname: String,
        #[arg(required = true)]
        addresses: Vec<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = load_config(&args.config)?;

    if let Some(command) = args.command {
        return manage(&config, command).await;
    }

    info!("Socksrouter v{}", socksrouter::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!("Data directory: {:?}", config.server.data_dir);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    run_server(config, cancel).await
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                error!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }

    cancel.cancel();
}

/// Run one store management command
async fn manage(config: &Config, command: Command) -> Result<()> {
    let data_dir = &config.server.data_dir;

    match command {
        Command::AddUser { username, password } => {
            let users = UserStore::open(data_dir)?;
            if users.get(&username).await.is_some() {
                users.update_password(&username, &password).await?;
                println!("Updated password for {}", username);
            } else {
                users.add(&username, &password).await?;
                println!("Added user {}", username);
            }
        }
        Command::DeleteUser { username } => {
            let users = UserStore::open(data_dir)?;
            if users.delete(&username).await? {
                println!("Deleted user {}", username);
            } else {
                println!("No user named {}", username);
            }
        }
        Command::CreateNetwork { name, ip_range } => {
            let network = NetworkStore::open(data_dir)?
                .create(&name, &ip_range)
                .await?;
            println!("Created network {} with id {}", network.name, network.id);
        }
        Command::JoinNetwork {
            username,
            network_id,
        } => {
            let users = UserStore::open(data_dir)?;
            let member = NetworkStore::open(data_dir)?
                .add_member(&users, &username, &network_id)
                .await
                .with_context(|| format!("Failed to add {} to {}", username, network_id))?;
            println!("{} joined with address {}", member.username, member.assigned_ip);
        }
        Command::LeaveNetwork {
            username,
            network_id,
        } => {
            if NetworkStore::open(data_dir)?
                .remove_member(&username, &network_id)
                .await?
            {
                println!("{} left {}", username, network_id);
            } else {
                println!("{} is not a member of {}", username, network_id);
            }
        }
        Command::AddHost {
            hostname,
            addresses,
        } => {
            HostStore::open(data_dir)?
                .add(&hostname, addresses.clone())
                .await?;
            println!("Recorded {} -> {:?}", hostname, addresses);
        }
    }

    Ok(())
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .with_context(|| format!("Invalid log level: {}", level))?;
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    Ok(())
}
