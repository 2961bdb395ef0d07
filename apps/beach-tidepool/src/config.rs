use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tidepool_sync::SyncConfig;

use crate::debug_client::DebugCommand;

pub const CERT_FILE: &str = "fullchain.pem";
pub const KEY_FILE: &str = "privkey.pem";

#[derive(Debug, Parser)]
#[command(
    name = "beach-tidepool",
    author,
    version,
    about = "Beach Tidepool room state relay",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Join a room on a running relay and watch or push state
    Debug {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/")]
        url: String,

        /// Shared join token
        #[arg(short, long, env = "TIDEPOOL_TOKEN", hide_env_values = true)]
        token: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        #[command(subcommand)]
        command: DebugCommand,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Port to accept WebSocket connections on.
    #[arg(
        long,
        env = "TIDEPOOL_PORT",
        default_value_t = 8080,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Interface address to bind.
    #[arg(long, env = "TIDEPOOL_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Shared token clients must present when joining a room.
    #[arg(long, env = "TIDEPOOL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Directory holding fullchain.pem and privkey.pem. Enables TLS.
    #[arg(long, env = "TIDEPOOL_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// File room states are snapshotted to.
    #[arg(long, env = "TIDEPOOL_SNAPSHOT_PATH", default_value = "rooms.json")]
    pub snapshot_path: PathBuf,

    /// Seconds between snapshot writes.
    #[arg(long, env = "TIDEPOOL_SNAPSHOT_INTERVAL_SECS", default_value_t = 10)]
    pub snapshot_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub token: String,
    pub tls: Option<TlsPaths>,
    pub snapshot_path: PathBuf,
    pub snapshot_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            token: self.token.clone(),
        }
    }
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let host: IpAddr = args
            .bind_host
            .parse()
            .with_context(|| format!("invalid bind host: {}", args.bind_host))?;

        let Some(token) = args.token else {
            bail!("a shared token is required (--token or TIDEPOOL_TOKEN)");
        };
        validate_token(&token)?;

        if args.snapshot_interval_secs == 0 {
            bail!("snapshot interval must be greater than zero");
        }

        let tls = args.cert_dir.map(tls_paths).transpose()?;

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, args.port),
            token,
            tls,
            snapshot_path: args.snapshot_path,
            snapshot_interval: Duration::from_secs(args.snapshot_interval_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn validate_token(token: &str) -> anyhow::Result<()> {
    if token.is_empty() {
        bail!("token must not be empty");
    }
    // Join frames are split on spaces, so a token with whitespace could never match.
    if token.chars().any(char::is_whitespace) {
        bail!("token must not contain whitespace");
    }
    Ok(())
}

fn tls_paths(dir: PathBuf) -> anyhow::Result<TlsPaths> {
    let paths = TlsPaths {
        cert: dir.join(CERT_FILE),
        key: dir.join(KEY_FILE),
    };
    for file in [&paths.cert, &paths.key] {
        if !file.is_file() {
            bail!("TLS material missing: {}", file.display());
        }
    }
    Ok(paths)
}
