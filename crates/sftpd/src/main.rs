//! sftpd server binary
//!
//! SSH server exposing the local filesystem over the sftp subsystem.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: port 2022, key at /keys/host_ed25519_key, testuser/testpass
//! sftpd
//!
//! sftpd --port 2222 --hostkey ./host_ed25519_key --user alice --pass s3cret
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sftpd::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_HOST_KEY_PATH, DEFAULT_PASSWORD, DEFAULT_SSH_PORT,
    DEFAULT_USERNAME,
};
use sftpd::{Credentials, SftpProtocol, SshServer, SshServerConfig, ensure_identity};

/// Minimal SFTP server over SSH.
#[derive(Parser, Debug)]
#[command(name = "sftpd")]
#[command(about = "Serve the sftp subsystem over SSH with a single static login")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,

    /// Path to host key file (generated on first run)
    #[arg(long, default_value = DEFAULT_HOST_KEY_PATH)]
    hostkey: PathBuf,

    /// Username for authentication
    #[arg(long, default_value = DEFAULT_USERNAME)]
    user: String,

    /// Password for authentication
    #[arg(long, default_value = DEFAULT_PASSWORD)]
    pass: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let host_key = match ensure_identity(&args.hostkey) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(path = %args.hostkey.display(), "Failed to load or generate host key: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let bind_addr = SocketAddr::from((DEFAULT_BIND_ADDRESS, args.port));

    tracing::info!(
        port = args.port,
        user = %args.user,
        root = %base_dir.display(),
        "Starting sftpd"
    );

    let config = SshServerConfig::new(bind_addr, host_key, Credentials::new(args.user, args.pass));
    let server = SshServer::new(config, SftpProtocol::new(base_dir));

    if let Err(e) = server.run().await {
        tracing::error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
