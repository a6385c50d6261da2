//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use tracing::{debug, info};

use super::server_config::{Authenticator, ServerConfig};
use super::session::SshSession;
use crate::config::Config;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Hands each incoming connection to an [`SshSession`] sharing one
/// [`Authenticator`].
pub struct SshServer {
    authenticator: Arc<Authenticator>,
}

impl SshServer {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.authenticator), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Build the server configuration and run the SSH listener until it fails.
/// Configuration errors surface before the address is bound.
pub async fn start_ssh_server(config: Arc<Config>) -> Result<()> {
    let server_config = ServerConfig::new(&config).context("failed to configure SSH server")?;

    let listen_addr: SocketAddr = config
        .sshd
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", config.sshd.listen))?;

    info!(
        address = %listen_addr,
        host_keys = ?server_config.host_key_paths().collect::<Vec<_>>(),
        macs = ?server_config.policy().macs,
        kex_algorithms = ?server_config.policy().kex_algorithms,
        "starting SSH server"
    );

    let mut ssh_server = SshServer::new(server_config.authenticator());
    ssh_server
        .run_on_address(server_config.ssh_config(), listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
