//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`SshSession`].  The
//! handler runs public-key authentication through the shared
//! [`Authenticator`] and records the resulting [`Permissions`].  Command
//! dispatch lives outside this server, so exec and shell requests are
//! answered with a notice on stderr and a non-zero exit status.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::server_config::{AuthOutcome, Authenticator, OfferedKey, Permissions};

const NO_COMMAND_NOTICE: &[u8] = b"ERROR: This server only authenticates connections; no command can be run.\n";

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    authenticator: Arc<Authenticator>,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    /// Set once a public key has been accepted.
    permissions: Option<Permissions>,
}

impl SshSession {
    pub fn new(authenticator: Arc<Authenticator>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            authenticator,
            peer_addr,
            username: None,
            permissions: None,
        }
    }

    pub fn permissions(&self) -> Option<&Permissions> {
        self.permissions.as_ref()
    }
}

/// Send exit-status, EOF and close on a channel, in protocol order.
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// SHA-256 fingerprint of an SSH public key in `ssh-keygen -l` form.
fn fingerprint_of(key: &PublicKey) -> String {
    let hash = Sha256::digest(key.public_key_bytes());
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        let offered = OfferedKey::from_public_key(key);

        let outcome = self.authenticator.authenticate(user, &offered).await;

        match outcome {
            AuthOutcome::Authorized(key_id) => {
                info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    fingerprint = %fp,
                    key_id,
                    "SSH public key accepted"
                );
                self.username = Some(user.to_string());
                self.permissions = outcome.permissions();
                Ok(Auth::Accept)
            }
            AuthOutcome::Rejected(reason) => {
                warn!(
                    peer = ?self.peer_addr,
                    user = %user,
                    fingerprint = %fp,
                    algorithm = %offered.algorithm(),
                    reason = %reason,
                    "SSH public key rejected"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.permissions.is_some())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            peer = ?self.peer_addr,
            username = ?self.username,
            key_id = ?self.permissions.as_ref().and_then(Permissions::key_id),
            command = %String::from_utf8_lossy(data),
            "SSH exec request"
        );
        refuse_command(session, channel_id);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(peer = ?self.peer_addr, username = ?self.username, "SSH shell request");
        refuse_command(session, channel_id);
        Ok(())
    }
}

fn refuse_command(session: &mut Session, channel_id: ChannelId) {
    session.extended_data(channel_id, 1, CryptoVec::from_slice(NO_COMMAND_NOTICE));
    finish_channel(session, channel_id, 1);
}
