//! Security configuration of the SSH server.
//!
//! Loads the host identity keys, turns the configured (or curated) MAC,
//! key-exchange and cipher lists into the engine's negotiation preferences,
//! and decides whether an offered public key may open a session.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use russh::{MethodSet, Preferred, SshId};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerSettings};
use crate::gitlabnet::authorized_keys::{self, KeyLookup};
use crate::gitlabnet::BuildError;

/// Identification string sent to every client, whatever the configuration.
pub const SERVER_VERSION: &str = "SSH-2.0-GitLab-SSHD";

/// Name under which the authorized key-id is recorded for the session.
pub const KEY_ID_EXTENSION: &str = "key-id";

/// Deadline for a single backend key lookup.
pub const KEY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Key algorithms refused before the backend is consulted.
const PROHIBITED_KEY_ALGORITHMS: &[&str] = &["ssh-dss"];

pub const DEFAULT_MACS: &[&str] = &[
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha2-256",
    "hmac-sha2-512",
    "hmac-sha1",
];

pub const DEFAULT_KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group14-sha256",
];

// ---------------------------------------------------------------------------
// Host keys
// ---------------------------------------------------------------------------

/// A loaded host identity and the file it came from.
pub struct HostKey {
    pub path: PathBuf,
    pub key: KeyPair,
}

/// Load every readable, parsable private key in `paths`, in order.  Bad files
/// are logged and skipped; an empty result is an error.
pub fn load_host_keys(paths: &[PathBuf]) -> Result<Vec<HostKey>, BuildError> {
    let mut keys = Vec::with_capacity(paths.len());

    for path in paths {
        let pem = match std::fs::read_to_string(path) {
            Ok(pem) => pem,
            Err(e) => {
                warn!(error = %e, filename = %path.display(), "failed to read host key");
                continue;
            }
        };

        match russh_keys::decode_secret_key(&pem, None) {
            Ok(key) => {
                info!(filename = %path.display(), "loaded host key");
                keys.push(HostKey {
                    path: path.clone(),
                    key,
                });
            }
            Err(e) => {
                warn!(error = %e, filename = %path.display(), "failed to parse host key");
            }
        }
    }

    if keys.is_empty() {
        return Err(BuildError::NoHostKeys);
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Algorithm policy
// ---------------------------------------------------------------------------

/// Key-exchange markers that announce protocol extensions rather than name
/// an algorithm.  They are always advertised, whatever the KEX list says;
/// strict KEX is the Terrapin (CVE-2023-48795) countermeasure.
const KEX_EXTENSION_MARKERS: [russh::kex::Name; 2] = [
    russh::kex::EXTENSION_SUPPORT_AS_SERVER,
    russh::kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
];

/// Algorithm lists advertised during negotiation.  A non-empty override
/// replaces the default verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub macs: Vec<String>,
    pub kex_algorithms: Vec<String>,
    /// `None` leaves the engine's own cipher suite in place.
    pub ciphers: Option<Vec<String>>,
    macs_overridden: bool,
    kex_overridden: bool,
}

impl SecurityPolicy {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            macs: override_or(&settings.macs, DEFAULT_MACS),
            kex_algorithms: override_or(&settings.kex_algorithms, DEFAULT_KEX_ALGORITHMS),
            ciphers: (!settings.ciphers.is_empty()).then(|| settings.ciphers.clone()),
            macs_overridden: !settings.macs.is_empty(),
            kex_overridden: !settings.kex_algorithms.is_empty(),
        }
    }

    /// Translate the policy into engine preferences.
    ///
    /// Override names the engine does not implement are an error.  Curated
    /// defaults the engine lacks are dropped with a debug log.
    pub fn preferred(&self) -> Result<Preferred, BuildError> {
        let mut preferred = Preferred::DEFAULT.clone();

        preferred.mac = Cow::Owned(resolve_names::<russh::mac::Name>(
            "MAC",
            &self.macs,
            self.macs_overridden,
        )?);
        preferred.kex = Cow::Owned(self.kex_preferences()?);
        if let Some(ciphers) = &self.ciphers {
            preferred.cipher = Cow::Owned(resolve_names::<russh::cipher::Name>(
                "cipher", ciphers, true,
            )?);
        }

        Ok(preferred)
    }

    fn kex_preferences(&self) -> Result<Vec<russh::kex::Name>, BuildError> {
        let algorithms: Vec<String> = self
            .kex_algorithms
            .iter()
            .filter(|name| !is_kex_extension_marker(name))
            .cloned()
            .collect();

        let mut kex = resolve_names::<russh::kex::Name>("key exchange", &algorithms, self.kex_overridden)?;
        kex.extend(KEX_EXTENSION_MARKERS);
        Ok(kex)
    }
}

fn is_kex_extension_marker(name: &str) -> bool {
    KEX_EXTENSION_MARKERS.iter().any(|marker| marker.as_ref() == name)
}

fn override_or(configured: &[String], defaults: &[&str]) -> Vec<String> {
    if configured.is_empty() {
        defaults.iter().map(|name| name.to_string()).collect()
    } else {
        configured.to_vec()
    }
}

fn resolve_names<N>(kind: &'static str, names: &[String], strict: bool) -> Result<Vec<N>, BuildError>
where
    N: for<'a> TryFrom<&'a str>,
{
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        match N::try_from(name.as_str()) {
            Ok(n) => resolved.push(n),
            Err(_) if strict => {
                return Err(BuildError::UnknownAlgorithm {
                    kind,
                    name: name.clone(),
                })
            }
            Err(_) => debug!(kind, name = %name, "default algorithm not supported by SSH engine"),
        }
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Authentication decision
// ---------------------------------------------------------------------------

/// The public key offered by a client: algorithm name plus wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedKey {
    algorithm: String,
    blob: Vec<u8>,
}

impl OfferedKey {
    pub fn new(algorithm: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            blob,
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self::new(key.name(), key.public_key_bytes())
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Unpadded base64 of the wire encoding, the form the backend indexes.
    pub fn encoded(&self) -> String {
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.blob)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownUser,
    ProhibitedAlgorithm,
    BackendDenied,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUser => write!(f, "unknown user"),
            Self::ProhibitedAlgorithm => write!(f, "prohibited key algorithm"),
            Self::BackendDenied => write!(f, "denied by backend"),
        }
    }
}

/// Result of one public-key authentication attempt.  Every rejection looks
/// the same to the peer; the reason is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized(i64),
    Rejected(RejectReason),
}

impl AuthOutcome {
    pub fn permissions(&self) -> Option<Permissions> {
        match self {
            Self::Authorized(key_id) => Some(Permissions::for_key(*key_id)),
            Self::Rejected(_) => None,
        }
    }
}

/// Data attached to an authenticated session for later command
/// authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    fn for_key(key_id: i64) -> Self {
        let mut extensions = HashMap::new();
        extensions.insert(KEY_ID_EXTENSION.to_string(), key_id.to_string());
        Self { extensions }
    }

    pub fn key_id(&self) -> Option<&str> {
        self.extensions.get(KEY_ID_EXTENSION).map(String::as_str)
    }
}

/// Decides public-key authentication attempts.  Shared read-only by every
/// connection.
pub struct Authenticator {
    allowed_user: String,
    key_lookup: Arc<dyn KeyLookup>,
    deadline: Duration,
}

impl Authenticator {
    pub fn new(allowed_user: impl Into<String>, key_lookup: Arc<dyn KeyLookup>, deadline: Duration) -> Self {
        Self {
            allowed_user: allowed_user.into(),
            key_lookup,
            deadline,
        }
    }

    pub async fn authenticate(&self, user: &str, key: &OfferedKey) -> AuthOutcome {
        if user != self.allowed_user {
            return AuthOutcome::Rejected(RejectReason::UnknownUser);
        }
        if PROHIBITED_KEY_ALGORITHMS.contains(&key.algorithm()) {
            return AuthOutcome::Rejected(RejectReason::ProhibitedAlgorithm);
        }

        let encoded = key.encoded();
        match tokio::time::timeout(self.deadline, self.key_lookup.lookup_key(&encoded)).await {
            Ok(Ok(key_id)) => AuthOutcome::Authorized(key_id),
            Ok(Err(e)) => {
                debug!(error = %e, "key lookup failed");
                AuthOutcome::Rejected(RejectReason::BackendDenied)
            }
            Err(_) => {
                warn!(deadline = ?self.deadline, "key lookup timed out");
                AuthOutcome::Rejected(RejectReason::BackendDenied)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// `0` disables the inactivity timeout.
fn inactivity_timeout(client_alive_interval: u64) -> Option<Duration> {
    (client_alive_interval > 0).then(|| Duration::from_secs(client_alive_interval))
}

/// Everything the listener needs, built once at startup.
pub struct ServerConfig {
    host_key_paths: Vec<PathBuf>,
    policy: SecurityPolicy,
    ssh: Arc<russh::server::Config>,
    authenticator: Arc<Authenticator>,
}

impl ServerConfig {
    /// Build the server configuration with an internal API key lookup.
    pub fn new(config: &Config) -> Result<Self, BuildError> {
        let client = authorized_keys::Client::new(config)?;
        Self::with_key_lookup(config, Arc::new(client))
    }

    pub fn with_key_lookup(config: &Config, key_lookup: Arc<dyn KeyLookup>) -> Result<Self, BuildError> {
        let host_keys = load_host_keys(&config.sshd.host_key_files)?;
        let policy = SecurityPolicy::from_settings(&config.sshd);
        let preferred = policy.preferred()?;

        let (host_key_paths, keys): (Vec<PathBuf>, Vec<KeyPair>) =
            host_keys.into_iter().map(|k| (k.path, k.key)).unzip();

        let ssh = russh::server::Config {
            server_id: SshId::Standard(SERVER_VERSION.to_string()),
            keys,
            methods: MethodSet::PUBLICKEY,
            preferred,
            inactivity_timeout: inactivity_timeout(config.sshd.client_alive_interval),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: 3,
            ..Default::default()
        };

        let authenticator = Authenticator::new(config.user.clone(), key_lookup, KEY_LOOKUP_TIMEOUT);

        Ok(Self {
            host_key_paths,
            policy,
            ssh: Arc::new(ssh),
            authenticator: Arc::new(authenticator),
        })
    }

    pub fn host_key_paths(&self) -> impl Iterator<Item = &Path> {
        self.host_key_paths.iter().map(PathBuf::as_path)
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn ssh_config(&self) -> Arc<russh::server::Config> {
        Arc::clone(&self.ssh)
    }

    pub fn authenticator(&self) -> Arc<Authenticator> {
        Arc::clone(&self.authenticator)
    }
}
