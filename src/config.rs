use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The only SSH username accepted by the server (e.g. `git`).
    #[serde(default = "default_user")]
    pub user: String,
    /// Address of the GitLab internal API.  One of `http+unix://<socket>`,
    /// `http://host:port` or `https://host`.
    pub gitlab_url: String,
    /// Relative URL root of the GitLab instance.  Only meaningful for the
    /// UNIX-socket transport, where it becomes part of the request host.
    #[serde(default)]
    pub gitlab_relative_url_root: String,
    /// Inline shared secret.  Takes precedence over `secret_file`.
    #[serde(default)]
    pub secret: Option<String>,
    /// File holding the shared secret.  Relative paths are resolved against
    /// the directory of the configuration file.
    #[serde(default = "default_secret_file")]
    pub secret_file: PathBuf,
    #[serde(default)]
    pub http_settings: HttpSettings,
    #[serde(default)]
    pub sshd: ServerSettings,
}

fn default_user() -> String {
    "git".to_string()
}

fn default_secret_file() -> PathBuf {
    PathBuf::from(".gitlab_shell_secret")
}

impl Config {
    /// The shared secret as opaque bytes.  Never validated locally: an empty
    /// secret is still signed into every request.
    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.as_deref().unwrap_or_default().as_bytes()
    }
}

// ---------------------------------------------------------------------------
// HTTP settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpSettings {
    /// Basic-auth username.  Used only when `password` is also set.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Per-request read timeout in seconds.  `0` selects the default (300).
    #[serde(default)]
    pub read_timeout: u64,
    /// Extra PEM CA bundle appended to the system trust store.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Directory whose regular files are each appended to the trust store.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Disable certificate chain and hostname verification.
    #[serde(default)]
    pub self_signed_cert: bool,
    /// Client certificate for mutual TLS.  Requires `client_key`.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

impl HttpSettings {
    pub fn ca_file(&self) -> Option<&Path> {
        non_empty(&self.ca_file)
    }

    pub fn ca_path(&self) -> Option<&Path> {
        non_empty(&self.ca_path)
    }

    /// The client certificate and key, only when both are configured.
    pub fn client_identity(&self) -> Option<(&Path, &Path)> {
        Some((non_empty(&self.client_cert)?, non_empty(&self.client_key)?))
    }
}

/// YAML files commonly spell "unset" as an empty string.
fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

// ---------------------------------------------------------------------------
// SSH server settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Socket address for the SSH listener.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Private host key files, loaded in order.
    #[serde(default)]
    pub host_key_files: Vec<PathBuf>,
    /// MAC override.  Empty selects the built-in list.
    #[serde(default)]
    pub macs: Vec<String>,
    /// Key-exchange override.  Empty selects the built-in list.
    #[serde(default)]
    pub kex_algorithms: Vec<String>,
    /// Cipher override.  Empty leaves the SSH engine's own defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
    /// Seconds of inactivity before a connection is dropped.
    #[serde(default = "default_client_alive_interval")]
    pub client_alive_interval: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key_files: Vec::new(),
            macs: Vec::new(),
            kex_algorithms: Vec::new(),
            ciphers: Vec::new(),
            client_alive_interval: default_client_alive_interval(),
        }
    }
}

fn default_listen() -> String {
    "[::]:22".to_string()
}

fn default_client_alive_interval() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`, resolving the
/// shared secret.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;

    if config.secret.is_none() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.secret = Some(read_secret(&base.join(&config.secret_file))?);
    }

    Ok(config)
}

fn read_secret(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read secret file: {}", path.display()))?;
    Ok(raw.trim().to_string())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.user.is_empty(), "user must not be empty");
    anyhow::ensure!(!config.gitlab_url.is_empty(), "gitlab_url must not be empty");
    Ok(())
}
