//! Dialing strategies for the internal API.
//!
//! The scheme of the configured GitLab URL is inspected once, at
//! construction, and mapped onto exactly one [`Transport`] variant together
//! with the canonical host that request URLs are built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::error::BuildError;
use crate::config::HttpSettings;

const UNIX_SOCKET_PROTOCOL: &str = "http+unix://";
const HTTP_PROTOCOL: &str = "http://";
const HTTPS_PROTOCOL: &str = "https://";

/// Placeholder host used for every request sent over the UNIX socket.
const SOCKET_BASE_URL: &str = "http://unix";

const USER_AGENT: &str = concat!("gitlab-sshd/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Scheme detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    UnixSocket,
    PlainHttp,
    Https,
}

impl Scheme {
    fn detect(url: &str) -> Option<Self> {
        if url.starts_with(UNIX_SOCKET_PROTOCOL) {
            Some(Self::UnixSocket)
        } else if url.starts_with(HTTP_PROTOCOL) {
            Some(Self::PlainHttp)
        } else if url.starts_with(HTTPS_PROTOCOL) {
            Some(Self::Https)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How requests reach the backend.  Immutable after construction and safe to
/// share across concurrent callers.
#[derive(Debug, Clone)]
pub enum Transport {
    /// HTTP/1.1 over a UNIX domain socket.  Every connection dials this path
    /// regardless of the host in the request URL.
    UnixSocket(PathBuf),
    /// Unencrypted HTTP.
    PlainHttp(reqwest::Client),
    /// HTTPS with the trust store, optional client identity and verification
    /// mode baked into the client.
    Tls(reqwest::Client),
}

/// Build the transport for `gitlab_url` and return it with the canonical
/// request host.
pub fn build(
    gitlab_url: &str,
    relative_url_root: &str,
    settings: &HttpSettings,
) -> Result<(Transport, String), BuildError> {
    let scheme = Scheme::detect(gitlab_url)
        .ok_or_else(|| BuildError::UnsupportedProtocol(gitlab_url.to_string()))?;

    match scheme {
        Scheme::UnixSocket => {
            let socket = gitlab_url.trim_start_matches(UNIX_SOCKET_PROTOCOL);
            Ok((
                Transport::UnixSocket(PathBuf::from(socket)),
                socket_host(relative_url_root),
            ))
        }
        Scheme::PlainHttp => {
            let client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| BuildError::HttpClient(e.to_string()))?;
            Ok((Transport::PlainHttp(client), gitlab_url.to_string()))
        }
        Scheme::Https => Ok((
            Transport::Tls(build_tls_client(settings)?),
            gitlab_url.to_string(),
        )),
    }
}

fn socket_host(relative_url_root: &str) -> String {
    let root = relative_url_root.trim_matches('/');
    if root.is_empty() {
        SOCKET_BASE_URL.to_string()
    } else {
        format!("{SOCKET_BASE_URL}/{root}")
    }
}

// ---------------------------------------------------------------------------
// TLS client construction
// ---------------------------------------------------------------------------

fn build_tls_client(settings: &HttpSettings) -> Result<reqwest::Client, BuildError> {
    // The system trust store is loaded by reqwest itself (native roots); an
    // unavailable store simply contributes nothing.
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(settings.self_signed_cert);

    let mut extra = Vec::new();
    if let Some(ca_file) = settings.ca_file() {
        extra.extend(read_pem_certs(ca_file));
    }
    if let Some(ca_path) = settings.ca_path() {
        extra.extend(read_ca_dir(ca_path));
    }
    debug!(count = extra.len(), "additional CA certificates loaded");

    for cert in extra {
        builder = builder.add_root_certificate(cert);
    }

    if let Some((cert_path, key_path)) = settings.client_identity() {
        // A broken identity is not fatal here: the handshake will fail later
        // if the backend insists on a client certificate.
        match load_identity(cert_path, key_path) {
            Ok(identity) => builder = builder.identity(identity),
            Err(e) => warn!(
                error = %e,
                cert = %cert_path.display(),
                key = %key_path.display(),
                "failed to load TLS client certificate; continuing without it"
            ),
        }
    }

    builder
        .build()
        .map_err(|e| BuildError::HttpClient(e.to_string()))
}

/// Every certificate in the PEM file at `path` that is usable as a trust
/// anchor.  Unreadable files and malformed entries contribute nothing.
fn read_pem_certs(path: &Path) -> Vec<reqwest::Certificate> {
    let pem = match std::fs::read(path) {
        Ok(pem) => pem,
        Err(e) => {
            warn!(error = %e, filename = %path.display(), "failed to read CA file");
            return Vec::new();
        }
    };

    let mut certs = Vec::new();
    for entry in rustls_pemfile::certs(&mut pem.as_slice()) {
        let der = match entry {
            Ok(der) => der,
            Err(e) => {
                warn!(error = %e, filename = %path.display(), "failed to parse CA file");
                break;
            }
        };

        // reqwest rejects the whole client on a single bad anchor, so vet
        // each one up front.
        if let Err(e) = rustls::RootCertStore::empty().add(der.clone()) {
            warn!(error = %e, filename = %path.display(), "skipping invalid CA certificate");
            continue;
        }
        match reqwest::Certificate::from_der(der.as_ref()) {
            Ok(cert) => certs.push(cert),
            Err(e) => warn!(error = %e, filename = %path.display(), "skipping invalid CA certificate"),
        }
    }
    certs
}

/// Every regular file in `dir` is treated as a PEM bundle.  Directories are
/// skipped and bad files contribute nothing.
fn read_ca_dir(dir: &Path) -> Vec<reqwest::Certificate> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, path = %dir.display(), "failed to read CA directory");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| !path.is_dir())
        .flat_map(|path| read_pem_certs(&path))
        .collect()
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<reqwest::Identity> {
    let mut pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read client certificate {}", cert_path.display()))?;
    let key = std::fs::read(key_path)
        .with_context(|| format!("failed to read client key {}", key_path.display()))?;
    pem.push(b'\n');
    pem.extend_from_slice(&key);

    reqwest::Identity::from_pem(&pem).context("failed to parse client certificate and key")
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

impl Transport {
    /// Send `request` and return the status with the fully buffered body.
    ///
    /// Errors are transport failures only (connect, TLS, timeout, broken
    /// stream); any HTTP status is a successful round trip.
    pub(crate) async fn round_trip(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes)> {
        match self {
            Transport::UnixSocket(path) => {
                tokio::time::timeout(timeout, round_trip_unix(path, request))
                    .await
                    .context("internal API request timed out")?
            }
            Transport::PlainHttp(client) | Transport::Tls(client) => {
                round_trip_reqwest(client, request, timeout).await
            }
        }
    }
}

async fn round_trip_reqwest(
    client: &reqwest::Client,
    request: http::Request<Bytes>,
    timeout: Duration,
) -> Result<(StatusCode, Bytes)> {
    let mut request = reqwest::Request::try_from(request)?;
    *request.timeout_mut() = Some(timeout);

    let response = client.execute(request).await?;
    let status = response.status();
    let body = response.bytes().await?;
    Ok((status, body))
}

async fn round_trip_unix(path: &Path, request: http::Request<Bytes>) -> Result<(StatusCode, Bytes)> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to {}", path.display()))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("HTTP handshake over UNIX socket failed")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "internal API socket connection closed with error");
        }
    });

    // The socket is the destination; the URL only contributes the path and
    // the Host header.
    let (mut parts, body) = request.into_parts();
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| "unix".to_string());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path_and_query.parse::<Uri>()?;
    parts.headers.insert(HOST, HeaderValue::from_str(&authority)?);
    parts
        .headers
        .insert(http::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

    let response = sender
        .send_request(http::Request::from_parts(parts, Full::new(body)))
        .await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}
