//! Signed client for the GitLab internal API.
//!
//! Every request is sent under `/api/v4/internal`, carries the shared secret
//! in the `Gitlab-Shared-Secret` header, and comes back as a fully buffered
//! [`Response`].  Network failures collapse to [`ApiError::Unreachable`] and
//! non-2xx statuses are decoded into [`ApiError::Message`] or
//! [`ApiError::Status`], so feature clients only ever handle the 2xx payload.
//! Each request gets a fresh correlation id, sent as `X-Request-Id` and
//! recorded on the request's tracing span.

pub mod authorized_keys;
pub mod error;
pub mod transport;
pub mod two_factor_recovery;

use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

pub use error::{ApiError, BuildError};
pub use transport::Transport;

use crate::config::Config;

/// Namespace every internal API path lives under.
pub const INTERNAL_API_PATH: &str = "/api/v4/internal";

/// Header carrying the base64-encoded shared secret.
pub const SECRET_HEADER_NAME: &str = "Gitlab-Shared-Secret";

/// Header carrying the correlation id of each request.
pub const REQUEST_ID_HEADER_NAME: &str = "X-Request-Id";

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A 2xx response whose body has already been read in full.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    body: Bytes,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Decode the body as JSON into the caller's payload type.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            debug!(error = %e, "failed to decode internal API response");
            ApiError::Parse
        })
    }
}

/// Error body returned by the backend on non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client for the internal API.  Cheap to share: the transport is read-only
/// after construction.
#[derive(Debug, Clone)]
pub struct Client {
    transport: Transport,
    host: String,
    encoded_secret: HeaderValue,
    basic_auth: Option<HeaderValue>,
    read_timeout: Duration,
}

impl Client {
    /// Build a client bound to the backend described by `config`.
    pub fn new(config: &Config) -> Result<Self, BuildError> {
        let (transport, host) = transport::build(
            &config.gitlab_url,
            &config.gitlab_relative_url_root,
            &config.http_settings,
        )?;

        let settings = &config.http_settings;
        let basic_auth = (!settings.user.is_empty() && !settings.password.is_empty())
            .then(|| basic_auth_header(&settings.user, &settings.password));

        let read_timeout = match settings.read_timeout {
            0 => DEFAULT_READ_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        Ok(Self {
            transport,
            host,
            encoded_secret: secret_header(config.secret_bytes()),
            basic_auth,
            read_timeout,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn get(&self, path: &str) -> Result<Response, ApiError> {
        self.do_request(Method::GET, path, None).await
    }

    pub async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        data: &T,
    ) -> Result<Response, ApiError> {
        let body = serde_json::to_vec(data).map_err(|e| ApiError::Request(e.to_string()))?;
        self.do_request(Method::POST, path, Some(Bytes::from(body)))
            .await
    }

    #[instrument(skip(self, body), fields(correlation_id = tracing::field::Empty))]
    async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.host, normalize_path(path));
        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(&url)
            .header(REQUEST_ID_HEADER_NAME, correlation_id)
            .header(SECRET_HEADER_NAME, self.encoded_secret.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(auth) = &self.basic_auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let request = builder
            .body(body.unwrap_or_default())
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let (status, body) = self
            .transport
            .round_trip(request, self.read_timeout)
            .await
            .map_err(|e| {
                debug!(error = %format!("{e:#}"), %method, %url, "internal API request failed");
                ApiError::Unreachable
            })?;

        debug!(%method, %url, %status, "internal API response");

        if !status.is_success() {
            return Err(parse_error(status, &body));
        }

        Ok(Response { status, body })
    }
}

/// Ensure `path` has a single leading slash and the internal API prefix.
/// Idempotent.
pub fn normalize_path(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    if path.starts_with(INTERNAL_API_PATH) {
        path
    } else {
        format!("{INTERNAL_API_PATH}{path}")
    }
}

fn parse_error(status: StatusCode, body: &[u8]) -> ApiError {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(parsed) => ApiError::Message(parsed.message),
        Err(_) => ApiError::Status(status.as_u16()),
    }
}

fn secret_header(secret: &[u8]) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
    // Base64 output is always a valid header value.
    HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn basic_auth_header(user: &str, password: &str) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}
