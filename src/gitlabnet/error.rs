//! Error taxonomy for talking to the GitLab internal API.
//!
//! [`BuildError`] covers startup-time construction failures and is fatal.
//! [`ApiError`] covers a single request and is always recoverable by the
//! caller.  The `Display` text of [`ApiError`] is user-facing: it is what the
//! command dialogs print, so raw transport errors never reach it.

use thiserror::Error;

/// Construction failures for the transport, the API client, or the SSH
/// server configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The backend address uses a scheme other than `http+unix://`,
    /// `http://` or `https://`.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Every configured host key file was unreadable or unparsable.
    #[error("No host keys could be loaded, aborting")]
    NoHostKeys,

    /// An algorithm override names something the SSH engine does not
    /// implement.
    #[error("unsupported {kind} algorithm in configuration: {name}")]
    UnknownAlgorithm { kind: &'static str, name: String },

    /// The HTTP client library refused the assembled TLS settings.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Per-request failures of the signed API client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Connection refused, DNS failure, TLS failure, timeout.
    #[error("Internal API unreachable")]
    Unreachable,

    /// A message declared by the backend, surfaced verbatim.
    #[error("{0}")]
    Message(String),

    /// Non-2xx status without a decodable `{"message": ...}` body.
    #[error("Internal API error ({0})")]
    Status(u16),

    /// A 2xx body that did not decode into the expected payload.
    #[error("Parsing failed")]
    Parse,

    /// The request could not be built locally (bad URL, unserializable body).
    #[error("failed to build internal API request: {0}")]
    Request(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_texts() {
        assert_eq!(ApiError::Unreachable.to_string(), "Internal API unreachable");
        assert_eq!(ApiError::Status(403).to_string(), "Internal API error (403)");
        assert_eq!(
            ApiError::Message("Forbidden!".to_string()).to_string(),
            "Forbidden!"
        );
        assert_eq!(ApiError::Parse.to_string(), "Parsing failed");
    }

    #[test]
    fn test_no_host_keys_text() {
        assert_eq!(
            BuildError::NoHostKeys.to_string(),
            "No host keys could be loaded, aborting"
        );
    }
}
