//! Public-key lookup against `/authorized_keys`.

use serde::Deserialize;
use tracing::{debug, instrument};

use super::{ApiError, BuildError};
use crate::config::Config;

/// Resolves an offered public key to the backend's key-id.
///
/// This is the seam the SSH authenticator depends on, so it can be driven
/// without a live backend.
#[async_trait::async_trait]
pub trait KeyLookup: Send + Sync {
    /// Look up `key`, the unpadded base64 of the key's wire encoding.
    async fn lookup_key(&self, key: &str) -> Result<i64, ApiError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: i64,
    #[serde(default)]
    pub key: String,
}

pub struct Client {
    client: super::Client,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, BuildError> {
        Ok(Self {
            client: super::Client::new(config)?,
        })
    }

    /// `GET /authorized_keys?key=<key>`.
    #[instrument(skip(self, key))]
    pub async fn get_by_key(&self, key: &str) -> Result<Response, ApiError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("key", key)
            .finish();
        let response = self.client.get(&format!("/authorized_keys?{query}")).await?;
        let parsed: Response = response.json()?;
        debug!(key_id = parsed.id, "authorized key found");
        Ok(parsed)
    }
}

#[async_trait::async_trait]
impl KeyLookup for Client {
    async fn lookup_key(&self, key: &str) -> Result<i64, ApiError> {
        Ok(self.get_by_key(key).await?.id)
    }
}
