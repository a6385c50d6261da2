//! Two-factor recovery code regeneration.

use serde::{Deserialize, Serialize};

use super::{ApiError, BuildError};
use crate::config::Config;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub recovery_codes: Vec<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    key_id: &'a str,
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

    /// Ask the backend to regenerate the recovery codes of the user owning
    /// `key_id`.  A `success: false` reply surfaces the backend's message.
    pub async fn get_recovery_codes(&self, key_id: &str) -> Result<Vec<String>, ApiError> {
        let response = self
            .client
            .post("/two_factor_recovery_codes", &RequestBody { key_id })
            .await?;
        let parsed: Response = response.json()?;

        if parsed.success {
            Ok(parsed.recovery_codes)
        } else {
            Err(ApiError::Message(parsed.message))
        }
    }
}
