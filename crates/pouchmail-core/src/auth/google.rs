//! Google identity provider
//!
//! Speaks the OAuth 2.0 refresh-token grant against the Google token
//! endpoint. The long-lived refresh token is persisted as JSON under the
//! config dir; the short-lived access token lives only in memory.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};

use super::IdentityProvider;

/// Google token endpoint
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth client credentials
pub struct GoogleCredentials {
    /// OAuth client ID
    pub client_id: String,

    /// OAuth client secret
    pub client_secret: String,
}

impl Default for GoogleCredentials {
    fn default() -> Self {
        let client_id = std::env::var("POUCHMAIL_CLIENT_ID")
            .or_else(|_| std::env::var("GOOGLE_CLIENT_ID"))
            .unwrap_or_else(|_| "YOUR_CLIENT_ID".to_string());
        let client_secret = std::env::var("POUCHMAIL_CLIENT_SECRET")
            .or_else(|_| std::env::var("GOOGLE_CLIENT_SECRET"))
            .unwrap_or_else(|_| "YOUR_CLIENT_SECRET".to_string());
        Self {
            client_id,
            client_secret,
        }
    }
}

/// Tokens persisted on disk. Only the refresh token survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    refresh_token: String,

    #[serde(default)]
    scopes: Vec<String>,
}

/// Response from the Google token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    expires_in: Option<i64>,
}

/// Identity provider backed by Google OAuth
pub struct GoogleIdentity {
    credentials: GoogleCredentials,
    client: Client,
    tokens_path: PathBuf,
    cached_access_token: RwLock<Option<String>>,
}

impl GoogleIdentity {
    /// Create a provider from configuration
    pub fn new(config: &Config) -> Self {
        Self::with_credentials(config, GoogleCredentials::default())
    }

    /// Create with explicit credentials
    pub fn with_credentials(config: &Config, credentials: GoogleCredentials) -> Self {
        Self {
            credentials,
            client: Client::new(),
            tokens_path: config.tokens_dir().join("google.json"),
            cached_access_token: RwLock::new(None),
        }
    }

    fn read_stored_tokens(&self) -> Result<StoredTokens> {
        if !self.tokens_path.exists() {
            debug!("No stored tokens at {:?}", self.tokens_path);
            return Err(Error::SignInRequired);
        }
        let contents = std::fs::read_to_string(&self.tokens_path)?;
        let tokens: StoredTokens = serde_json::from_str(&contents)?;
        Ok(tokens)
    }

    /// Persist a refresh token obtained from a full interactive login
    pub fn store_refresh_token(&self, refresh_token: &str, scopes: Vec<String>) -> Result<()> {
        if let Some(parent) = self.tokens_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tokens = StoredTokens {
            refresh_token: refresh_token.to_string(),
            scopes,
        };
        std::fs::write(&self.tokens_path, serde_json::to_string_pretty(&tokens)?)?;
        info!("Stored refresh token at {:?}", self.tokens_path);
        Ok(())
    }

    /// Exchange the stored refresh token for a fresh access token
    async fn refresh_grant(&self) -> Result<String> {
        let stored = self.read_stored_tokens()?;

        debug!("Refreshing access token");
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", stored.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::NetworkTimeout(TOKEN_URL.to_string())
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A revoked or expired refresh token is unrecoverable without a
            // full interactive login.
            if body.contains("invalid_grant") {
                error!("Refresh token rejected: {}", body);
                return Err(Error::SignInRequired);
            }
            error!("Token refresh failed: {} - {}", status, body);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedBody(e.to_string()))?;

        *self.cached_access_token.write() = Some(token_response.access_token.clone());
        debug!("Access token refreshed");
        Ok(token_response.access_token)
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentity {
    async fn configure(&self) -> Result<()> {
        if let Some(parent) = self.tokens_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!("Google identity configured, tokens at {:?}", self.tokens_path);
        Ok(())
    }

    async fn get_tokens_silently(&self) -> Result<String> {
        if let Some(token) = self.cached_access_token.read().clone() {
            debug!("Returning cached access token");
            return Ok(token);
        }
        self.refresh_grant().await
    }

    async fn sign_in_silently(&self) -> Result<()> {
        *self.cached_access_token.write() = None;
        self.refresh_grant().await?;
        Ok(())
    }

    fn invalidate(&self) {
        *self.cached_access_token.write() = None;
        debug!("Cached access token dropped");
    }
}
