//! Google Cloud access tokens for the warehouse.
//!
//! Two credential kinds are supported:
//! - a service account key file (`warehouse.credentials_file` or
//!   `GOOGLE_APPLICATION_CREDENTIALS`): a signed RS256 JWT is exchanged for an
//!   access token, which is cached and refreshed a minute before it expires;
//! - a bare access token in `BIGQUERY_ACCESS_TOKEN`, used as-is. It cannot be
//!   refreshed, so once it expires every call fails until it is replaced.
//!
//! The last authentication failure is kept so the status report can show why
//! the warehouse stopped answering.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a service account key file that token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

enum Credentials {
    AccessToken(String),
    ServiceAccount(ServiceAccountKey),
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

pub struct GcpAuth {
    credentials: Credentials,
    client: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
    failure: RwLock<Option<String>>,
}

impl GcpAuth {
    fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials,
            client: reqwest::Client::new(),
            cached: RwLock::new(None),
            failure: RwLock::new(None),
        }
    }

    /// A fixed bearer token, never refreshed.
    pub fn access_token(token: impl Into<String>) -> Self {
        Self::with_credentials(Credentials::AccessToken(token.into()))
    }

    pub fn service_account(key: ServiceAccountKey) -> Self {
        Self::with_credentials(Credentials::ServiceAccount(key))
    }

    /// Read and check a service account key file.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .with_context(|| format!("Invalid service account key: {}", path.display()))?;
        EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .with_context(|| format!("Invalid private key in {}", path.display()))?;
        Ok(Self::service_account(key))
    }

    /// Pick credentials: the configured key file, then
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then `BIGQUERY_ACCESS_TOKEN`.
    pub fn from_env(credentials_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = credentials_file {
            return Self::from_key_file(path);
        }
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            if !path.is_empty() {
                return Self::from_key_file(Path::new(&path));
            }
        }
        match std::env::var("BIGQUERY_ACCESS_TOKEN") {
            Ok(token) if !token.is_empty() => {
                info!("using BIGQUERY_ACCESS_TOKEN; it will not be refreshed");
                Ok(Self::access_token(token))
            }
            _ => bail!(
                "no warehouse credentials: set warehouse.credentials_file, \
                 GOOGLE_APPLICATION_CREDENTIALS or BIGQUERY_ACCESS_TOKEN"
            ),
        }
    }

    /// Whether a rejected token can be replaced by a fresh one.
    pub fn can_refresh(&self) -> bool {
        matches!(self.credentials, Credentials::ServiceAccount(_))
    }

    /// A valid access token, exchanging a new one when the cached token is
    /// missing or about to expire.
    pub async fn token(&self) -> Result<String> {
        let key = match &self.credentials {
            Credentials::AccessToken(token) => return Ok(token.clone()),
            Credentials::ServiceAccount(key) => key,
        };

        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() + REFRESH_MARGIN {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + REFRESH_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        match self.exchange(key).await {
            Ok(response) => {
                debug!(expires_in = response.expires_in, "access token refreshed");
                let access_token = response.access_token.clone();
                *cached = Some(CachedToken {
                    access_token: response.access_token,
                    expires_at: Instant::now() + Duration::from_secs(response.expires_in),
                });
                Ok(access_token)
            }
            Err(e) => {
                warn!(error = %e, "access token refresh failed");
                self.record_failure(format!("token refresh failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Drop the cached token so the next call exchanges a new one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub async fn record_failure(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }

    pub async fn clear_failure(&self) {
        let mut failure = self.failure.write().await;
        if failure.take().is_some() {
            info!("warehouse authentication recovered");
        }
    }

    /// The most recent authentication failure, if it has not been cleared by
    /// a later successful call.
    pub async fn failure(&self) -> Option<String> {
        self.failure.read().await.clone()
    }

    async fn exchange(&self, key: &ServiceAccountKey) -> Result<TokenResponse> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope: SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Invalid service account private key")?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .context("Failed to sign token request")?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("POST {} failed", key.token_uri))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "token exchange failed ({}): {}",
                status,
                body.chars().take(300).collect::<String>()
            ));
        }
        response
            .json::<TokenResponse>()
            .await
            .context("Invalid token response")
    }
}
