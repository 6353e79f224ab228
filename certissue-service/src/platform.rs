//! External learning platform client
//!
//! The platform is the source of truth for which offerings an account has
//! completed. Access uses the OAuth client-credentials grant; every other
//! call carries the resulting bearer token.

use std::time::Duration;

use async_trait::async_trait;
use certissue_core::{ExternalAccountId, OfferingId};
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

/// Errors returned by platform calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Platform rejected the client credentials or token")]
    Unauthorized,

    #[error("Platform rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Platform request timed out")]
    Timeout,

    #[error("Platform transport error: {0}")]
    Transport(String),

    #[error("Platform returned HTTP {0}")]
    Status(u16),

    #[error("Invalid platform response: {0}")]
    Decode(String),

    #[error("Account {0} not found on platform")]
    NotFound(ExternalAccountId),
}

impl PlatformError {
    /// Worth retrying after a backoff
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Timeout | PlatformError::Transport(_) => true,
            PlatformError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PlatformError::Timeout
        } else if e.is_decode() {
            PlatformError::Decode(e.to_string())
        } else {
            PlatformError::Transport(e.to_string())
        }
    }
}

/// Client id and secret issued by the platform
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Bearer token and its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_in: Duration,
}

/// One page of an account's completion credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPage {
    /// Offerings this page shows the account completed
    pub offerings: Vec<OfferingId>,
    pub has_next: bool,
}

/// Operations the service needs from the platform
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Exchange client credentials for an access token
    async fn exchange_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, PlatformError>;

    /// Fetch one page (1-based) of completion credentials for an account
    async fn get_credentials(
        &self,
        account: ExternalAccountId,
        page: u32,
        token: &str,
    ) -> Result<CredentialPage, PlatformError>;

    /// Whether the account's profile is private
    async fn get_account_privacy(
        &self,
        account: ExternalAccountId,
        token: &str,
    ) -> Result<bool, PlatformError>;
}

/// Token lifetime assumed when the platform omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: u64 = 36_000;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct CertificatesResponse {
    #[serde(default)]
    meta: Meta,
    #[serde(default)]
    certificates: Vec<CertificateEntry>,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    has_next: bool,
}

#[derive(Deserialize)]
struct CertificateEntry {
    course: serde_json::Value,
}

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Deserialize)]
struct UserEntry {
    #[serde(default)]
    is_private: bool,
}

/// Course ids come back as numbers or strings depending on the endpoint version
fn offering_from_value(value: &serde_json::Value) -> Option<OfferingId> {
    match value {
        serde_json::Value::Number(n) => Some(OfferingId::new(n.to_string())),
        serde_json::Value::String(s) => Some(OfferingId::new(s.clone())),
        _ => None,
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status to an error
fn status_error(response: &Response, account: Option<ExternalAccountId>) -> PlatformError {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            retry_after: retry_after(response),
        },
        StatusCode::NOT_FOUND => match account {
            Some(account) => PlatformError::NotFound(account),
            None => PlatformError::Status(404),
        },
        status => PlatformError::Status(status.as_u16()),
    }
}

/// HTTP client for the platform's REST API
pub struct HttpPlatformClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlatformClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn exchange_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, PlatformError> {
        let url = format!("{}/oauth2/token/", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(&response, None));
        }

        let body: TokenResponse = response.json().await?;
        Ok(AccessToken {
            value: body.access_token,
            expires_in: Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME)),
        })
    }

    async fn get_credentials(
        &self,
        account: ExternalAccountId,
        page: u32,
        token: &str,
    ) -> Result<CredentialPage, PlatformError> {
        let url = format!("{}/api/certificates", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("user", account.0.to_string()), ("page", page.to_string())])
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(&response, Some(account)));
        }

        let body: CertificatesResponse = response.json().await?;
        Ok(CredentialPage {
            offerings: body
                .certificates
                .iter()
                .filter_map(|c| offering_from_value(&c.course))
                .collect(),
            has_next: body.meta.has_next,
        })
    }

    async fn get_account_privacy(
        &self,
        account: ExternalAccountId,
        token: &str,
    ) -> Result<bool, PlatformError> {
        let url = format!("{}/api/users/{}", self.base_url, account);
        let response = self.client.get(&url).bearer_auth(token).send().await?;

        if !response.status().is_success() {
            return Err(status_error(&response, Some(account)));
        }

        let body: UsersResponse = response.json().await?;
        body.users
            .first()
            .map(|u| u.is_private)
            .ok_or(PlatformError::NotFound(account))
    }
}
