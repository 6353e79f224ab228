//! Eligibility checks against the external platform
//!
//! Wraps a [`PlatformClient`] with token caching, per-call timeouts and
//! bounded retries. A privacy check that cannot be completed is an error,
//! never a pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use certissue_core::{ExternalAccountId, OfferingId};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

use crate::platform::{ClientCredentials, PlatformClient, PlatformError};
use crate::retry::RetryPolicy;

/// Result of an eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible,
    /// The account hides its profile so completions cannot be read
    PrivacyRestricted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{call} failed after {attempts} attempts: {last}")]
    Exhausted {
        call: &'static str,
        attempts: u32,
        last: PlatformError,
    },

    #[error("{call} failed: {error}")]
    Failed {
        call: &'static str,
        error: PlatformError,
    },

    /// More credential pages remained than the lookup may walk
    #[error("Credential lookup stopped after {pages} pages")]
    PageLimit { pages: u32 },
}

/// Tuning for [`EligibilityVerifier`]
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub retry: RetryPolicy,
    /// Upper bound on a single platform call
    pub call_timeout: Duration,
    /// Refresh the token this long before it expires
    pub refresh_margin: Duration,
    /// Stop paginating after this many pages
    pub max_pages: u32,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
            refresh_margin: Duration::from_secs(60),
            max_pages: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct EligibilityVerifier {
    client: Arc<dyn PlatformClient>,
    credentials: ClientCredentials,
    settings: VerifierSettings,
    token: Mutex<Option<CachedToken>>,
}

impl EligibilityVerifier {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        credentials: ClientCredentials,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            client,
            credentials,
            settings,
            token: Mutex::new(None),
        }
    }

    /// Privacy first, then completion
    ///
    /// An account the platform does not know is ineligible.
    pub async fn check(
        &self,
        account: ExternalAccountId,
        offering: &OfferingId,
    ) -> Result<Eligibility, VerifyError> {
        match self.is_privacy_restricted(account).await {
            Ok(true) => return Ok(Eligibility::PrivacyRestricted),
            Ok(false) => {}
            Err(VerifyError::Failed {
                error: PlatformError::NotFound(_),
                ..
            }) => return Ok(Eligibility::Ineligible),
            Err(e) => return Err(e),
        }

        if self.has_credential(account, offering).await? {
            Ok(Eligibility::Eligible)
        } else {
            Ok(Eligibility::Ineligible)
        }
    }

    pub async fn is_privacy_restricted(
        &self,
        account: ExternalAccountId,
    ) -> Result<bool, VerifyError> {
        let client = &self.client;
        self.call("privacy check", |token| async move {
            client.get_account_privacy(account, &token).await
        })
        .await
    }

    /// Walk the account's credential pages, stopping at the first match
    ///
    /// Running into `max_pages` is an error, not a miss.
    pub async fn has_credential(
        &self,
        account: ExternalAccountId,
        offering: &OfferingId,
    ) -> Result<bool, VerifyError> {
        let client = &self.client;
        for page in 1..=self.settings.max_pages {
            let result = self
                .call("credential lookup", |token| async move {
                    client.get_credentials(account, page, &token).await
                })
                .await;
            let result = match result {
                Err(VerifyError::Failed {
                    error: PlatformError::NotFound(_),
                    ..
                }) => return Ok(false),
                other => other?,
            };

            if result.offerings.iter().any(|o| o == offering) {
                tracing::debug!(account = %account, offering = %offering, page, "Credential found");
                return Ok(true);
            }
            if !result.has_next {
                return Ok(false);
            }
        }

        tracing::warn!(
            account = %account,
            max_pages = self.settings.max_pages,
            "Credential lookup stopped at page limit"
        );
        Err(VerifyError::PageLimit {
            pages: self.settings.max_pages,
        })
    }

    /// Run one platform call with a valid token, retrying per policy
    ///
    /// A rejected token is refreshed once and the call repeated. A rate
    /// limit repeats the same call after the platform's hint.
    async fn call<T, F, Fut>(&self, call: &'static str, mut op: F) -> Result<T, VerifyError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let policy = &self.settings.retry;
        let mut failures = 0;
        let mut rate_limited = 0;
        let mut refreshed = false;

        loop {
            let token = self.token().await?;
            let result = match timeout(self.settings.call_timeout, op(token)).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(PlatformError::Unauthorized) if !refreshed => {
                    tracing::info!(call, "Platform rejected token, refreshing");
                    self.invalidate_token().await;
                    refreshed = true;
                }
                Err(PlatformError::RateLimited { retry_after }) => {
                    rate_limited += 1;
                    if rate_limited > policy.max_rate_limit_waits {
                        return Err(VerifyError::Exhausted {
                            call,
                            attempts: failures + rate_limited,
                            last: PlatformError::RateLimited { retry_after },
                        });
                    }
                    let wait = retry_after.unwrap_or(policy.default_retry_after);
                    let wait_ms = wait.as_millis() as u64;
                    tracing::warn!(call, wait_ms, "Platform rate limited");
                    sleep(wait).await;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        return Err(VerifyError::Exhausted {
                            call,
                            attempts: failures,
                            last: e,
                        });
                    }
                    let wait = policy.backoff(failures);
                    tracing::warn!(
                        call,
                        error = %e,
                        attempt = failures,
                        "Platform call failed, retrying"
                    );
                    sleep(wait).await;
                }
                Err(error) => return Err(VerifyError::Failed { call, error }),
            }
        }
    }

    /// Current token, exchanging credentials when missing or near expiry
    ///
    /// The lock is held across the exchange so concurrent callers share
    /// one refresh.
    async fn token(&self) -> Result<String, VerifyError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + self.settings.refresh_margin < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let policy = &self.settings.retry;
        let mut failures = 0;
        let fresh = loop {
            let exchange = self.client.exchange_token(&self.credentials);
            let result = match timeout(self.settings.call_timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout),
            };
            match result {
                Ok(token) => break token,
                Err(PlatformError::RateLimited { retry_after })
                    if failures < policy.max_attempts =>
                {
                    failures += 1;
                    sleep(retry_after.unwrap_or(policy.default_retry_after)).await;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        return Err(VerifyError::Exhausted {
                            call: "token exchange",
                            attempts: failures,
                            last: e,
                        });
                    }
                    sleep(policy.backoff(failures)).await;
                }
                Err(error) => {
                    return Err(VerifyError::Failed {
                        call: "token exchange",
                        error,
                    })
                }
            }
        };

        tracing::debug!(expires_in = fresh.expires_in.as_secs(), "Obtained platform token");
        let value = fresh.value.clone();
        *cached = Some(CachedToken {
            value: fresh.value,
            expires_at: Instant::now() + fresh.expires_in,
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}
