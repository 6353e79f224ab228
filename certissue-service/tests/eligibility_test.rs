//! Eligibility verifier tests against a scripted platform

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certissue_core::{ExternalAccountId, OfferingId};
use certissue_service::platform::{
    AccessToken, ClientCredentials, CredentialPage, PlatformClient, PlatformError,
};
use certissue_service::{Eligibility, EligibilityVerifier, VerifierSettings, VerifyError};
use common::{fast_retry, MockPlatform, PART_1};

fn verifier(platform: Arc<MockPlatform>) -> EligibilityVerifier {
    verifier_with(platform, VerifierSettings {
        retry: fast_retry(),
        call_timeout: Duration::from_millis(500),
        ..VerifierSettings::default()
    })
}

fn verifier_with(platform: Arc<MockPlatform>, settings: VerifierSettings) -> EligibilityVerifier {
    EligibilityVerifier::new(
        platform,
        ClientCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        },
        settings,
    )
}

fn part_1() -> OfferingId {
    OfferingId::new(PART_1)
}

// =============================================================================
// Completion lookup
// =============================================================================

#[tokio::test]
async fn test_stops_paging_at_first_match() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&["1"], &[PART_1], &["3"], &["4"]]);
    let verifier = verifier(platform.clone());

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await.unwrap(),
        Eligibility::Eligible
    );
    assert_eq!(platform.count_calls("credentials"), 2);
}

#[tokio::test]
async fn test_walks_every_page_when_absent() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&["1"], &["2"], &["3"]]);
    let verifier = verifier(platform.clone());

    assert!(!verifier
        .has_credential(ExternalAccountId(42), &part_1())
        .await
        .unwrap());
    assert_eq!(platform.count_calls("credentials"), 3);
}

#[tokio::test]
async fn test_page_limit_is_an_error() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&["1"], &["2"], &[PART_1]]);
    let verifier = verifier_with(platform.clone(), VerifierSettings {
        retry: fast_retry(),
        max_pages: 2,
        ..VerifierSettings::default()
    });

    assert_eq!(
        verifier.has_credential(ExternalAccountId(42), &part_1()).await,
        Err(VerifyError::PageLimit { pages: 2 })
    );
    assert_eq!(platform.count_calls("credentials"), 2);
}

#[tokio::test]
async fn test_last_page_without_match_is_ineligible() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&["1"], &["2"]]);
    let verifier = verifier_with(platform.clone(), VerifierSettings {
        retry: fast_retry(),
        max_pages: 2,
        ..VerifierSettings::default()
    });

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await,
        Ok(Eligibility::Ineligible)
    );
}

#[tokio::test]
async fn test_rate_limit_retries_same_page() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&["1"], &[PART_1]]);
    let verifier = verifier(platform.clone());

    // Privacy check passes, then page 1 is rate limited once
    assert!(!verifier.is_privacy_restricted(ExternalAccountId(42)).await.unwrap());
    platform.fail_next(vec![PlatformError::RateLimited {
        retry_after: Some(Duration::from_millis(10)),
    }]);

    assert!(verifier
        .has_credential(ExternalAccountId(42), &part_1())
        .await
        .unwrap());
    let pages: Vec<String> = platform
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("credentials"))
        .collect();
    assert_eq!(
        pages,
        vec!["credentials:42:1", "credentials:42:1", "credentials:42:2"]
    );
}

#[tokio::test]
async fn test_persistent_rate_limit_gives_up() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    let limited = PlatformError::RateLimited {
        retry_after: Some(Duration::from_millis(1)),
    };
    platform.fail_next(vec![limited; 10]);
    let verifier = verifier(platform.clone());

    let err = verifier
        .check(ExternalAccountId(42), &part_1())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Exhausted {
            last: PlatformError::RateLimited { .. },
            ..
        }
    ));
    assert_eq!(
        platform.count_calls("privacy"),
        fast_retry().max_rate_limit_waits as usize + 1
    );
}

// =============================================================================
// Privacy
// =============================================================================

#[tokio::test]
async fn test_private_profile_short_circuits() {
    let platform = Arc::new(MockPlatform::new());
    platform.make_private(42);
    let verifier = verifier(platform.clone());

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await.unwrap(),
        Eligibility::PrivacyRestricted
    );
    assert_eq!(platform.count_calls("credentials"), 0);
}

#[tokio::test]
async fn test_privacy_check_error_is_not_treated_as_public() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    platform.fail_next(vec![PlatformError::Status(400)]);
    let verifier = verifier(platform.clone());

    let err = verifier
        .check(ExternalAccountId(42), &part_1())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Failed {
            error: PlatformError::Status(400),
            ..
        }
    ));
    assert_eq!(platform.count_calls("credentials"), 0);
}

#[tokio::test]
async fn test_unknown_account_is_ineligible() {
    let platform = Arc::new(MockPlatform::new());
    let verifier = verifier(platform.clone());

    assert_eq!(
        verifier.check(ExternalAccountId(7), &part_1()).await.unwrap(),
        Eligibility::Ineligible
    );
}

// =============================================================================
// Tokens
// =============================================================================

#[tokio::test]
async fn test_token_is_reused_across_calls() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    let verifier = verifier(platform.clone());

    verifier.check(ExternalAccountId(42), &part_1()).await.unwrap();
    verifier.check(ExternalAccountId(42), &part_1()).await.unwrap();

    assert_eq!(platform.tokens_issued(), 1);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    let verifier = verifier(platform.clone());

    verifier.check(ExternalAccountId(42), &part_1()).await.unwrap();
    platform.revoke("token-1");

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await.unwrap(),
        Eligibility::Eligible
    );
    assert_eq!(platform.tokens_issued(), 2);
}

#[tokio::test]
async fn test_token_rejected_twice_fails() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    platform.fail_next(vec![PlatformError::Unauthorized, PlatformError::Unauthorized]);
    let verifier = verifier(platform.clone());

    let err = verifier
        .check(ExternalAccountId(42), &part_1())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Failed {
            error: PlatformError::Unauthorized,
            ..
        }
    ));
    assert_eq!(platform.tokens_issued(), 2);
}

#[tokio::test]
async fn test_token_near_expiry_is_refreshed() {
    // Lifetime shorter than the refresh margin
    let platform = Arc::new(MockPlatform::with_token_lifetime(Duration::from_secs(30)));
    platform.completed(42, &[&[PART_1]]);
    let verifier = verifier(platform.clone());

    verifier.check(ExternalAccountId(42), &part_1()).await.unwrap();

    // One exchange per platform call
    assert_eq!(platform.tokens_issued(), 2);
}

#[tokio::test]
async fn test_token_exchange_outage_is_transient() {
    let platform = Arc::new(MockPlatform::new());
    platform.completed(42, &[&[PART_1]]);
    platform.fail_token(vec![PlatformError::Status(503); 5]);
    let verifier = verifier(platform.clone());

    let err = verifier
        .check(ExternalAccountId(42), &part_1())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Exhausted { call: "token exchange", .. }));
    assert_eq!(platform.count_calls("privacy"), 0);
}

// =============================================================================
// Timeouts
// =============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Hang {
    Token,
    Privacy,
    Credentials,
}

/// Platform whose chosen call never answers
struct HangingPlatform(Hang);

impl HangingPlatform {
    async fn maybe_hang(&self, call: Hang) {
        if self.0 == call {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl PlatformClient for HangingPlatform {
    async fn exchange_token(&self, _: &ClientCredentials) -> Result<AccessToken, PlatformError> {
        self.maybe_hang(Hang::Token).await;
        Ok(AccessToken {
            value: "token".into(),
            expires_in: Duration::from_secs(3600),
        })
    }

    async fn get_credentials(
        &self,
        _: ExternalAccountId,
        _: u32,
        _: &str,
    ) -> Result<CredentialPage, PlatformError> {
        self.maybe_hang(Hang::Credentials).await;
        Ok(CredentialPage {
            offerings: vec![OfferingId::new(PART_1)],
            has_next: false,
        })
    }

    async fn get_account_privacy(
        &self,
        _: ExternalAccountId,
        _: &str,
    ) -> Result<bool, PlatformError> {
        self.maybe_hang(Hang::Privacy).await;
        Ok(false)
    }
}

fn hanging_verifier(hang: Hang) -> EligibilityVerifier {
    EligibilityVerifier::new(
        Arc::new(HangingPlatform(hang)),
        ClientCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        },
        VerifierSettings {
            retry: fast_retry(),
            call_timeout: Duration::from_millis(50),
            ..VerifierSettings::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_hanging_privacy_check_times_out() {
    let verifier = hanging_verifier(Hang::Privacy);

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await,
        Err(VerifyError::Exhausted {
            call: "privacy check",
            attempts: fast_retry().max_attempts,
            last: PlatformError::Timeout,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_credential_lookup_times_out() {
    let verifier = hanging_verifier(Hang::Credentials);

    let result = verifier.check(ExternalAccountId(42), &part_1()).await;

    assert!(
        matches!(
            result,
            Err(VerifyError::Exhausted {
                last: PlatformError::Timeout,
                ..
            })
        ),
        "{:?}",
        result
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_token_exchange_times_out() {
    let verifier = hanging_verifier(Hang::Token);

    assert_eq!(
        verifier.check(ExternalAccountId(42), &part_1()).await,
        Err(VerifyError::Exhausted {
            call: "token exchange",
            attempts: fast_retry().max_attempts,
            last: PlatformError::Timeout,
        })
    );
}
