//! Issuance workflow
//!
//! Drives a requester's interview and, once they confirm, runs verification
//! and issuance. Actions for one requester are serialized; cancel is the
//! exception and takes effect immediately. A verification whose session was
//! cancelled or replaced while it waited on the platform is discarded before
//! it draws a serial.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use certissue_core::binding::classify;
use certissue_core::{
    Action, Application, BindConflict, BindOutcome, Catalog, IdentityBinding, Interview, Next,
    ProfileLinkPattern, RequesterId, Serial, Step, Summary, TargetId, Validators,
};
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::Instrument;

use crate::delivery::{DeliveryChannel, DeliveryOutcome};
use crate::eligibility::{Eligibility, EligibilityVerifier, VerifyError};
use crate::error::ServiceError;
use crate::generator::{Artifact, CertificateGenerator, GenerationError};
use crate::report::AdminNotifier;
use crate::retry::RetryPolicy;
use crate::store::{IdentityLedger, IssuanceCounter, Payload, SessionStore};

/// Why a verification did not end in a delivered certificate
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Binding conflict: {0:?}")]
    Conflict(BindConflict),

    #[error("Account profile is private")]
    PrivacyRestricted,

    #[error("Account has not completed the offering")]
    Ineligible,

    #[error("Platform unavailable: {0}")]
    TransientExternal(#[from] VerifyError),

    #[error("Certificate generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Certificate delivery failed: {0}")]
    Delivery(String),

    #[error("Session changed while verifying")]
    Superseded,

    #[error(transparent)]
    Store(#[from] ServiceError),
}

/// What the requester is told after an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Ask the question for this step
    Prompt { step: Step },
    /// Input refused; the same question stands
    Invalid { step: Step, problem: String },
    Confirm { summary: Summary },
    Cancelled,
    Issued { serial: Serial, copy: bool },
    Conflict,
    PrivacyRestricted,
    Ineligible,
    TryLater,
    Failed,
    /// Throttled; refused with a warning
    SlowDown,
    /// Throttled; refused silently
    Ignored,
    Maintenance,
}

impl Reply {
    /// Text shown to the requester
    pub fn message(&self) -> String {
        match self {
            Reply::Prompt { step } => match step {
                Step::Idle => "Send start to request a certificate.".into(),
                Step::CollectingName => {
                    "Enter your first and last name, e.g. Ivan Petrov.".into()
                }
                Step::CollectingGender => "Enter male or female.".into(),
                Step::CollectingOffering => "Enter the id of the course you completed.".into(),
                Step::CollectingRevocationDate => {
                    "Enter the date you left your review, as DD.MM.YYYY.".into()
                }
                Step::CollectingProfileLink => "Send the link to your platform profile.".into(),
                Step::Confirming | Step::Verifying | Step::Terminal => {
                    "Please wait.".into()
                }
            },
            Reply::Invalid { problem, .. } => format!("{}. Please try again.", problem),
            Reply::Confirm { summary } => {
                format!("Please check your details:\n\n{}\n\nSend done to confirm.", summary)
            }
            Reply::Cancelled => "Cancelled. Send start to begin again.".into(),
            Reply::Issued { serial, copy: false } => {
                format!("Here is your certificate No. {}.", serial)
            }
            Reply::Issued { serial, copy: true } => format!(
                "You already received certificate No. {}. Here is a copy.",
                serial
            ),
            Reply::Conflict => {
                "This certificate is already tied to a different account or requester.".into()
            }
            Reply::PrivacyRestricted => "Your profile is private, so we cannot see your \
                 completed courses. Open your profile settings, make the profile public, \
                 then try again."
                .into(),
            Reply::Ineligible => "We could not find a completion certificate for this \
                 course on your profile."
                .into(),
            Reply::TryLater => "The learning platform is not responding. Try again later.".into(),
            Reply::Failed => {
                "We could not send your certificate. Try again or contact an operator.".into()
            }
            Reply::SlowDown => "Too many messages. Please slow down.".into(),
            Reply::Ignored => String::new(),
            Reply::Maintenance => "The service is under maintenance. Try again later.".into(),
        }
    }
}

/// One async lock per requester
#[derive(Default)]
struct SessionLocks {
    locks: std::sync::Mutex<HashMap<RequesterId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, requester: RequesterId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(requester).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Everything the engine talks to
pub struct WorkflowDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn IdentityLedger>,
    pub counter: Arc<dyn IssuanceCounter>,
    pub verifier: Arc<EligibilityVerifier>,
    pub generator: Arc<dyn CertificateGenerator>,
    pub delivery: Arc<dyn DeliveryChannel>,
    pub notifier: Arc<AdminNotifier>,
    pub catalog: Arc<Catalog>,
    pub links: ProfileLinkPattern,
    /// Retry budget for delivering the certificate itself
    pub retry: RetryPolicy,
}

type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct WorkflowEngine {
    deps: WorkflowDeps,
    locks: SessionLocks,
    attempts: AtomicU64,
    today: Today,
}

impl WorkflowEngine {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self {
            deps,
            locks: SessionLocks::default(),
            attempts: AtomicU64::new(0),
            today: Arc::new(|| Local::now().date_naive()),
        }
    }

    /// Pin the date used to validate revocation dates
    pub fn with_today(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.deps.catalog
    }

    /// Handle one requester action
    pub async fn handle(&self, requester: RequesterId, action: Action) -> Reply {
        let span = tracing::info_span!("action", requester = %requester, action = action.as_str());
        async move {
            if action == Action::Cancel {
                return self.cancel(requester);
            }

            let _guard = self.locks.acquire(requester).await;
            match self.advance(requester, &action).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(error = %e, "Action failed");
                    Reply::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Clear the session without waiting for in-flight work
    fn cancel(&self, requester: RequesterId) -> Reply {
        match self.deps.sessions.clear(requester) {
            Ok(()) => {
                tracing::info!("Interview cancelled");
                Reply::Cancelled
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to clear session");
                Reply::Failed
            }
        }
    }

    async fn advance(
        &self,
        requester: RequesterId,
        action: &Action,
    ) -> Result<Reply, ServiceError> {
        let current = self
            .deps
            .sessions
            .get(requester)?
            .map(|s| s.interview)
            .unwrap_or_default();

        let validators = Validators {
            catalog: &self.deps.catalog,
            links: &self.deps.links,
            today: (self.today)(),
        };

        let next = match current.apply(action, &validators) {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!(step = %current.step(), error = %e, "Action refused");
                return Ok(Reply::Invalid {
                    step: current.step(),
                    problem: e.to_string(),
                });
            }
        };

        match next {
            Next::Verify(application) => Ok(self.verify(requester, application).await),
            Next::State(Interview::Idle) => {
                self.deps.sessions.clear(requester)?;
                Ok(Reply::Prompt { step: Step::Idle })
            }
            Next::State(state) => {
                if *action == Action::Start {
                    // A restart forgets everything collected so far
                    self.deps.sessions.clear(requester)?;
                }
                let reply = match &state {
                    Interview::Confirming { application } => Reply::Confirm {
                        summary: application.summary(&self.deps.catalog),
                    },
                    other => Reply::Prompt { step: other.step() },
                };
                self.deps.sessions.update(requester, state)?;
                tracing::debug!(step = %current.step(), "Interview advanced");
                Ok(reply)
            }
        }
    }

    async fn verify(&self, requester: RequesterId, application: Application) -> Reply {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let span = tracing::info_span!(
            "verify",
            attempt,
            offering = %application.offering,
            account = %application.account
        );

        async move {
            let verifying = Interview::Verifying {
                application: application.clone(),
                attempt,
            };
            if let Err(e) = self.deps.sessions.update(requester, verifying) {
                tracing::error!(error = %e, "Failed to record verification start");
                return Reply::Failed;
            }

            let reply = match self.run_verification(requester, &application, attempt).await {
                Ok(reply) => reply,
                Err(e) => self.failure_reply(requester, &application, e),
            };

            if let Err(e) = self.close_session(requester, attempt, &reply) {
                tracing::error!(error = %e, "Failed to close session");
            }
            reply
        }
        .instrument(span)
        .await
    }

    async fn run_verification(
        &self,
        requester: RequesterId,
        application: &Application,
        attempt: u64,
    ) -> Result<Reply, WorkflowError> {
        let deps = &self.deps;

        // Already issued: send a copy, no new serial
        if let Some(existing) = deps.ledger.lookup_binding(requester, &application.offering)? {
            tracing::info!(serial = %existing.serial, "Re-issuing existing certificate");
            let artifact = deps
                .generator
                .generate_copy(&existing.template_ref, &existing.full_name, existing.serial)
                .await?;
            if !self.owns(requester, attempt)? {
                return Err(WorkflowError::Superseded);
            }
            self.deliver_artifact(requester.into(), &artifact).await?;
            return Ok(Reply::Issued {
                serial: existing.serial,
                copy: true,
            });
        }

        let by_account = deps
            .ledger
            .lookup_account(&application.offering, application.account)?;
        if let Some(BindOutcome::Conflict(conflict)) =
            classify(requester, application.account, None, by_account.as_ref())
        {
            return Err(WorkflowError::Conflict(conflict));
        }

        match deps
            .verifier
            .check(application.account, &application.offering)
            .await?
        {
            Eligibility::Eligible => {}
            Eligibility::Ineligible => return Err(WorkflowError::Ineligible),
            Eligibility::PrivacyRestricted => return Err(WorkflowError::PrivacyRestricted),
        }

        if !self.owns(requester, attempt)? {
            return Err(WorkflowError::Superseded);
        }

        let scope = deps.catalog.counter_scope(&application.offering);
        let serial = deps.counter.increment(&scope)?;
        tracing::info!(serial = %serial, scope = %scope, "Serial drawn");

        let template_ref = deps
            .catalog
            .get(&application.offering)
            .map(|o| o.template_for(application.gender))
            .unwrap_or_else(|| format!("{}-{}", application.offering, application.gender));

        let binding = IdentityBinding {
            requester,
            offering: application.offering.clone(),
            account: application.account,
            serial,
            full_name: application.full_name.clone(),
            template_ref,
            issued_at: Utc::now(),
        };
        let binding = match deps.ledger.try_bind(binding)? {
            BindOutcome::Bound(binding) | BindOutcome::AlreadyBound(binding) => binding,
            BindOutcome::Conflict(conflict) => {
                tracing::warn!(
                    serial = %serial,
                    "Bind lost to a concurrent request, serial consumed"
                );
                return Err(WorkflowError::Conflict(conflict));
            }
        };

        let artifact = deps
            .generator
            .generate(
                &binding.full_name,
                application.gender,
                &binding.offering,
                binding.serial,
            )
            .await?;
        // Serial and binding stay consumed; a later request gets a copy
        if !self.owns(requester, attempt)? {
            tracing::info!(
                serial = %binding.serial,
                "Cancelled after generation, delivery skipped"
            );
            return Err(WorkflowError::Superseded);
        }
        self.deliver_artifact(requester.into(), &artifact).await?;

        tracing::info!(serial = %binding.serial, "Certificate issued");
        Ok(Reply::Issued {
            serial: binding.serial,
            copy: false,
        })
    }

    /// Send the certificate directly, retrying within the delivery budget
    async fn deliver_artifact(
        &self,
        target: TargetId,
        artifact: &Artifact,
    ) -> Result<(), WorkflowError> {
        let caption = if artifact.copy {
            format!("Copy of certificate No. {}", artifact.serial)
        } else {
            format!("Certificate No. {}", artifact.serial)
        };
        let payload = Payload::Document {
            path: artifact.path.clone(),
            caption,
        };

        let retry = &self.deps.retry;
        let mut failures = 0;
        let mut waits = 0;
        loop {
            match self.deps.delivery.deliver(target, &payload).await {
                DeliveryOutcome::Success => return Ok(()),
                DeliveryOutcome::RateLimited(wait) if waits < retry.max_rate_limit_waits => {
                    waits += 1;
                    tokio::time::sleep(wait).await;
                }
                DeliveryOutcome::TransientError(reason) if failures + 1 < retry.max_attempts => {
                    failures += 1;
                    tracing::warn!(
                        reason = %reason,
                        attempt = failures,
                        "Certificate delivery failed, retrying"
                    );
                    tokio::time::sleep(retry.backoff(failures)).await;
                }
                other => return Err(WorkflowError::Delivery(format!("{:?}", other))),
            }
        }
    }

    fn failure_reply(
        &self,
        requester: RequesterId,
        application: &Application,
        error: WorkflowError,
    ) -> Reply {
        match error {
            WorkflowError::Conflict(conflict) => {
                tracing::info!(conflict = ?conflict, "Binding conflict");
                Reply::Conflict
            }
            WorkflowError::PrivacyRestricted => {
                tracing::info!("Profile is private");
                Reply::PrivacyRestricted
            }
            WorkflowError::Ineligible => {
                tracing::info!("No completion found");
                Reply::Ineligible
            }
            WorkflowError::TransientExternal(e) => {
                tracing::warn!(error = %e, "Platform check failed");
                Reply::TryLater
            }
            WorkflowError::Superseded => {
                tracing::info!("Verification discarded, session changed");
                Reply::Cancelled
            }
            e @ (WorkflowError::Generation(_) | WorkflowError::Delivery(_)) => {
                tracing::error!(error = %e, "Issuance failed after binding");
                self.deps.notifier.alert(&format!(
                    "Issuance failed\nRequester: {}\nCourse: {}\nAccount: {}\nError: {}",
                    requester, application.offering, application.account, e
                ));
                Reply::Failed
            }
            WorkflowError::Store(e) => {
                tracing::error!(error = %e, "Storage failure during verification");
                Reply::Failed
            }
        }
    }

    /// The session still belongs to this verification attempt
    fn owns(&self, requester: RequesterId, attempt: u64) -> Result<bool, ServiceError> {
        Ok(matches!(
            self.deps.sessions.get(requester)?.map(|s| s.interview),
            Some(Interview::Verifying { attempt: current, .. }) if current == attempt
        ))
    }

    /// End the session unless someone else already took it over
    fn close_session(
        &self,
        requester: RequesterId,
        attempt: u64,
        reply: &Reply,
    ) -> Result<(), ServiceError> {
        if !self.owns(requester, attempt)? {
            return Ok(());
        }
        if let Reply::Issued { serial, .. } = reply {
            self.deps
                .sessions
                .update(requester, Interview::Terminal { serial: *serial })?;
        }
        self.deps.sessions.clear(requester)
    }
}
