//! Common test utilities for service integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum_test::TestServer;
use certissue_core::{
    Action, Catalog, ExternalAccountId, FullName, Gender, OfferingId, ProfileLinkPattern,
    RequesterId, Serial, TargetId,
};
use certissue_service::delivery::{DeliveryChannel, DeliveryOutcome};
use certissue_service::platform::{
    AccessToken, ClientCredentials, CredentialPage, PlatformClient, PlatformError,
};
use certissue_service::queue::{BatchCompletion, BatchReport, NotificationQueue, WorkerPool};
use certissue_service::report::AdminNotifier;
use certissue_service::store::{Payload, Stores};
use certissue_service::{
    routes, AppState, Artifact, CertificateGenerator, Components, Config, EligibilityVerifier,
    GenerationError, QueueSettings, Reply, RetryPolicy, TextCertificateGenerator,
    VerifierSettings, WorkflowDeps, WorkflowEngine,
};
use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub const PROFILE_HOST: &str = "platform.example";
pub const ADMIN: i64 = 999;
pub const PART_1: &str = "214271";
pub const PART_2: &str = "221885";

/// Retry policy with millisecond waits
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        max_rate_limit_waits: 3,
        default_retry_after: Duration::from_millis(5),
    }
}

pub fn profile_link(account: u64) -> String {
    format!("https://{}/users/{}", PROFILE_HOST, account)
}

// =============================================================================
// Mock platform
// =============================================================================

/// Scriptable learning platform
pub struct MockPlatform {
    /// Completed offerings per account, one inner vec per page
    completions: RwLock<HashMap<u64, Vec<Vec<String>>>>,
    private: RwLock<HashSet<u64>>,
    /// Errors returned by the next privacy/credential calls, in order
    failures: Mutex<VecDeque<PlatformError>>,
    token_failures: Mutex<VecDeque<PlatformError>>,
    revoked: RwLock<HashSet<String>>,
    /// Every call, e.g. `token`, `privacy:42`, `credentials:42:1`
    pub calls: Mutex<Vec<String>>,
    tokens_issued: AtomicUsize,
    token_lifetime: Duration,
    /// When set, privacy checks wait for a permit
    hold: Mutex<Option<Arc<Semaphore>>>,
    /// One permit per privacy check started
    entered: Semaphore,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_token_lifetime(Duration::from_secs(3600))
    }

    pub fn with_token_lifetime(token_lifetime: Duration) -> Self {
        Self {
            completions: RwLock::new(HashMap::new()),
            private: RwLock::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            token_failures: Mutex::new(VecDeque::new()),
            revoked: RwLock::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            tokens_issued: AtomicUsize::new(0),
            token_lifetime,
            hold: Mutex::new(None),
            entered: Semaphore::new(0),
        }
    }

    /// Register an account whose credentials span the given pages
    pub fn completed(&self, account: u64, pages: &[&[&str]]) {
        let pages = pages
            .iter()
            .map(|page| page.iter().map(|s| s.to_string()).collect())
            .collect();
        self.completions.write().unwrap().insert(account, pages);
    }

    pub fn make_private(&self, account: u64) {
        self.private.write().unwrap().insert(account);
        self.completions.write().unwrap().entry(account).or_default();
    }

    pub fn fail_next(&self, errors: Vec<PlatformError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn fail_token(&self, errors: Vec<PlatformError>) {
        self.token_failures.lock().unwrap().extend(errors);
    }

    pub fn revoke(&self, token: &str) {
        self.revoked.write().unwrap().insert(token.to_string());
    }

    pub fn tokens_issued(&self) -> usize {
        self.tokens_issued.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Make privacy checks block until `release` is called
    pub fn hold(&self) {
        *self.hold.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(sem) = self.hold.lock().unwrap().as_ref() {
            sem.add_permits(1000);
        }
    }

    /// Wait until `n` more privacy checks have started
    pub async fn wait_entered(&self, n: u32) {
        tokio::time::timeout(Duration::from_secs(10), self.entered.acquire_many(n))
            .await
            .expect("privacy check never started")
            .expect("semaphore closed")
            .forget();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, token: &str) -> Result<(), PlatformError> {
        if self.revoked.read().unwrap().contains(token) {
            return Err(PlatformError::Unauthorized);
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn exchange_token(
        &self,
        _credentials: &ClientCredentials,
    ) -> Result<AccessToken, PlatformError> {
        self.record("token".to_string());
        if let Some(e) = self.token_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AccessToken {
            value: format!("token-{}", n),
            expires_in: self.token_lifetime,
        })
    }

    async fn get_credentials(
        &self,
        account: ExternalAccountId,
        page: u32,
        token: &str,
    ) -> Result<CredentialPage, PlatformError> {
        self.record(format!("credentials:{}:{}", account, page));
        self.check(token)?;

        let completions = self.completions.read().unwrap();
        let pages = completions
            .get(&account.0)
            .ok_or(PlatformError::NotFound(account))?;
        let index = page as usize - 1;
        Ok(CredentialPage {
            offerings: pages
                .get(index)
                .map(|p| p.iter().map(OfferingId::new).collect())
                .unwrap_or_default(),
            has_next: index + 1 < pages.len(),
        })
    }

    async fn get_account_privacy(
        &self,
        account: ExternalAccountId,
        token: &str,
    ) -> Result<bool, PlatformError> {
        self.record(format!("privacy:{}", account));
        self.entered.add_permits(1);
        let hold = self.hold.lock().unwrap().clone();
        if let Some(sem) = hold {
            let _permit = sem.acquire().await;
        }
        self.check(token)?;

        if !self.completions.read().unwrap().contains_key(&account.0) {
            return Err(PlatformError::NotFound(account));
        }
        Ok(self.private.read().unwrap().contains(&account.0))
    }
}

// =============================================================================
// Holdable generator
// =============================================================================

/// Text generator that can be paused mid-render
pub struct HoldableGenerator {
    inner: TextCertificateGenerator,
    hold: Mutex<Option<Arc<Semaphore>>>,
    /// One permit per render started
    entered: Semaphore,
}

impl HoldableGenerator {
    pub fn new(inner: TextCertificateGenerator) -> Self {
        Self {
            inner,
            hold: Mutex::new(None),
            entered: Semaphore::new(0),
        }
    }

    /// Make renders block until `release` is called
    pub fn hold(&self) {
        *self.hold.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(sem) = self.hold.lock().unwrap().as_ref() {
            sem.add_permits(1000);
        }
    }

    /// Wait until `n` more renders have started
    pub async fn wait_entered(&self, n: u32) {
        tokio::time::timeout(Duration::from_secs(10), self.entered.acquire_many(n))
            .await
            .expect("render never started")
            .expect("semaphore closed")
            .forget();
    }

    async fn pause(&self) {
        self.entered.add_permits(1);
        let hold = self.hold.lock().unwrap().clone();
        if let Some(sem) = hold {
            let _permit = sem.acquire().await;
        }
    }
}

#[async_trait]
impl CertificateGenerator for HoldableGenerator {
    async fn generate(
        &self,
        full_name: &FullName,
        gender: Gender,
        offering: &OfferingId,
        serial: Serial,
    ) -> Result<Artifact, GenerationError> {
        self.pause().await;
        self.inner.generate(full_name, gender, offering, serial).await
    }

    async fn generate_copy(
        &self,
        template_ref: &str,
        full_name: &FullName,
        serial: Serial,
    ) -> Result<Artifact, GenerationError> {
        self.pause().await;
        self.inner.generate_copy(template_ref, full_name, serial).await
    }
}

// =============================================================================
// Recording delivery channel
// =============================================================================

/// Delivery channel that records payloads and plays scripted outcomes
#[derive(Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<(TargetId, Payload)>>,
    attempts: Mutex<HashMap<TargetId, u32>>,
    /// Outcomes for the next attempts per target; success once exhausted
    scripts: Mutex<HashMap<TargetId, VecDeque<DeliveryOutcome>>>,
    /// Outcome for every attempt to a target
    always: Mutex<HashMap<TargetId, DeliveryOutcome>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, target: TargetId, outcomes: Vec<DeliveryOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(target, outcomes.into_iter().collect());
    }

    pub fn always(&self, target: TargetId, outcome: DeliveryOutcome) {
        self.always.lock().unwrap().insert(target, outcome);
    }

    pub fn delivered_to(&self, target: TargetId) -> Vec<Payload> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn attempts(&self, target: TargetId) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&target)
            .copied()
            .unwrap_or(0)
    }

    /// Text of every message delivered to a target
    pub fn texts_to(&self, target: TargetId) -> Vec<String> {
        self.delivered_to(target)
            .into_iter()
            .filter_map(|p| match p {
                Payload::Text { text } => Some(text),
                Payload::Document { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn deliver(&self, target: TargetId, payload: &Payload) -> DeliveryOutcome {
        *self.attempts.lock().unwrap().entry(target).or_default() += 1;

        let outcome = match self.always.lock().unwrap().get(&target) {
            Some(outcome) => outcome.clone(),
            None => self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&target)
                .and_then(|s| s.pop_front())
                .unwrap_or(DeliveryOutcome::Success),
        };

        if outcome == DeliveryOutcome::Success {
            self.delivered.lock().unwrap().push((target, payload.clone()));
        }
        outcome
    }
}

// =============================================================================
// Recording batch completion
// =============================================================================

#[derive(Default)]
pub struct RecordingCompletion {
    pub reports: Mutex<Vec<BatchReport>>,
    notify: Notify,
}

impl RecordingCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next report
    pub async fn wait(&self) -> BatchReport {
        tokio::time::timeout(Duration::from_secs(10), self.notify.notified())
            .await
            .expect("batch did not complete");
        *self.reports.lock().unwrap().last().unwrap()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchCompletion for RecordingCompletion {
    async fn batch_completed(&self, report: BatchReport) {
        self.reports.lock().unwrap().push(report);
        self.notify.notify_one();
    }
}

// =============================================================================
// Engine harness
// =============================================================================

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub stores: Stores,
    pub platform: Arc<MockPlatform>,
    pub generator: Arc<HoldableGenerator>,
    pub channel: Arc<RecordingChannel>,
    pub queue: NotificationQueue,
    pub workers: WorkerPool,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_stores(Stores::in_memory())
    }

    pub fn with_stores(stores: Stores) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::default());
        let platform = Arc::new(MockPlatform::new());
        let channel = Arc::new(RecordingChannel::new());
        let generator = Arc::new(HoldableGenerator::new(TextCertificateGenerator::new(
            dir.path(),
            catalog.clone(),
            false,
        )));

        let (queue, workers) = NotificationQueue::start(
            channel.clone(),
            stores.jobs.clone(),
            QueueSettings {
                concurrency: 5,
                retry: fast_retry(),
            },
        );
        let notifier = Arc::new(AdminNotifier::new(
            queue.clone(),
            vec![TargetId(ADMIN)],
            stores.counter.clone(),
            catalog.scopes(),
        ));
        let verifier = Arc::new(EligibilityVerifier::new(
            platform.clone(),
            ClientCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
            VerifierSettings {
                retry: fast_retry(),
                call_timeout: Duration::from_secs(2),
                ..VerifierSettings::default()
            },
        ));

        let engine = WorkflowEngine::new(WorkflowDeps {
            sessions: stores.sessions.clone(),
            ledger: stores.ledger.clone(),
            counter: stores.counter.clone(),
            verifier,
            generator: generator.clone(),
            delivery: channel.clone(),
            notifier,
            catalog,
            links: ProfileLinkPattern::new(PROFILE_HOST).unwrap(),
            retry: fast_retry(),
        })
        .with_today(|| NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());

        Self {
            engine: Arc::new(engine),
            stores,
            platform,
            generator,
            channel,
            queue,
            workers,
            dir,
        }
    }

    /// Answer every question up to the confirmation step
    pub async fn fill(&self, requester: i64, offering: &str, account: u64) -> Reply {
        let requester = RequesterId(requester);
        let answers = [
            "Ivan Petrov".to_string(),
            "male".to_string(),
            offering.to_string(),
            "10.01.2025".to_string(),
            profile_link(account),
        ];
        let mut reply = self.engine.handle(requester, Action::Start).await;
        for answer in answers {
            reply = self.engine.handle(requester, Action::Submit(answer)).await;
        }
        reply
    }

    /// Fill the interview and confirm
    pub async fn apply(&self, requester: i64, offering: &str, account: u64) -> Reply {
        let reply = self.fill(requester, offering, account).await;
        assert!(matches!(reply, Reply::Confirm { .. }), "unexpected {:?}", reply);
        self.engine.handle(RequesterId(requester), Action::Done).await
    }
}

// =============================================================================
// HTTP test server
// =============================================================================

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub platform: Arc<MockPlatform>,
    pub channel: Arc<RecordingChannel>,
    pub workers: WorkerPool,
    pub dir: TempDir,
}

/// Create a test server around in-memory stores and mocks
pub fn create_test_app(config: Config) -> TestApp {
    let dir = TempDir::new().unwrap();
    let catalog = Catalog::default();
    let platform = Arc::new(MockPlatform::new());
    let channel = Arc::new(RecordingChannel::new());

    let (state, workers) = AppState::build(
        &config,
        catalog.clone(),
        Components {
            stores: Stores::in_memory(),
            platform: platform.clone(),
            generator: Arc::new(TextCertificateGenerator::new(
                dir.path(),
                Arc::new(catalog),
                false,
            )),
            delivery: channel.clone(),
        },
    )
    .expect("Failed to build state");
    let state = Arc::new(state);

    let app = routes::create_router(state.clone());
    let server = TestServer::new(app).expect("Failed to create test server");

    TestApp {
        server,
        state,
        platform,
        channel,
        workers,
        dir,
    }
}

/// Config suitable for route tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.admin_ids = vec![ADMIN];
    config.platform.profile_host = PROFILE_HOST.to_string();
    config.queue.base_delay_ms = 5;
    config.throttle.window_ms = 0;
    config
}

/// Today's date as requesters type it
pub fn today() -> String {
    chrono::Local::now().format("%d.%m.%Y").to_string()
}
