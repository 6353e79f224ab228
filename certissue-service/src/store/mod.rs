//! Storage abstractions for the service

pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::{InMemoryCounter, InMemoryJobStore, InMemoryLedger, InMemorySessionStore};
pub use models::*;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use certissue_core::{
    BindOutcome, CounterScope, ExternalAccountId, IdentityBinding, Interview, OfferingId,
    RequesterId, Serial,
};

use crate::error::ServiceError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, ServiceError>;

/// Trait for per-requester interview state
pub trait SessionStore: Send + Sync {
    /// Get the session for a requester
    fn get(&self, requester: RequesterId) -> StoreResult<Option<Session>>;

    /// Replace the requester's interview state
    fn update(&self, requester: RequesterId, interview: Interview) -> StoreResult<()>;

    /// Drop everything held for a requester
    fn clear(&self, requester: RequesterId) -> StoreResult<()>;
}

/// Trait for the durable requester/account ledger
pub trait IdentityLedger: Send + Sync {
    /// Binding for (requester, offering)
    fn lookup_binding(
        &self,
        requester: RequesterId,
        offering: &OfferingId,
    ) -> StoreResult<Option<IdentityBinding>>;

    /// Binding for (offering, account)
    fn lookup_account(
        &self,
        offering: &OfferingId,
        account: ExternalAccountId,
    ) -> StoreResult<Option<IdentityBinding>>;

    /// Atomically bind, unless either side is already taken
    ///
    /// Re-binding the same (requester, offering, account) is a no-op that
    /// returns the stored binding with its original serial.
    fn try_bind(&self, binding: IdentityBinding) -> StoreResult<BindOutcome>;

    /// Every requester holding at least one binding
    fn requesters(&self) -> StoreResult<Vec<RequesterId>>;

    /// Number of bindings per offering
    fn count_by_offering(&self) -> StoreResult<Vec<(OfferingId, u64)>>;
}

/// Trait for named, monotonically increasing serial counters
pub trait IssuanceCounter: Send + Sync {
    /// Atomically increment and return the new value
    fn increment(&self, scope: &CounterScope) -> StoreResult<Serial>;

    /// Current value (0 if never incremented)
    fn current(&self, scope: &CounterScope) -> StoreResult<u64>;
}

/// Trait for durable notification jobs
pub trait JobStore: Send + Sync {
    /// Persist a newly enqueued job
    fn insert_job(&self, job: &NotificationJob) -> StoreResult<()>;

    /// Persist updated attempt counters
    fn record_attempt(&self, job: &NotificationJob) -> StoreResult<()>;

    /// Mark a job terminal; it will not be recovered again
    fn finish_job(&self, id: JobId, outcome: JobOutcome) -> StoreResult<()>;

    /// Jobs not yet terminal, oldest first
    fn pending_jobs(&self) -> StoreResult<Vec<NotificationJob>>;
}

/// One handle per storage concern
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn IdentityLedger>,
    pub counter: Arc<dyn IssuanceCounter>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    /// Volatile stores, for development and tests
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            counter: Arc::new(InMemoryCounter::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
        }
    }

    /// Every concern backed by one SQLite database
    pub fn sqlite(path: &str) -> Result<Self, ServiceError> {
        let store = Arc::new(SqliteStore::open(path)?);
        Ok(Self {
            sessions: store.clone(),
            ledger: store.clone(),
            counter: store.clone(),
            jobs: store,
        })
    }
}
