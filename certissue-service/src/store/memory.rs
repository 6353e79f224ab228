//! In-memory storage implementations

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use certissue_core::binding::classify;
use certissue_core::{
    BindOutcome, CounterScope, ExternalAccountId, IdentityBinding, Interview, OfferingId,
    RequesterId, Serial,
};
use chrono::Utc;

use super::{
    IdentityLedger, IssuanceCounter, JobId, JobOutcome, JobStore, NotificationJob, Session,
    SessionStore, StoreResult,
};

/// In-memory session store
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<RequesterId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, requester: RequesterId) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().unwrap().get(&requester).cloned())
    }

    fn update(&self, requester: RequesterId, interview: Interview) -> StoreResult<()> {
        let session = Session {
            requester,
            interview,
            updated_at: Utc::now(),
        };
        self.sessions.write().unwrap().insert(requester, session);
        Ok(())
    }

    fn clear(&self, requester: RequesterId) -> StoreResult<()> {
        self.sessions.write().unwrap().remove(&requester);
        Ok(())
    }
}

#[derive(Default)]
struct LedgerMaps {
    by_requester: HashMap<(OfferingId, RequesterId), IdentityBinding>,
    by_account: HashMap<(OfferingId, ExternalAccountId), RequesterId>,
}

/// In-memory identity ledger
///
/// Both indexes live behind one lock so `try_bind` checks and writes them
/// as a single step.
pub struct InMemoryLedger {
    maps: RwLock<LedgerMaps>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(LedgerMaps::default()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityLedger for InMemoryLedger {
    fn lookup_binding(
        &self,
        requester: RequesterId,
        offering: &OfferingId,
    ) -> StoreResult<Option<IdentityBinding>> {
        let maps = self.maps.read().unwrap();
        Ok(maps
            .by_requester
            .get(&(offering.clone(), requester))
            .cloned())
    }

    fn lookup_account(
        &self,
        offering: &OfferingId,
        account: ExternalAccountId,
    ) -> StoreResult<Option<IdentityBinding>> {
        let maps = self.maps.read().unwrap();
        Ok(maps
            .by_account
            .get(&(offering.clone(), account))
            .and_then(|requester| maps.by_requester.get(&(offering.clone(), *requester)))
            .cloned())
    }

    fn try_bind(&self, binding: IdentityBinding) -> StoreResult<BindOutcome> {
        let mut maps = self.maps.write().unwrap();
        let requester_key = (binding.offering.clone(), binding.requester);
        let account_key = (binding.offering.clone(), binding.account);

        let by_requester = maps.by_requester.get(&requester_key);
        let by_account = maps
            .by_account
            .get(&account_key)
            .and_then(|r| maps.by_requester.get(&(binding.offering.clone(), *r)));
        if let Some(outcome) =
            classify(binding.requester, binding.account, by_requester, by_account)
        {
            return Ok(outcome);
        }

        maps.by_account.insert(account_key, binding.requester);
        maps.by_requester.insert(requester_key, binding.clone());
        Ok(BindOutcome::Bound(binding))
    }

    fn requesters(&self) -> StoreResult<Vec<RequesterId>> {
        let maps = self.maps.read().unwrap();
        let unique: BTreeSet<RequesterId> = maps.by_requester.keys().map(|(_, r)| *r).collect();
        Ok(unique.into_iter().collect())
    }

    fn count_by_offering(&self) -> StoreResult<Vec<(OfferingId, u64)>> {
        let maps = self.maps.read().unwrap();
        let mut counts: BTreeMap<OfferingId, u64> = BTreeMap::new();
        for (offering, _) in maps.by_requester.keys() {
            *counts.entry(offering.clone()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

/// In-memory issuance counter
pub struct InMemoryCounter {
    values: Mutex<HashMap<String, u64>>,
}

impl InMemoryCounter {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl IssuanceCounter for InMemoryCounter {
    fn increment(&self, scope: &CounterScope) -> StoreResult<Serial> {
        let mut values = self.values.lock().unwrap();
        let value = values.entry(scope.key()).or_default();
        *value += 1;
        Ok(Serial(*value))
    }

    fn current(&self, scope: &CounterScope) -> StoreResult<u64> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&scope.key())
            .copied()
            .unwrap_or(0))
    }
}

/// In-memory job store
///
/// Keeps only jobs that have not reached a terminal outcome.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, NotificationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: &NotificationJob) -> StoreResult<()> {
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    fn record_attempt(&self, job: &NotificationJob) -> StoreResult<()> {
        if let Some(stored) = self.jobs.write().unwrap().get_mut(&job.id) {
            stored.attempt_count = job.attempt_count;
            stored.rate_limited_count = job.rate_limited_count;
        }
        Ok(())
    }

    fn finish_job(&self, id: JobId, _outcome: JobOutcome) -> StoreResult<()> {
        self.jobs.write().unwrap().remove(&id);
        Ok(())
    }

    fn pending_jobs(&self) -> StoreResult<Vec<NotificationJob>> {
        let mut jobs: Vec<NotificationJob> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
