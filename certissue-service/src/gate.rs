//! Admission control in front of the workflow
//!
//! Operators always pass. Everyone else is turned away during maintenance
//! and throttled when sending actions too quickly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use certissue_core::RequesterId;

/// What to do with one incoming action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Refuse and tell the requester to slow down
    Warn,
    /// Refuse silently
    Drop,
}

pub trait RateLimiter: Send + Sync {
    fn admit(&self, requester: RequesterId) -> Admission;
}

/// Never throttles
pub struct NoRateLimit;

impl RateLimiter for NoRateLimit {
    fn admit(&self, _requester: RequesterId) -> Admission {
        Admission::Allow
    }
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    /// Seen once inside the window
    Recent(Instant),
    /// Warned; everything is dropped until the cooldown ends
    Warned(Instant),
}

/// Expiring per-requester marks
///
/// A second action inside `window` is warned and starts a `cooldown`
/// during which further actions are dropped.
pub struct TtlRateLimiter {
    window: Duration,
    cooldown: Duration,
    marks: Mutex<HashMap<RequesterId, Mark>>,
}

impl TtlRateLimiter {
    pub fn new(window: Duration, cooldown: Duration) -> Self {
        Self {
            window,
            cooldown,
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn admit_at(&self, requester: RequesterId, now: Instant) -> Admission {
        let mut marks = self.marks.lock().unwrap();
        marks.retain(|_, mark| match mark {
            Mark::Recent(expires) | Mark::Warned(expires) => *expires > now,
        });

        match marks.get(&requester).copied() {
            None => {
                marks.insert(requester, Mark::Recent(now + self.window));
                Admission::Allow
            }
            Some(Mark::Recent(_)) => {
                marks.insert(requester, Mark::Warned(now + self.cooldown));
                tracing::info!(requester = %requester, "Requester throttled");
                Admission::Warn
            }
            Some(Mark::Warned(_)) => Admission::Drop,
        }
    }
}

impl RateLimiter for TtlRateLimiter {
    fn admit(&self, requester: RequesterId) -> Admission {
        self.admit_at(requester, Instant::now())
    }
}

/// Maintenance switch toggled by operators
#[derive(Debug, Default)]
pub struct Maintenance {
    enabled: AtomicBool,
}

impl Maintenance {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "Maintenance mode changed");
    }
}
