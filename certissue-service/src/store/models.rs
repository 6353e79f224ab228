//! Data models for service storage

use std::fmt;
use std::path::PathBuf;

use certissue_core::{Interview, RequesterId, TargetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Interview state held for one requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub requester: RequesterId,
    pub interview: Interview,
    pub updated_at: DateTime<Utc>,
}

/// Unique notification job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique batch identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a notification carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text { text: String },
    Document { path: PathBuf, caption: String },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text { text: text.into() }
    }
}

/// Terminal state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Delivered => "delivered",
            JobOutcome::Failed => "failed",
        }
    }
}

/// One queued notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationJob {
    pub id: JobId,
    pub target: TargetId,
    pub payload: Payload,
    /// Generic failures so far
    pub attempt_count: u32,
    /// Rate-limit deferrals so far (tracked apart from generic failures)
    pub rate_limited_count: u32,
    pub max_attempts: u32,
    pub batch: Option<BatchId>,
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(target: TargetId, payload: Payload, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            target,
            payload,
            attempt_count: 0,
            rate_limited_count: 0,
            max_attempts,
            batch: None,
            created_at: Utc::now(),
        }
    }

    pub fn in_batch(mut self, batch: BatchId) -> Self {
        self.batch = Some(batch);
        self
    }
}
