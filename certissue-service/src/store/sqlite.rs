//! SQLite-based storage implementation

use std::sync::Mutex;
use std::time::Duration;

use certissue_core::binding::classify;
use certissue_core::{
    BindOutcome, CounterScope, ExternalAccountId, FullName, IdentityBinding, Interview,
    OfferingId, RequesterId, Serial, TargetId,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    BatchId, IdentityLedger, IssuanceCounter, JobId, JobOutcome, JobStore, NotificationJob,
    Session, SessionStore, StoreResult,
};
use crate::error::ServiceError;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const BINDING_COLUMNS: &str =
    "requester_id, offering_id, account_id, serial, full_name, template_ref, issued_at";

/// SQLite-based store implementing every storage trait
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path
    pub fn open(path: &str) -> Result<Self, ServiceError> {
        let conn = Connection::open(path)?;

        conn.busy_timeout(Duration::from_secs(5))?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run database migrations
    fn migrate(conn: &Connection) -> Result<(), ServiceError> {
        let current_version = Self::get_schema_version(conn)?;

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                current = current_version,
                target = SCHEMA_VERSION,
                "Running database migrations"
            );

            if current_version < 1 {
                Self::migrate_v1(conn)?;
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;

            tracing::info!("Database migrations complete");
        }

        Ok(())
    }

    /// Get current schema version (0 if no schema exists)
    fn get_schema_version(conn: &Connection) -> Result<i32, ServiceError> {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'
             )",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0).map(|v| v.unwrap_or(0))
        })?)
    }

    /// Migration to version 1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<(), ServiceError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- One row per requester with an interview in progress
            CREATE TABLE IF NOT EXISTS sessions (
                requester_id INTEGER PRIMARY KEY,
                interview TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Identity ledger, per offering: one account per requester, one requester per account
            CREATE TABLE IF NOT EXISTS bindings (
                offering_id TEXT NOT NULL,
                requester_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                serial INTEGER NOT NULL,
                full_name TEXT NOT NULL,
                template_ref TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                PRIMARY KEY (offering_id, requester_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_account
                ON bindings(offering_id, account_id);

            CREATE TABLE IF NOT EXISTS counters (
                scope TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                target_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                rate_limited_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                batch_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )?;

        Ok(())
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityBinding> {
    let issued_at: String = row.get(6)?;
    Ok(IdentityBinding {
        requester: RequesterId(row.get(0)?),
        offering: OfferingId(row.get(1)?),
        account: ExternalAccountId(row.get::<_, i64>(2)? as u64),
        serial: Serial(row.get::<_, i64>(3)? as u64),
        full_name: FullName(row.get(4)?),
        template_ref: row.get(5)?,
        issued_at: parse_time(&issued_at),
    })
}

fn lookup_by_requester(
    conn: &Connection,
    requester: RequesterId,
    offering: &OfferingId,
) -> rusqlite::Result<Option<IdentityBinding>> {
    conn.query_row(
        &format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE offering_id = ?1 AND requester_id = ?2"
        ),
        params![offering.as_str(), requester.0],
        binding_from_row,
    )
    .optional()
}

fn lookup_by_account(
    conn: &Connection,
    offering: &OfferingId,
    account: ExternalAccountId,
) -> rusqlite::Result<Option<IdentityBinding>> {
    conn.query_row(
        &format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE offering_id = ?1 AND account_id = ?2"
        ),
        params![offering.as_str(), account.0 as i64],
        binding_from_row,
    )
    .optional()
}

impl SessionStore for SqliteStore {
    fn get(&self, requester: RequesterId) -> StoreResult<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT interview, updated_at FROM sessions WHERE requester_id = ?1",
                params![requester.0],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((interview, updated_at)) => {
                let interview: Interview = serde_json::from_str(&interview)?;
                Ok(Some(Session {
                    requester,
                    interview,
                    updated_at: parse_time(&updated_at),
                }))
            }
            None => Ok(None),
        }
    }

    fn update(&self, requester: RequesterId, interview: Interview) -> StoreResult<()> {
        let encoded = serde_json::to_string(&interview)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (requester_id, interview, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(requester_id) DO UPDATE
             SET interview = excluded.interview, updated_at = excluded.updated_at",
            params![requester.0, encoded, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn clear(&self, requester: RequesterId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sessions WHERE requester_id = ?1",
            params![requester.0],
        )?;
        Ok(())
    }
}

impl IdentityLedger for SqliteStore {
    fn lookup_binding(
        &self,
        requester: RequesterId,
        offering: &OfferingId,
    ) -> StoreResult<Option<IdentityBinding>> {
        let conn = self.conn.lock().unwrap();
        Ok(lookup_by_requester(&conn, requester, offering)?)
    }

    fn lookup_account(
        &self,
        offering: &OfferingId,
        account: ExternalAccountId,
    ) -> StoreResult<Option<IdentityBinding>> {
        let conn = self.conn.lock().unwrap();
        Ok(lookup_by_account(&conn, offering, account)?)
    }

    fn try_bind(&self, binding: IdentityBinding) -> StoreResult<BindOutcome> {
        let conn = self.conn.lock().unwrap();

        // The insert is the check: either unique key taken means the bind lost
        let inserted = conn.execute(
            &format!(
                "INSERT INTO bindings ({BINDING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                binding.requester.0,
                binding.offering.as_str(),
                binding.account.0 as i64,
                binding.serial.0 as i64,
                binding.full_name.as_str(),
                binding.template_ref,
                binding.issued_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(BindOutcome::Bound(binding)),
            Err(rusqlite::Error::SqliteFailure(ref err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let by_requester =
                    lookup_by_requester(&conn, binding.requester, &binding.offering)?;
                let by_account = lookup_by_account(&conn, &binding.offering, binding.account)?;
                classify(
                    binding.requester,
                    binding.account,
                    by_requester.as_ref(),
                    by_account.as_ref(),
                )
                .ok_or_else(|| {
                    ServiceError::Internal(
                        "binding constraint violated with no existing row".into(),
                    )
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn requesters(&self) -> StoreResult<Vec<RequesterId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT requester_id FROM bindings ORDER BY requester_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(RequesterId))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count_by_offering(&self) -> StoreResult<Vec<(OfferingId, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT offering_id, COUNT(*) FROM bindings GROUP BY offering_id ORDER BY offering_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((OfferingId(row.get(0)?), row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl IssuanceCounter for SqliteStore {
    fn increment(&self, scope: &CounterScope) -> StoreResult<Serial> {
        let conn = self.conn.lock().unwrap();
        let value: i64 = conn.query_row(
            "INSERT INTO counters (scope, value) VALUES (?1, 1)
             ON CONFLICT(scope) DO UPDATE SET value = value + 1
             RETURNING value",
            params![scope.key()],
            |row| row.get(0),
        )?;
        Ok(Serial(value as u64))
    }

    fn current(&self, scope: &CounterScope) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM counters WHERE scope = ?1",
                params![scope.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationJob> {
    let id: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let batch: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(NotificationJob {
        id: JobId(Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?),
        target: TargetId(row.get(1)?),
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e))?,
        attempt_count: row.get(3)?,
        rate_limited_count: row.get(4)?,
        max_attempts: row.get(5)?,
        batch: batch
            .map(|b| Uuid::parse_str(&b).map(BatchId))
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
        created_at: parse_time(&created_at),
    })
}

impl JobStore for SqliteStore {
    fn insert_job(&self, job: &NotificationJob) -> StoreResult<()> {
        let payload = serde_json::to_string(&job.payload)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (
                id, target_id, payload, attempt_count, rate_limited_count,
                max_attempts, batch_id, status, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                job.id.0.to_string(),
                job.target.0,
                payload,
                job.attempt_count,
                job.rate_limited_count,
                job.max_attempts,
                job.batch.map(|b| b.0.to_string()),
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_attempt(&self, job: &NotificationJob) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET attempt_count = ?1, rate_limited_count = ?2 WHERE id = ?3",
            params![job.attempt_count, job.rate_limited_count, job.id.0.to_string()],
        )?;
        Ok(())
    }

    fn finish_job(&self, id: JobId, outcome: JobOutcome) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![outcome.as_str(), Utc::now().to_rfc3339(), id.0.to_string()],
        )?;
        Ok(())
    }

    fn pending_jobs(&self) -> StoreResult<Vec<NotificationJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, payload, attempt_count, rate_limited_count,
                    max_attempts, batch_id, created_at
             FROM jobs WHERE status = 'pending' ORDER BY created_at",
        )?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}
