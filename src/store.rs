//! SQLite-backed state store.
//!
//! Tables:
//! - `credentials`: value, state, created_at, retired_at, remote_id
//! - `assignments`: peer_id, credential, issued_at (permanent audit trail)
//! - `cost_samples`: append-only spend entries, deduped by
//!   `(credential, bucket_start, description)`
//! - `checkpoint`: last fully merged report-window end (single row)
//! - `settings`: billing admin secret, gateway token hash
//!
//! All writes go through one `Mutex<Connection>` in WAL mode. Cost merges
//! and the checkpoint advance share a transaction, so a crash between fetch
//! and checkpoint leaves the checkpoint at its previous value and the next
//! cycle re-fetches a window the dedup key makes safe to replay.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings key holding the billing admin secret.
pub const SETTING_ADMIN_KEY: &str = "billing_admin_key";

/// Settings key holding the SHA-256 hash of the gateway bearer token.
pub const SETTING_GATEWAY_TOKEN_HASH: &str = "gateway_token_hash";

/// One persisted credential row.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub value: String,
    pub state: String,
    pub created_at: i64,
    pub retired_at: Option<i64>,
    pub remote_id: Option<String>,
}

/// One persisted assignment row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub peer_id: String,
    pub credential: String,
    pub issued_at: i64,
}

/// One dated, attributed spend entry for a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    pub credential: String,
    pub bucket_start: i64,
    pub bucket_end: i64,
    pub amount: f64,
    pub currency: String,
    pub description: String,
}

/// SQLite-backed store for all durable daemon state.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the state database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                value TEXT PRIMARY KEY,
                state TEXT NOT NULL CHECK (state IN ('active', 'retired', 'deleted')),
                created_at INTEGER NOT NULL,
                retired_at INTEGER,
                remote_id TEXT
            );

            CREATE TABLE IF NOT EXISTS assignments (
                peer_id TEXT PRIMARY KEY,
                credential TEXT NOT NULL,
                issued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_assignments_credential
                ON assignments(credential);

            CREATE TABLE IF NOT EXISTS cost_samples (
                credential TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                bucket_end INTEGER NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                PRIMARY KEY (credential, bucket_start, description)
            );
            CREATE INDEX IF NOT EXISTS idx_cost_samples_start
                ON cost_samples(bucket_start);

            CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_bucket_end INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ── Credentials ─────────────────────────────────────────────────

    pub fn insert_credential(
        &self,
        value: &str,
        created_at: i64,
        remote_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO credentials (value, state, created_at, remote_id)
             VALUES (?1, 'active', ?2, ?3)",
            params![value, created_at, remote_id],
        )?;
        Ok(())
    }

    pub fn mark_retired(&self, value: &str, retired_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE credentials SET state = 'retired', retired_at = ?2 WHERE value = ?1",
            params![value, retired_at],
        )?;
        Ok(())
    }

    pub fn mark_deleted(&self, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE credentials SET state = 'deleted' WHERE value = ?1",
            params![value],
        )?;
        Ok(())
    }

    /// All credential rows, including deleted ones.
    pub fn load_credentials(&self) -> Result<Vec<CredentialRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT value, state, created_at, retired_at, remote_id
             FROM credentials ORDER BY created_at ASC, value ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CredentialRow {
                    value: row.get(0)?,
                    state: row.get(1)?,
                    created_at: row.get(2)?,
                    retired_at: row.get(3)?,
                    remote_id: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Assignments ─────────────────────────────────────────────────

    /// Record a peer's one-time issuance. The primary key on `peer_id`
    /// makes a duplicate insert fail loudly instead of overwriting history.
    pub fn insert_assignment(&self, peer_id: &str, credential: &str, issued_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO assignments (peer_id, credential, issued_at) VALUES (?1, ?2, ?3)",
            params![peer_id, credential, issued_at],
        )?;
        Ok(())
    }

    pub fn load_assignments(&self) -> Result<Vec<AssignmentRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT peer_id, credential, issued_at FROM assignments ORDER BY issued_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AssignmentRow {
                    peer_id: row.get(0)?,
                    credential: row.get(1)?,
                    issued_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Cost samples & checkpoint ───────────────────────────────────

    /// Merge a batch of samples and advance the checkpoint, atomically.
    ///
    /// Rows whose `(credential, bucket_start, description)` key already
    /// exists are skipped, never overwritten, so re-merging an overlapping
    /// window is a no-op. Returns the number of rows actually inserted.
    pub fn merge_samples(&self, samples: &[CostSample], window_end: i64) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO cost_samples
                 (credential, bucket_start, bucket_end, amount, currency, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for sample in samples {
                inserted += stmt.execute(params![
                    sample.credential,
                    sample.bucket_start,
                    sample.bucket_end,
                    sample.amount,
                    sample.currency,
                    sample.description,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO checkpoint (id, last_bucket_end) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_bucket_end = excluded.last_bucket_end",
            params![window_end],
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    /// The end of the last fully merged report window, if any cycle has
    /// ever completed.
    pub fn checkpoint(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT last_bucket_end FROM checkpoint WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Samples for one credential, optionally bounded by bucket start.
    pub fn samples_for(
        &self,
        credential: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<CostSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential, bucket_start, bucket_end, amount, currency, description
             FROM cost_samples
             WHERE credential = ?1 AND bucket_start >= ?2 AND bucket_start <= ?3
             ORDER BY bucket_start ASC",
        )?;
        let rows = stmt
            .query_map(
                params![credential, start.unwrap_or(i64::MIN), end.unwrap_or(i64::MAX)],
                Self::sample_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All samples across credentials, oldest first.
    pub fn all_samples(&self, start: Option<i64>, end: Option<i64>) -> Result<Vec<CostSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential, bucket_start, bucket_end, amount, currency, description
             FROM cost_samples
             WHERE bucket_start >= ?1 AND bucket_start <= ?2
             ORDER BY bucket_start ASC",
        )?;
        let rows = stmt
            .query_map(
                params![start.unwrap_or(i64::MIN), end.unwrap_or(i64::MAX)],
                Self::sample_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cumulative spend per credential, largest first.
    pub fn totals_by_credential(
        &self,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential, COALESCE(SUM(amount), 0.0)
             FROM cost_samples
             WHERE bucket_start >= ?1 AND bucket_start <= ?2
             GROUP BY credential ORDER BY SUM(amount) DESC",
        )?;
        let rows = stmt
            .query_map(
                params![start.unwrap_or(i64::MIN), end.unwrap_or(i64::MAX)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cumulative spend for one credential over its full history.
    pub fn total_for(&self, credential: &str) -> Result<f64> {
        let conn = self.conn.lock();
        let total = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM cost_samples WHERE credential = ?1",
            params![credential],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Drop all accumulated cost history and the checkpoint.
    pub fn clear_costs(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM cost_samples; DELETE FROM checkpoint;")?;
        Ok(())
    }

    fn sample_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostSample> {
        Ok(CostSample {
            credential: row.get(0)?,
            bucket_start: row.get(1)?,
            bucket_end: row.get(2)?,
            amount: row.get(3)?,
            currency: row.get(4)?,
            description: row.get(5)?,
        })
    }

    // ── Settings ────────────────────────────────────────────────────

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}
