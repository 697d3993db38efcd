//! libSQL implementation of the async `Ledger` trait.
//!
//! Supports local file and in-memory databases. Multi-statement writes run
//! in an explicit transaction that is rolled back on any failure; single
//! statements rely on SQLite's implicit per-statement transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::mailbox::types::normalize_address;
use crate::pipeline::types::Priority;
use crate::store::migrations;
use crate::store::traits::{
    BlockedSender, Ledger, ListChange, MessageOutcome, RunSummary, TriageRecord, TriageStatus,
    VipSender, VipSource,
};

/// libSQL-backed triage ledger.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db)?;
        ledger.init_schema().await?;
        info!(path = %path.display(), "State database opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let ledger = Self::from_database(db)?;
        ledger.init_schema().await?;
        Ok(ledger)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width and UTC, so text order is time
/// order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Naive layouts read as UTC: SQLite `datetime()` output and offset-less
/// ISO 8601 from older state DBs.
const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// Stored timestamp to UTC. Unreadable values sort first.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    NAIVE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map_or(DateTime::<Utc>::MIN_UTC, |ndt| ndt.and_utc())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Normalise an address for a list operation; `None` when it is not one.
fn list_address(raw: &str) -> Option<String> {
    let address = normalize_address(raw);
    address.contains('@').then_some(address)
}

const TRIAGE_COLUMNS: &str = "email_id, subject, sender, sender_email, received_at, priority, actionable, reason, summary, reply_text, drafted, draft_id, status, error, raw_email, first_seen_at, last_seen_at, updated_at";

/// Map a libsql Row to a TriageRecord. Column order matches TRIAGE_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<TriageRecord, libsql::Error> {
    let text = |i: i32| row.get::<String>(i).unwrap_or_default();
    let received_str: Option<String> = row.get(4).ok();
    let status_str: String = row.get(12)?;

    Ok(TriageRecord {
        email_id: row.get(0)?,
        subject: text(1),
        sender: text(2),
        sender_email: text(3),
        received_at: received_str
            .filter(|s| !s.is_empty())
            .map(|s| parse_datetime(&s)),
        priority: text(5).parse().unwrap_or(Priority::Medium),
        actionable: row.get::<i64>(6).unwrap_or(0) != 0,
        reason: text(7),
        summary: text(8),
        reply_text: text(9),
        drafted: row.get::<i64>(10).unwrap_or(0) != 0,
        draft_id: row.get::<String>(11).ok().filter(|s| !s.is_empty()),
        status: status_str.parse().unwrap_or(TriageStatus::Triaged),
        error: row.get::<String>(13).ok(),
        raw_email: row.get::<String>(14).ok(),
        first_seen_at: parse_datetime(&text(15)),
        last_seen_at: parse_datetime(&text(16)),
        updated_at: parse_datetime(&text(17)),
    })
}

/// Details payload stored in `triage_runs.details`.
#[derive(serde::Serialize, serde::Deserialize)]
struct RunDetails {
    #[serde(default)]
    archived_count: u32,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    messages: Vec<MessageOutcome>,
}

async fn upsert_in(conn: &Connection, record: &TriageRecord) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO triage_state ({TRIAGE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
             ON CONFLICT(email_id) DO UPDATE SET \
                subject = excluded.subject, \
                sender = excluded.sender, \
                sender_email = excluded.sender_email, \
                received_at = excluded.received_at, \
                priority = excluded.priority, \
                actionable = excluded.actionable, \
                reason = excluded.reason, \
                summary = excluded.summary, \
                reply_text = excluded.reply_text, \
                drafted = excluded.drafted, \
                draft_id = COALESCE(triage_state.draft_id, excluded.draft_id), \
                status = excluded.status, \
                error = excluded.error, \
                raw_email = excluded.raw_email, \
                last_seen_at = MAX(triage_state.last_seen_at, excluded.last_seen_at), \
                updated_at = MAX(triage_state.updated_at, excluded.updated_at)"
        ),
        params![
            record.email_id.clone(),
            record.subject.clone(),
            record.sender.clone(),
            record.sender_email.clone(),
            opt_text_owned(record.received_at.as_ref().map(fmt_ts)),
            record.priority.as_str(),
            i64::from(record.actionable),
            record.reason.clone(),
            record.summary.clone(),
            record.reply_text.clone(),
            i64::from(record.drafted),
            opt_text(record.draft_id.as_deref()),
            record.status.as_str(),
            opt_text(record.error.as_deref()),
            opt_text(record.raw_email.as_deref()),
            fmt_ts(&record.first_seen_at),
            fmt_ts(&record.last_seen_at),
            fmt_ts(&record.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("upsert_record: {e}")))?;
    Ok(())
}

async fn insert_vip(
    conn: &Connection,
    address: &str,
    source: VipSource,
) -> Result<ListChange, DatabaseError> {
    let Some(address) = list_address(address) else {
        return Ok(ListChange::Invalid);
    };
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO vip_senders (address, source, created_at) VALUES (?1, ?2, ?3)",
            params![address, source.as_str(), fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_vip: {e}")))?;
    Ok(if inserted > 0 {
        ListChange::Added
    } else {
        ListChange::AlreadyPresent
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn get_record(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TRIAGE_COLUMNS} FROM triage_state WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_record row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn upsert_record(&self, record: &TriageRecord) -> Result<(), DatabaseError> {
        upsert_in(self.conn(), record).await
    }

    async fn commit_triage(
        &self,
        record: &TriageRecord,
        promote_vip: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("begin: {e}")))?;

        let result = async {
            upsert_in(&tx, record).await?;
            if let Some(address) = promote_vip {
                insert_vip(&tx, address, VipSource::AutoFrequency).await?;
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Transaction(format!("commit: {e}")))?;
                debug!(email_id = %record.email_id, status = %record.status, "Triage committed");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn touch_record(&self, email_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE triage_state SET last_seen_at = MAX(last_seen_at, ?1) WHERE email_id = ?2",
                params![fmt_ts(&Utc::now()), email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_record: {e}")))?;
        Ok(())
    }

    async fn count_high_priority(
        &self,
        sender_email: &str,
        exclude_id: &str,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM triage_state \
                 WHERE sender_email = ?1 AND priority = 'high' AND email_id != ?2",
                params![normalize_address(sender_email), exclude_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_high_priority: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_high_priority: {e}"))),
        }
    }

    async fn reset_all_to_triaged(&self) -> Result<u64, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE triage_state SET status = 'triaged', updated_at = MAX(updated_at, ?1)",
                params![fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_all_to_triaged: {e}")))?;
        info!(updated, "Reset all triage records to triaged");
        Ok(updated)
    }

    async fn list_vips(&self) -> Result<Vec<VipSender>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, source, created_at FROM vip_senders ORDER BY address",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_vips: {e}")))?;

        let mut vips = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let address: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("list_vips row: {e}")))?;
                    let source: String = row.get(1).unwrap_or_else(|_| "manual".into());
                    let created: String = row.get(2).unwrap_or_default();
                    vips.push(VipSender {
                        address,
                        source: source.parse().unwrap_or(VipSource::Manual),
                        created_at: parse_datetime(&created),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_vips: {e}"))),
            }
        }
        Ok(vips)
    }

    async fn add_vip(&self, address: &str, source: VipSource) -> Result<ListChange, DatabaseError> {
        insert_vip(self.conn(), address, source).await
    }

    async fn remove_vip(&self, address: &str) -> Result<ListChange, DatabaseError> {
        let Some(address) = list_address(address) else {
            return Ok(ListChange::Invalid);
        };
        let deleted = self
            .conn()
            .execute("DELETE FROM vip_senders WHERE address = ?1", params![address])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_vip: {e}")))?;
        Ok(if deleted > 0 {
            ListChange::Removed
        } else {
            ListChange::NotPresent
        })
    }

    async fn list_blocked(&self) -> Result<Vec<BlockedSender>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, created_at FROM draft_blocked_senders ORDER BY address",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_blocked: {e}")))?;

        let mut blocked = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let address: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("list_blocked row: {e}")))?;
                    let created: String = row.get(1).unwrap_or_default();
                    blocked.push(BlockedSender {
                        address,
                        created_at: parse_datetime(&created),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_blocked: {e}"))),
            }
        }
        Ok(blocked)
    }

    async fn add_blocked(&self, address: &str) -> Result<ListChange, DatabaseError> {
        let Some(address) = list_address(address) else {
            return Ok(ListChange::Invalid);
        };
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO draft_blocked_senders (address, created_at) VALUES (?1, ?2)",
                params![address, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_blocked: {e}")))?;
        Ok(if inserted > 0 {
            ListChange::Added
        } else {
            ListChange::AlreadyPresent
        })
    }

    async fn remove_blocked(&self, address: &str) -> Result<ListChange, DatabaseError> {
        let Some(address) = list_address(address) else {
            return Ok(ListChange::Invalid);
        };
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM draft_blocked_senders WHERE address = ?1",
                params![address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_blocked: {e}")))?;
        Ok(if deleted > 0 {
            ListChange::Removed
        } else {
            ListChange::NotPresent
        })
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<i64, DatabaseError> {
        let details = serde_json::to_string(&RunDetails {
            archived_count: summary.archived_count,
            interrupted: summary.interrupted,
            messages: summary.details.clone(),
        })
        .map_err(|e| DatabaseError::Serialization(format!("run details: {e}")))?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO triage_runs (run_at, mode, emails_seen, triaged_count, drafted_count, skipped_count, error_count, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fmt_ts(&summary.run_at),
                summary.mode.clone(),
                i64::from(summary.emails_seen),
                i64::from(summary.triaged_count),
                i64::from(summary.drafted_count),
                i64::from(summary.skipped_count),
                i64::from(summary.error_count),
                details,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_run: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(run_id = id, mode = %summary.mode, "Run recorded");
        Ok(id)
    }

    async fn latest_run(&self) -> Result<Option<RunSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, run_at, mode, emails_seen, triaged_count, drafted_count, skipped_count, error_count, details \
                 FROM triage_runs ORDER BY id DESC LIMIT 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_run: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("latest_run: {e}"))),
        };

        let count = |i: i32| u32::try_from(row.get::<i64>(i).unwrap_or(0)).unwrap_or(0);
        let details: Option<RunDetails> = row
            .get::<String>(8)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let details = details.unwrap_or(RunDetails {
            archived_count: 0,
            interrupted: false,
            messages: Vec::new(),
        });
        let run_at: String = row.get(1).unwrap_or_default();

        Ok(Some(RunSummary {
            id: row.get::<i64>(0).ok(),
            run_at: parse_datetime(&run_at),
            mode: row.get(2).unwrap_or_default(),
            emails_seen: count(3),
            triaged_count: count(4),
            drafted_count: count(5),
            archived_count: details.archived_count,
            skipped_count: count(6),
            error_count: count(7),
            interrupted: details.interrupted,
            details: details.messages,
        }))
    }
}
