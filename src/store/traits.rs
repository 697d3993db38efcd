//! `Ledger` trait and the records it owns.
//!
//! The ledger is the only cross-cycle state. The engine consults it before
//! every message and writes one transaction per message.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::{Priority, VerdictSource};

// ── Triage status ───────────────────────────────────────────────────

/// Lifecycle state of a message.
///
/// `Drafted`, `Archived` and `Skipped` are settled and skipped on later
/// cycles unless reprocessing is forced. `Error` is retried by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    Triaged,
    Drafted,
    Archived,
    Skipped,
    Error,
}

impl TriageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triaged => "triaged",
            Self::Drafted => "drafted",
            Self::Archived => "archived",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Whether a record in this state is left alone by a normal cycle.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Drafted | Self::Archived | Self::Skipped)
    }
}

impl fmt::Display for TriageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triaged" => Ok(Self::Triaged),
            "drafted" => Ok(Self::Drafted),
            "archived" => Ok(Self::Archived),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown triage status: '{other}'")),
        }
    }
}

// ── Triage record ───────────────────────────────────────────────────

/// One row of `triage_state`, keyed by message identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageRecord {
    pub email_id: String,
    pub subject: String,
    /// Sender as displayed (`Name <addr>`).
    pub sender: String,
    /// Normalised sender address.
    pub sender_email: String,
    pub received_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub actionable: bool,
    pub reason: String,
    pub summary: String,
    pub reply_text: String,
    pub drafted: bool,
    /// Set once, when a reply draft is created. Never cleared.
    pub draft_id: Option<String>,
    pub status: TriageStatus,
    pub error: Option<String>,
    /// JSON snapshot of the message at last processing.
    pub raw_email: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Sender lists ────────────────────────────────────────────────────

/// How a sender became a VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VipSource {
    Manual,
    AutoFrequency,
    /// Seeded from `triage.vip_senders`.
    Config,
}

impl VipSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoFrequency => "auto_frequency",
            Self::Config => "config",
        }
    }
}

impl FromStr for VipSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto_frequency" => Ok(Self::AutoFrequency),
            "config" => Ok(Self::Config),
            other => Err(format!("unknown VIP source: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VipSender {
    pub address: String,
    pub source: VipSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedSender {
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a set-membership operation. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListChange {
    Added,
    AlreadyPresent,
    Removed,
    NotPresent,
    /// Not an email address; nothing was written.
    Invalid,
}

impl ListChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::AlreadyPresent => "already_present",
            Self::Removed => "removed",
            Self::NotPresent => "not_present",
            Self::Invalid => "invalid",
        }
    }
}

// ── Run summary ─────────────────────────────────────────────────────

/// Per-message line in a run's details payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub email_id: String,
    pub status: TriageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub actionable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VerdictSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub auto_vip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only record of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Row id once recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub run_at: DateTime<Utc>,
    /// `apply|dry-run` + `/` + `codex|rules`.
    pub mode: String,
    pub emails_seen: u32,
    pub triaged_count: u32,
    pub drafted_count: u32,
    pub archived_count: u32,
    pub skipped_count: u32,
    pub error_count: u32,
    /// Stop was requested before the batch was exhausted.
    pub interrupted: bool,
    pub details: Vec<MessageOutcome>,
}

impl RunSummary {
    pub fn new(run_at: DateTime<Utc>, apply: bool, use_ai: bool) -> Self {
        Self {
            id: None,
            run_at,
            mode: format!(
                "{}/{}",
                if apply { "apply" } else { "dry-run" },
                if use_ai { "codex" } else { "rules" }
            ),
            emails_seen: 0,
            triaged_count: 0,
            drafted_count: 0,
            archived_count: 0,
            skipped_count: 0,
            error_count: 0,
            interrupted: false,
            details: Vec::new(),
        }
    }

    pub fn is_apply(&self) -> bool {
        self.mode.starts_with("apply")
    }
}

// ── Ledger trait ────────────────────────────────────────────────────

/// Durable, transactional storage for triage state.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_record(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError>;

    /// Insert or overwrite by `email_id`. `first_seen_at` is kept from an
    /// existing row; `last_seen_at`/`updated_at` never move backwards.
    async fn upsert_record(&self, record: &TriageRecord) -> Result<(), DatabaseError>;

    /// Upsert `record` and, if `promote_vip` is set, add that address as an
    /// `auto_frequency` VIP, in one transaction.
    async fn commit_triage(
        &self,
        record: &TriageRecord,
        promote_vip: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Bump `last_seen_at` on a record that was skipped.
    async fn touch_record(&self, email_id: &str) -> Result<(), DatabaseError>;

    /// High-priority records from `sender_email`, not counting `exclude_id`.
    async fn count_high_priority(
        &self,
        sender_email: &str,
        exclude_id: &str,
    ) -> Result<u32, DatabaseError>;

    /// Operator escape hatch: set every record to `triaged`, regardless of
    /// its current state. Creates nothing. Returns the number of rows touched.
    async fn reset_all_to_triaged(&self) -> Result<u64, DatabaseError>;

    async fn list_vips(&self) -> Result<Vec<VipSender>, DatabaseError>;

    async fn add_vip(&self, address: &str, source: VipSource) -> Result<ListChange, DatabaseError>;

    async fn remove_vip(&self, address: &str) -> Result<ListChange, DatabaseError>;

    async fn list_blocked(&self) -> Result<Vec<BlockedSender>, DatabaseError>;

    async fn add_blocked(&self, address: &str) -> Result<ListChange, DatabaseError>;

    async fn remove_blocked(&self, address: &str) -> Result<ListChange, DatabaseError>;

    /// Append a run summary. Returns the new row id.
    async fn record_run(&self, summary: &RunSummary) -> Result<i64, DatabaseError>;

    async fn latest_run(&self) -> Result<Option<RunSummary>, DatabaseError>;
}
