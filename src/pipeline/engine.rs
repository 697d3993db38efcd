//! Triage cycle engine.
//!
//! One cycle lists a bounded batch of candidates and walks it in order.
//! Each message is checked against the ledger, classified, given its side
//! effects, and committed in its own transaction before the next message
//! starts. A failure is recorded against that message only.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{ActionPrecedence, TriageConfig};
use crate::error::{ConfigError, DatabaseError, Error, TriageError};
use crate::mailbox::{MailboxClient, Message};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::reply::{append_signature, fallback_reply};
use crate::pipeline::types::{Priority, SenderHistory, Verdict, VerdictSource};
use crate::store::{
    Ledger, ListChange, MessageOutcome, RunSummary, TriageRecord, TriageStatus, VipSource,
};

/// Inputs to one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleParams {
    pub batch_limit: usize,
    /// Perform drafts and moves. Off means classify and record only.
    pub apply: bool,
    pub allow_ai: bool,
    /// Re-run messages whose record is already settled.
    pub force_reprocess: bool,
}

/// Mailbox names and side-effect policy, fixed for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    pub mailbox: String,
    pub drafts_mailbox: String,
    pub archive_mailbox: String,
    /// Normalised addresses of the mailbox owner.
    pub identities: HashSet<String>,
    pub signature: Option<String>,
    pub auto_draft: bool,
    pub archive_priorities: BTreeSet<Priority>,
    pub draft_floor: Option<Priority>,
    pub require_direct_recipient: bool,
    pub precedence: ActionPrecedence,
    /// 0 disables auto-promotion.
    pub vip_threshold: u32,
}

impl EnginePolicy {
    pub fn from_config(config: &TriageConfig) -> Result<Self, ConfigError> {
        let automation = &config.automation;
        Ok(Self {
            mailbox: config.mail.mailbox.clone(),
            drafts_mailbox: config.mail.drafts_mailbox.clone(),
            archive_mailbox: config.mail.archive_mailbox.clone(),
            identities: config.sender_identities(),
            signature: config
                .drafting
                .signature
                .clone()
                .filter(|s| !s.trim().is_empty()),
            auto_draft: automation.auto_draft,
            archive_priorities: automation.archive_priorities(),
            draft_floor: automation.draft_priority_floor()?,
            require_direct_recipient: automation.require_direct_recipient,
            precedence: automation.action_precedence,
            vip_threshold: config.triage.vip_frequency_threshold,
        })
    }
}

/// Sender lists loaded once per cycle. Auto-promotions are added as they
/// commit so later messages in the same batch see them.
struct SenderLists {
    vips: HashSet<String>,
    blocked: HashSet<String>,
}

/// Attempts at recording a fresh draft id before the cycle is abandoned.
const DRAFT_RECORD_ATTEMPTS: u32 = 3;
const DRAFT_RECORD_BACKOFF: Duration = Duration::from_millis(200);

/// How one message contributed to the run's counters.
#[derive(Debug)]
enum Disposition {
    /// Settled record left alone.
    AlreadyHandled,
    Triaged {
        drafted: bool,
        archived: bool,
        suppressed: bool,
    },
    Failed {
        drafted: bool,
        archived: bool,
    },
    /// The ledger lost track of a side effect; no further messages run.
    Aborted(TriageError),
}

/// Working state for one message. Side effects land here as they happen,
/// so a later failure still commits what was already done.
struct Progress {
    record: TriageRecord,
    source: Option<VerdictSource>,
    promote: bool,
    drafted: bool,
    archived: bool,
    suppressed: bool,
}

impl Progress {
    fn new(message: &Message, existing: Option<&TriageRecord>, now: DateTime<Utc>) -> Self {
        let draft_id = existing.and_then(|r| r.draft_id.clone());
        let record = TriageRecord {
            email_id: message.id.clone(),
            subject: message.subject.clone(),
            sender: message.sender_display(),
            sender_email: message.sender_email(),
            received_at: message.received_at,
            priority: existing.map_or(Priority::Medium, |r| r.priority),
            actionable: existing.is_some_and(|r| r.actionable),
            reason: String::new(),
            summary: String::new(),
            reply_text: String::new(),
            drafted: draft_id.is_some(),
            status: if draft_id.is_some() {
                TriageStatus::Drafted
            } else {
                TriageStatus::Triaged
            },
            draft_id,
            error: None,
            raw_email: serde_json::to_string(message).ok(),
            first_seen_at: existing.map_or(now, |r| r.first_seen_at),
            last_seen_at: now,
            updated_at: now,
        };
        Self {
            record,
            source: None,
            promote: false,
            drafted: false,
            archived: false,
            suppressed: false,
        }
    }

    fn apply_verdict(&mut self, verdict: &Verdict) {
        self.record.priority = verdict.priority;
        self.record.actionable = verdict.actionable;
        self.record.reason = verdict.reason.clone();
        self.record.summary = verdict.summary.clone();
        self.record.reply_text = verdict.reply_text.clone();
        self.source = Some(verdict.source);
    }

    fn outcome(&self) -> MessageOutcome {
        MessageOutcome {
            email_id: self.record.email_id.clone(),
            status: self.record.status,
            priority: self.source.map(|_| self.record.priority),
            actionable: self.record.actionable,
            source: self.source,
            draft_id: self.record.draft_id.clone(),
            sender: self.record.sender_email.clone(),
            subject: self.record.subject.clone(),
            archived: self.archived,
            auto_vip: self.promote,
            error: self.record.error.clone(),
        }
    }
}

/// Runs triage cycles against a mailbox, a ledger and a classifier.
pub struct TriageEngine {
    policy: EnginePolicy,
    mailbox: Arc<dyn MailboxClient>,
    ledger: Arc<dyn Ledger>,
    classifier: Arc<dyn Classifier>,
}

impl TriageEngine {
    pub fn new(
        policy: EnginePolicy,
        mailbox: Arc<dyn MailboxClient>,
        ledger: Arc<dyn Ledger>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            policy,
            mailbox,
            ledger,
            classifier,
        }
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Insert configured VIPs with source `config`. Existing entries keep
    /// their source. Returns how many were added.
    pub async fn seed_vips(&self, addresses: &[String]) -> Result<u32, DatabaseError> {
        let mut added = 0;
        for address in addresses {
            match self.ledger.add_vip(address, VipSource::Config).await? {
                ListChange::Added => added += 1,
                ListChange::Invalid => {
                    warn!(address = %address, "Ignoring configured VIP that is not an address");
                }
                _ => {}
            }
        }
        if added > 0 {
            info!(added, "Seeded VIP senders from config");
        }
        Ok(added)
    }

    /// Run one cycle.
    ///
    /// Fails only when the sender lists or the candidate batch cannot be
    /// read. Per-message failures are recorded and counted. `stop` is
    /// checked between messages.
    pub async fn run_cycle(&self, params: &CycleParams, stop: &AtomicBool) -> Result<RunSummary, Error> {
        self.classifier.begin_cycle(params.allow_ai).await;
        let use_ai = params.allow_ai && self.classifier.ai_enabled();
        let mut summary = RunSummary::new(Utc::now(), params.apply, use_ai);

        let mut lists = self.load_lists().await?;
        let messages = self
            .mailbox
            .list_candidates(&self.policy.mailbox, params.batch_limit.max(1))
            .await?;

        info!(
            candidates = messages.len(),
            mode = %summary.mode,
            reprocess = params.force_reprocess,
            "Cycle started"
        );

        for message in &messages {
            if stop.load(Ordering::SeqCst) {
                info!(
                    remaining = messages.len() - summary.emails_seen as usize,
                    "Stop requested, ending cycle early"
                );
                summary.interrupted = true;
                break;
            }

            summary.emails_seen += 1;
            let (outcome, disposition) = self.process_message(message, params, &mut lists).await;

            match disposition {
                Disposition::AlreadyHandled => summary.skipped_count += 1,
                Disposition::Triaged {
                    drafted,
                    archived,
                    suppressed,
                } => {
                    summary.triaged_count += 1;
                    summary.drafted_count += u32::from(drafted);
                    summary.archived_count += u32::from(archived);
                    summary.skipped_count += u32::from(suppressed);
                }
                Disposition::Failed { drafted, archived } => {
                    summary.error_count += 1;
                    summary.drafted_count += u32::from(drafted);
                    summary.archived_count += u32::from(archived);
                }
                Disposition::Aborted(e) => {
                    error!(
                        id = %outcome.email_id,
                        seen = summary.emails_seen,
                        error = %e,
                        "Ledger unavailable after a draft, abandoning cycle"
                    );
                    return Err(e.into());
                }
            }
            summary.details.push(outcome);
        }

        match self.ledger.record_run(&summary).await {
            Ok(id) => summary.id = Some(id),
            Err(e) => warn!(error = %e, "Failed to record run summary"),
        }

        info!(
            seen = summary.emails_seen,
            triaged = summary.triaged_count,
            drafted = summary.drafted_count,
            archived = summary.archived_count,
            skipped = summary.skipped_count,
            errors = summary.error_count,
            "Cycle finished"
        );
        Ok(summary)
    }

    async fn load_lists(&self) -> Result<SenderLists, DatabaseError> {
        let vips = self
            .ledger
            .list_vips()
            .await?
            .into_iter()
            .map(|v| v.address)
            .collect();
        let blocked = self
            .ledger
            .list_blocked()
            .await?
            .into_iter()
            .map(|b| b.address)
            .collect();
        Ok(SenderLists { vips, blocked })
    }

    async fn process_message(
        &self,
        message: &Message,
        params: &CycleParams,
        lists: &mut SenderLists,
    ) -> (MessageOutcome, Disposition) {
        let now = Utc::now();

        if message.id.trim().is_empty() {
            let e = TriageError::InvalidMessage("message has no identifier".into());
            warn!(subject = %message.subject, error = %e, "Skipping message");
            return (
                failed_outcome(message, &e),
                Disposition::Failed {
                    drafted: false,
                    archived: false,
                },
            );
        }

        let existing = match self.ledger.get_record(&message.id).await {
            Ok(existing) => existing,
            Err(e) => {
                let e = TriageError::from(e);
                error!(id = %message.id, error = %e, "Ledger read failed, leaving message for next cycle");
                return (
                    failed_outcome(message, &e),
                    Disposition::Failed {
                        drafted: false,
                        archived: false,
                    },
                );
            }
        };

        if let Some(prev) = &existing
            && prev.status.is_settled()
            && !params.force_reprocess
        {
            debug!(id = %message.id, status = %prev.status, "Already handled, skipping");
            if let Err(e) = self.ledger.touch_record(&message.id).await {
                warn!(id = %message.id, error = %e, "Failed to update last_seen_at");
            }
            return (
                MessageOutcome {
                    email_id: prev.email_id.clone(),
                    status: TriageStatus::Skipped,
                    priority: Some(prev.priority),
                    actionable: prev.actionable,
                    source: None,
                    draft_id: prev.draft_id.clone(),
                    sender: prev.sender_email.clone(),
                    subject: prev.subject.clone(),
                    archived: false,
                    auto_vip: false,
                    error: None,
                },
                Disposition::AlreadyHandled,
            );
        }

        let mut progress = Progress::new(message, existing.as_ref(), now);
        let result = self.triage(message, params, lists, &mut progress).await;

        if let Err(e @ TriageError::DraftNotRecorded { .. }) = result {
            progress.record.status = TriageStatus::Error;
            progress.record.error = Some(e.to_string());
            return (progress.outcome(), Disposition::Aborted(e));
        }

        if let Err(e) = &result {
            let transient = matches!(e, TriageError::Mailbox(m) if m.is_transient());
            warn!(
                id = %message.id,
                error = %e,
                transient,
                "Message failed, will retry next cycle"
            );
            progress.record.status = TriageStatus::Error;
            progress.record.error = Some(e.to_string());
        }

        let promote = progress
            .promote
            .then_some(progress.record.sender_email.as_str());
        if let Err(e) = self.ledger.commit_triage(&progress.record, promote).await {
            // Only a draft id recorded earlier survives; the rest is retried
            // next cycle.
            error!(id = %message.id, error = %e, "Ledger write failed");
            progress.promote = false;
            progress.record.status = TriageStatus::Error;
            progress.record.error = Some(TriageError::from(e).to_string());
            let disposition = Disposition::Failed {
                drafted: progress.drafted,
                archived: progress.archived,
            };
            return (progress.outcome(), disposition);
        }

        if progress.promote {
            info!(sender = %progress.record.sender_email, "Sender auto-promoted to VIP");
            lists.vips.insert(progress.record.sender_email.clone());
        }

        let disposition = if result.is_ok() {
            Disposition::Triaged {
                drafted: progress.drafted,
                archived: progress.archived,
                suppressed: progress.suppressed,
            }
        } else {
            Disposition::Failed {
                drafted: progress.drafted,
                archived: progress.archived,
            }
        };
        (progress.outcome(), disposition)
    }

    /// Classification and side effects for one message.
    async fn triage(
        &self,
        message: &Message,
        params: &CycleParams,
        lists: &SenderLists,
        progress: &mut Progress,
    ) -> Result<(), TriageError> {
        let sender = progress.record.sender_email.clone();
        let prior_high_count = if sender.is_empty() {
            0
        } else {
            self.ledger
                .count_high_priority(&sender, &message.id)
                .await?
        };
        let history = SenderHistory {
            is_vip: lists.vips.contains(&sender),
            sender,
            prior_high_count,
        };

        let mut verdict = self
            .classifier
            .classify(message, &history, params.allow_ai)
            .await;
        self.apply_vip_override(message, &history, &mut verdict);
        progress.apply_verdict(&verdict);
        progress.promote = self.should_promote(&history, verdict.priority);

        debug!(
            id = %message.id,
            priority = %verdict.priority,
            actionable = verdict.actionable,
            source = verdict.source.as_str(),
            "Classified"
        );

        if !params.apply {
            return Ok(());
        }

        let had_draft = progress.record.draft_id.is_some();
        let draft_eligible = !had_draft && self.draft_eligible(message, &verdict);
        let blocked = lists.blocked.contains(&history.sender);
        let archive_eligible = self.policy.archive_priorities.contains(&verdict.priority);

        let (draft, archive) = match self.policy.precedence {
            ActionPrecedence::DraftFirst => {
                let draft = draft_eligible && !blocked;
                (draft, archive_eligible && !draft && !had_draft)
            }
            ActionPrecedence::ArchiveFirst => (draft_eligible && !blocked && !archive_eligible, archive_eligible),
            ActionPrecedence::DraftThenArchive => (draft_eligible && !blocked, archive_eligible),
        };

        if draft {
            let body = self.draft_body(&verdict);
            let draft_id = self
                .mailbox
                .create_reply_draft(message, &body, &self.policy.drafts_mailbox)
                .await?;
            info!(id = %message.id, draft_id = %draft_id, "Reply draft created");
            progress.record.draft_id = Some(draft_id.clone());
            progress.record.drafted = true;
            progress.record.status = TriageStatus::Drafted;
            progress.drafted = true;

            self.record_draft(&progress.record)
                .await
                .map_err(|source| TriageError::DraftNotRecorded {
                    email_id: message.id.clone(),
                    draft_id,
                    source,
                })?;
        }

        if archive {
            self.mailbox
                .move_message(
                    &message.id,
                    &self.policy.mailbox,
                    &self.policy.archive_mailbox,
                )
                .await?;
            info!(id = %message.id, priority = %verdict.priority, "Message archived");
            progress.record.status = TriageStatus::Archived;
            progress.archived = true;
        }

        if draft_eligible && blocked && !archive {
            debug!(id = %message.id, sender = %history.sender, "Draft suppressed for blocked sender");
            progress.record.status = TriageStatus::Skipped;
            progress.record.reason.push_str("; draft suppressed for blocked sender");
            progress.suppressed = true;
        }

        Ok(())
    }

    /// Write the record as soon as a draft exists, so the draft id survives
    /// a failure later in the message. Retried with a linear backoff.
    async fn record_draft(&self, record: &TriageRecord) -> Result<(), DatabaseError> {
        let mut attempt = 1;
        loop {
            match self.ledger.upsert_record(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < DRAFT_RECORD_ATTEMPTS => {
                    warn!(id = %record.email_id, attempt, error = %e, "Recording draft failed, retrying");
                    tokio::time::sleep(DRAFT_RECORD_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// VIP senders and mail addressed to the owner are always high.
    fn apply_vip_override(&self, message: &Message, history: &SenderHistory, verdict: &mut Verdict) {
        let forced = if history.is_vip {
            Some("vip sender")
        } else if message.targets_any(&self.policy.identities, true) {
            Some("addressed to self")
        } else {
            None
        };
        if let Some(why) = forced
            && verdict.priority != Priority::High
        {
            debug!(id = %message.id, from = %verdict.priority, why, "Priority forced high");
            verdict.priority = Priority::High;
            verdict.reason = format!("{}; priority forced high ({why})", verdict.reason);
        }
    }

    fn should_promote(&self, history: &SenderHistory, priority: Priority) -> bool {
        let threshold = self.policy.vip_threshold;
        threshold > 0
            && priority == Priority::High
            && !history.is_vip
            && history.sender.contains('@')
            && history.prior_high_count.saturating_add(1) >= threshold
    }

    fn draft_eligible(&self, message: &Message, verdict: &Verdict) -> bool {
        self.policy.auto_draft
            && verdict.actionable
            && self
                .policy
                .draft_floor
                .is_none_or(|floor| verdict.priority >= floor)
            && (!self.policy.require_direct_recipient
                || message.targets_any(&self.policy.identities, false))
    }

    fn draft_body(&self, verdict: &Verdict) -> String {
        let text = if verdict.reply_text.trim().is_empty() {
            fallback_reply(verdict.priority)
        } else {
            verdict.reply_text.as_str()
        };
        append_signature(text, self.policy.signature.as_deref())
    }
}

fn failed_outcome(message: &Message, error: &TriageError) -> MessageOutcome {
    MessageOutcome {
        email_id: message.id.clone(),
        status: TriageStatus::Error,
        priority: None,
        actionable: false,
        source: None,
        draft_id: None,
        sender: message.sender_email(),
        subject: message.subject.clone(),
        archived: false,
        auto_vip: false,
        error: Some(error.to_string()),
    }
}
