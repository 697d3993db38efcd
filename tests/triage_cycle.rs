//! Integration tests for the triage cycle.
//!
//! Each test drives a real `TriageEngine` over an in-memory libSQL ledger,
//! a fake mailbox that records every side effect, and (where needed) a
//! scripted reasoning backend. No network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use email_triage::config::ActionPrecedence;
use email_triage::error::{DatabaseError, Error, LlmError, MailboxError, TriageError};
use email_triage::llm::{CompletionRequest, ReasoningBackend};
use email_triage::mailbox::{Address, MailboxClient, Message};
use email_triage::pipeline::{
    AiClassifier, CycleParams, EnginePolicy, FallbackClassifier, Priority, RuleClassifier,
    TriageEngine, VerdictSource,
};
use email_triage::store::{
    BlockedSender, Ledger, LibSqlLedger, ListChange, RunSummary, TriageRecord, TriageStatus,
    VipSender, VipSource,
};

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DraftFailure {
    Transient,
    Permanent,
}

/// Mailbox that always lists the same messages and records side effects.
#[derive(Default)]
struct FakeMailbox {
    inbox: Mutex<Vec<Message>>,
    /// (message id, body, drafts mailbox)
    drafts: Mutex<Vec<(String, String, String)>>,
    /// (message id, from, to)
    moves: Mutex<Vec<(String, String, String)>>,
    draft_failure: Mutex<Option<DraftFailure>>,
    fail_listing: AtomicBool,
}

impl FakeMailbox {
    fn with(messages: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            inbox: Mutex::new(messages),
            ..Default::default()
        })
    }

    fn draft_count(&self) -> usize {
        self.drafts.lock().unwrap().len()
    }

    fn move_count(&self) -> usize {
        self.moves.lock().unwrap().len()
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn list_candidates(&self, _mailbox: &str, limit: usize) -> Result<Vec<Message>, MailboxError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(MailboxError::Transient("connection reset".into()));
        }
        Ok(self.inbox.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn create_reply_draft(
        &self,
        message: &Message,
        body: &str,
        drafts_mailbox: &str,
    ) -> Result<String, MailboxError> {
        match *self.draft_failure.lock().unwrap() {
            Some(DraftFailure::Transient) => {
                return Err(MailboxError::Transient("503 from server".into()));
            }
            Some(DraftFailure::Permanent) => {
                return Err(MailboxError::Permanent("invalidProperties".into()));
            }
            None => {}
        }
        let mut drafts = self.drafts.lock().unwrap();
        drafts.push((message.id.clone(), body.to_string(), drafts_mailbox.to_string()));
        Ok(format!("draft-{}", drafts.len()))
    }

    async fn move_message(&self, id: &str, from_mailbox: &str, to_mailbox: &str) -> Result<(), MailboxError> {
        self.moves
            .lock()
            .unwrap()
            .push((id.to_string(), from_mailbox.to_string(), to_mailbox.to_string()));
        Ok(())
    }
}

/// Backend that returns a fixed answer (or failure), optionally after a delay.
struct ScriptedBackend {
    answer: Option<String>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    fn answering(json: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(json.to_string()),
            delay: None,
            calls: AtomicU32::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            delay: None,
            calls: AtomicU32::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(r#"{"priority":"low","actionable":false}"#.into()),
            delay: Some(delay),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer.clone().ok_or_else(|| LlmError::Unavailable {
            backend: "scripted".into(),
            reason: "service down".into(),
        })
    }
}

/// Ledger that fails writes on demand and passes everything else through.
struct FlakyLedger {
    inner: LibSqlLedger,
    /// Number of upcoming `commit_triage` calls to fail.
    failing_commits: AtomicU32,
    failing_upserts: AtomicBool,
    upsert_calls: AtomicU32,
}

impl FlakyLedger {
    async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LibSqlLedger::new_memory().await.unwrap(),
            failing_commits: AtomicU32::new(0),
            failing_upserts: AtomicBool::new(false),
            upsert_calls: AtomicU32::new(0),
        })
    }

    fn injected(what: &str) -> DatabaseError {
        DatabaseError::Query(format!("{what}: disk I/O error"))
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn get_record(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError> {
        self.inner.get_record(email_id).await
    }

    async fn upsert_record(&self, record: &TriageRecord) -> Result<(), DatabaseError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_upserts.load(Ordering::SeqCst) {
            return Err(Self::injected("upsert_record"));
        }
        self.inner.upsert_record(record).await
    }

    async fn commit_triage(
        &self,
        record: &TriageRecord,
        promote_vip: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(Self::injected("commit_triage"));
        }
        self.inner.commit_triage(record, promote_vip).await
    }

    async fn touch_record(&self, email_id: &str) -> Result<(), DatabaseError> {
        self.inner.touch_record(email_id).await
    }

    async fn count_high_priority(&self, sender_email: &str, exclude_id: &str) -> Result<u32, DatabaseError> {
        self.inner.count_high_priority(sender_email, exclude_id).await
    }

    async fn reset_all_to_triaged(&self) -> Result<u64, DatabaseError> {
        self.inner.reset_all_to_triaged().await
    }

    async fn list_vips(&self) -> Result<Vec<VipSender>, DatabaseError> {
        self.inner.list_vips().await
    }

    async fn add_vip(&self, address: &str, source: VipSource) -> Result<ListChange, DatabaseError> {
        self.inner.add_vip(address, source).await
    }

    async fn remove_vip(&self, address: &str) -> Result<ListChange, DatabaseError> {
        self.inner.remove_vip(address).await
    }

    async fn list_blocked(&self) -> Result<Vec<BlockedSender>, DatabaseError> {
        self.inner.list_blocked().await
    }

    async fn add_blocked(&self, address: &str) -> Result<ListChange, DatabaseError> {
        self.inner.add_blocked(address).await
    }

    async fn remove_blocked(&self, address: &str) -> Result<ListChange, DatabaseError> {
        self.inner.remove_blocked(address).await
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<i64, DatabaseError> {
        self.inner.record_run(summary).await
    }

    async fn latest_run(&self) -> Result<Option<RunSummary>, DatabaseError> {
        self.inner.latest_run().await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    mailbox: Arc<FakeMailbox>,
    ledger: Arc<LibSqlLedger>,
    engine: TriageEngine,
}

fn policy() -> EnginePolicy {
    EnginePolicy {
        mailbox: "INBOX".into(),
        drafts_mailbox: "Drafts".into(),
        archive_mailbox: "Archive".into(),
        identities: identities(),
        signature: Some("Sam".into()),
        auto_draft: true,
        archive_priorities: [Priority::Low, Priority::Medium].into_iter().collect(),
        draft_floor: None,
        require_direct_recipient: false,
        precedence: ActionPrecedence::DraftFirst,
        vip_threshold: 0,
    }
}

fn identities() -> HashSet<String> {
    ["me@example.com".to_string()].into_iter().collect()
}

async fn harness(
    messages: Vec<Message>,
    policy: EnginePolicy,
    backend: Option<(Arc<ScriptedBackend>, Duration)>,
) -> Harness {
    let mailbox = FakeMailbox::with(messages);
    let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
    let engine = engine_over(
        policy,
        Arc::clone(&mailbox),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        backend,
    );
    Harness {
        mailbox,
        ledger,
        engine,
    }
}

fn engine_over(
    policy: EnginePolicy,
    mailbox: Arc<FakeMailbox>,
    ledger: Arc<dyn Ledger>,
    backend: Option<(Arc<ScriptedBackend>, Duration)>,
) -> TriageEngine {
    let rules = RuleClassifier::new(identities(), &["urgent".to_string()], &[])
        .unwrap()
        .with_signature(Some("Sam".into()));
    let ai = backend.map(|(b, timeout)| AiClassifier::new(b, timeout, 4000));
    let classifier = FallbackClassifier::new(rules, ai, 3);
    TriageEngine::new(policy, mailbox, ledger, Arc::new(classifier))
}

fn email(id: &str, from: &str, subject: &str, body: &str) -> Message {
    Message {
        id: id.into(),
        subject: subject.into(),
        from: Some(Address::new(from)),
        to: vec![Address::new("team@example.com")],
        body: body.into(),
        ..Default::default()
    }
}

fn boss_email() -> Message {
    email("e-boss", "boss@example.com", "Can you review by Friday?", "The draft is attached.")
}

fn newsletter_email() -> Message {
    email(
        "e-news",
        "newsletter@example.com",
        "Weekly digest",
        "Top stories this week.",
    )
}

fn apply() -> CycleParams {
    CycleParams {
        batch_limit: 20,
        apply: true,
        allow_ai: true,
        force_reprocess: false,
    }
}

fn dry_run() -> CycleParams {
    CycleParams {
        apply: false,
        ..apply()
    }
}

async fn run(h: &Harness, params: CycleParams) -> RunSummary {
    h.engine
        .run_cycle(&params, &AtomicBool::new(false))
        .await
        .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn vip_request_gets_a_draft() {
    let h = harness(vec![boss_email()], policy(), None).await;
    h.ledger.add_vip("boss@example.com", VipSource::Manual).await.unwrap();

    let summary = run(&h, apply()).await;

    let record = h.ledger.get_record("e-boss").await.unwrap().unwrap();
    assert_eq!(record.priority, Priority::High);
    assert!(record.actionable);
    assert_eq!(record.status, TriageStatus::Drafted);
    assert!(record.drafted);
    assert_eq!(record.draft_id.as_deref(), Some("draft-1"));

    let drafts = h.mailbox.drafts.lock().unwrap().clone();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].2, "Drafts");
    assert!(drafts[0].1.ends_with("\n\nSam"));
    assert_eq!(h.mailbox.move_count(), 0);

    assert_eq!(summary.drafted_count, 1);
    assert_eq!(summary.triaged_count, 1);
    assert_eq!(summary.mode, "apply/rules");
}

#[tokio::test]
async fn newsletter_is_archived_without_draft() {
    let h = harness(vec![newsletter_email()], policy(), None).await;

    let summary = run(&h, apply()).await;

    let record = h.ledger.get_record("e-news").await.unwrap().unwrap();
    assert_eq!(record.priority, Priority::Low);
    assert_eq!(record.status, TriageStatus::Archived);
    assert!(record.draft_id.is_none());
    assert_eq!(h.mailbox.draft_count(), 0);
    assert_eq!(
        h.mailbox.moves.lock().unwrap()[0],
        ("e-news".to_string(), "INBOX".to_string(), "Archive".to_string())
    );
    assert_eq!(summary.archived_count, 1);
}

#[tokio::test]
async fn second_cycle_has_no_side_effects() {
    let h = harness(vec![boss_email(), newsletter_email()], policy(), None).await;
    h.ledger.add_vip("boss@example.com", VipSource::Manual).await.unwrap();

    run(&h, apply()).await;
    let first = h.ledger.get_record("e-boss").await.unwrap().unwrap();
    let second = run(&h, apply()).await;

    assert_eq!(h.mailbox.draft_count(), 1);
    assert_eq!(h.mailbox.move_count(), 1);
    assert_eq!(second.emails_seen, 2);
    assert_eq!(second.skipped_count, 2);
    assert_eq!(second.triaged_count, 0);
    assert_eq!(second.drafted_count, 0);
    assert_eq!(second.archived_count, 0);

    let again = h.ledger.get_record("e-boss").await.unwrap().unwrap();
    assert_eq!(again.draft_id, first.draft_id);
    assert_eq!(again.status, TriageStatus::Drafted);
    assert!(again.last_seen_at >= first.last_seen_at);
}

#[tokio::test]
async fn forced_reprocess_never_drafts_twice() {
    let h = harness(vec![boss_email()], policy(), None).await;
    h.ledger.add_vip("boss@example.com", VipSource::Manual).await.unwrap();
    let forced = CycleParams {
        force_reprocess: true,
        ..apply()
    };

    run(&h, apply()).await;
    run(&h, forced).await;
    h.ledger.reset_all_to_triaged().await.unwrap();
    run(&h, apply()).await;

    assert_eq!(h.mailbox.draft_count(), 1);
    let record = h.ledger.get_record("e-boss").await.unwrap().unwrap();
    assert_eq!(record.draft_id.as_deref(), Some("draft-1"));
    assert_eq!(record.status, TriageStatus::Drafted);
}

#[tokio::test]
async fn vip_override_beats_backend_verdict() {
    let backend = ScriptedBackend::answering(
        r#"{"priority":"low","actionable":false,"reason":"looks like spam","summary":"spam","reply_text":""}"#,
    );
    let h = harness(
        vec![email("e1", "ceo@example.com", "Hello", "Just checking in.")],
        policy(),
        Some((Arc::clone(&backend), Duration::from_secs(2))),
    )
    .await;
    h.ledger.add_vip("CEO@example.com", VipSource::Manual).await.unwrap();

    run(&h, dry_run()).await;

    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.priority, Priority::High);
    assert!(record.reason.starts_with("[codex] looks like spam"));
    assert!(record.reason.ends_with("priority forced high (vip sender)"));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn self_addressed_mail_is_high() {
    let mut message = email("e1", "peer@example.com", "Notes", "FYI.");
    message.cc = vec![Address::new("Me <me@example.com>")];
    let h = harness(vec![message], policy(), None).await;

    run(&h, apply()).await;

    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.priority, Priority::High);
    assert_eq!(h.mailbox.move_count(), 0);
}

#[tokio::test]
async fn sender_promoted_on_nth_high_priority_message() {
    let messages = (1..=4)
        .map(|n| email(&format!("e{n}"), "ops@example.com", "URGENT: disk full", "Node is down."))
        .collect();
    let h = harness(
        messages,
        EnginePolicy {
            vip_threshold: 3,
            ..policy()
        },
        None,
    )
    .await;

    let summary = run(&h, dry_run()).await;

    let promoted: Vec<bool> = summary.details.iter().map(|d| d.auto_vip).collect();
    assert_eq!(promoted, vec![false, false, true, false]);

    let vips = h.ledger.list_vips().await.unwrap();
    assert_eq!(vips.len(), 1);
    assert_eq!(vips[0].address, "ops@example.com");
    assert_eq!(vips[0].source, VipSource::AutoFrequency);

    // The fourth message already sees the sender as a VIP.
    let fourth = h.ledger.get_record("e4").await.unwrap().unwrap();
    assert!(fourth.reason.contains("vip sender"));
}

#[tokio::test]
async fn not_promoted_before_threshold() {
    let messages = (1..=2)
        .map(|n| email(&format!("e{n}"), "ops@example.com", "urgent", "Node is down."))
        .collect();
    let h = harness(
        messages,
        EnginePolicy {
            vip_threshold: 3,
            ..policy()
        },
        None,
    )
    .await;

    run(&h, dry_run()).await;
    assert!(h.ledger.list_vips().await.unwrap().is_empty());
}

#[tokio::test]
async fn backend_outage_falls_back_to_rules() {
    let backend = ScriptedBackend::failing();
    let messages = (1..=5)
        .map(|n| email(&format!("e{n}"), "alice@example.com", "Slides", "Could you send the slides?"))
        .collect();
    let h = harness(
        messages,
        policy(),
        Some((Arc::clone(&backend), Duration::from_secs(2))),
    )
    .await;

    let summary = run(&h, apply()).await;

    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.drafted_count, 5);
    assert_eq!(summary.mode, "apply/codex");
    // Circuit breaker: no calls after the third failure.
    assert_eq!(backend.calls(), 3);

    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Drafted);
    assert!(record.reason.starts_with("[rules-fallback] "));
    assert!(record.reason.contains("codex_error="));
    assert_eq!(summary.details[4].source, Some(VerdictSource::RulesFallback));
}

#[tokio::test]
async fn backend_timeout_falls_back_to_rules() {
    let backend = ScriptedBackend::slow(Duration::from_secs(5));
    let h = harness(
        vec![email("e1", "alice@example.com", "Lunch", "Free at noon?")],
        policy(),
        Some((backend, Duration::from_millis(50))),
    )
    .await;

    let summary = run(&h, dry_run()).await;

    assert_eq!(summary.error_count, 0);
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Triaged);
    assert!(record.reason.contains("timed out"));
}

#[tokio::test]
async fn rule_only_cycle_skips_backend() {
    let backend = ScriptedBackend::answering(r#"{"priority":"high","actionable":true}"#);
    let h = harness(
        vec![email("e1", "alice@example.com", "Notes", "FYI.")],
        policy(),
        Some((Arc::clone(&backend), Duration::from_secs(2))),
    )
    .await;
    let params = CycleParams {
        allow_ai: false,
        ..dry_run()
    };

    let summary = run(&h, params).await;

    assert_eq!(backend.calls(), 0);
    assert_eq!(summary.mode, "dry-run/rules");
    assert_eq!(summary.details[0].source, Some(VerdictSource::Rules));
}

#[tokio::test]
async fn blocked_sender_never_gets_a_draft() {
    let h = harness(
        vec![email("e1", "pushy@example.com", "Quick one", "Can you call me?")],
        EnginePolicy {
            archive_priorities: Default::default(),
            ..policy()
        },
        None,
    )
    .await;
    h.ledger.add_blocked("pushy@example.com").await.unwrap();

    let summary = run(&h, apply()).await;

    assert_eq!(h.mailbox.draft_count(), 0);
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert!(record.actionable);
    assert_eq!(record.status, TriageStatus::Skipped);
    assert!(record.reason.contains("draft suppressed"));
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(summary.triaged_count, 1);
}

#[tokio::test]
async fn blocked_sender_is_still_archived() {
    let h = harness(
        vec![email("e1", "pushy@example.com", "Quick one", "Can you call me?")],
        policy(),
        None,
    )
    .await;
    h.ledger.add_blocked("pushy@example.com").await.unwrap();

    run(&h, apply()).await;

    assert_eq!(h.mailbox.draft_count(), 0);
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Archived);
}

#[tokio::test]
async fn precedence_decides_draft_and_archive() {
    let message = || email("e1", "alice@example.com", "Slides", "Could you send the slides?");

    let h = harness(vec![message()], policy(), None).await;
    run(&h, apply()).await;
    assert_eq!((h.mailbox.draft_count(), h.mailbox.move_count()), (1, 0));

    let h = harness(
        vec![message()],
        EnginePolicy {
            precedence: ActionPrecedence::ArchiveFirst,
            ..policy()
        },
        None,
    )
    .await;
    run(&h, apply()).await;
    assert_eq!((h.mailbox.draft_count(), h.mailbox.move_count()), (0, 1));

    let h = harness(
        vec![message()],
        EnginePolicy {
            precedence: ActionPrecedence::DraftThenArchive,
            ..policy()
        },
        None,
    )
    .await;
    run(&h, apply()).await;
    assert_eq!((h.mailbox.draft_count(), h.mailbox.move_count()), (1, 1));
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Archived);
    assert!(record.draft_id.is_some());
}

#[tokio::test]
async fn dry_run_records_without_side_effects() {
    let h = harness(vec![boss_email(), newsletter_email()], policy(), None).await;

    let summary = run(&h, dry_run()).await;

    assert_eq!(h.mailbox.draft_count(), 0);
    assert_eq!(h.mailbox.move_count(), 0);
    assert_eq!(summary.triaged_count, 2);
    for id in ["e-boss", "e-news"] {
        let record = h.ledger.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, TriageStatus::Triaged);
    }
}

#[tokio::test]
async fn mailbox_failure_marks_error_and_retries() {
    let h = harness(
        vec![
            email("e1", "alice@example.com", "Slides", "Could you send the slides?"),
            newsletter_email(),
        ],
        policy(),
        None,
    )
    .await;
    *h.mailbox.draft_failure.lock().unwrap() = Some(DraftFailure::Transient);

    let first = run(&h, apply()).await;

    assert_eq!(first.error_count, 1);
    assert_eq!(first.archived_count, 1);
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Error);
    assert!(record.error.as_deref().unwrap_or("").contains("503"));

    *h.mailbox.draft_failure.lock().unwrap() = None;
    let second = run(&h, apply()).await;

    assert_eq!(second.drafted_count, 1);
    assert_eq!(second.skipped_count, 1);
    let record = h.ledger.get_record("e1").await.unwrap().unwrap();
    assert_eq!(record.status, TriageStatus::Drafted);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn permanent_failure_is_isolated() {
    let h = harness(
        vec![
            email("e1", "alice@example.com", "Slides", "Could you send the slides?"),
            email("e2", "bob@example.com", "Report", "Please review the report."),
        ],
        EnginePolicy {
            archive_priorities: Default::default(),
            ..policy()
        },
        None,
    )
    .await;
    *h.mailbox.draft_failure.lock().unwrap() = Some(DraftFailure::Permanent);

    let summary = run(&h, apply()).await;

    assert_eq!(summary.error_count, 2);
    assert_eq!(summary.details.len(), 2);
    for id in ["e1", "e2"] {
        let record = h.ledger.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, TriageStatus::Error);
    }
}

#[tokio::test]
async fn listing_failure_fails_the_cycle() {
    let h = harness(vec![boss_email()], policy(), None).await;
    h.mailbox.fail_listing.store(true, Ordering::SeqCst);

    let result = h.engine.run_cycle(&apply(), &AtomicBool::new(false)).await;

    assert!(result.is_err());
    assert!(h.ledger.latest_run().await.unwrap().is_none());
}

#[tokio::test]
async fn stop_is_honoured_between_messages() {
    let h = harness(vec![boss_email(), newsletter_email()], policy(), None).await;

    let summary = h
        .engine
        .run_cycle(&apply(), &AtomicBool::new(true))
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.emails_seen, 0);
    assert!(h.ledger.get_record("e-boss").await.unwrap().is_none());
    assert_eq!(h.mailbox.draft_count(), 0);
}

#[tokio::test]
async fn reset_reopens_every_record() {
    let h = harness(vec![boss_email(), newsletter_email()], policy(), None).await;
    h.ledger.add_vip("boss@example.com", VipSource::Manual).await.unwrap();
    run(&h, apply()).await;

    assert_eq!(h.ledger.reset_all_to_triaged().await.unwrap(), 2);
    for id in ["e-boss", "e-news"] {
        let record = h.ledger.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, TriageStatus::Triaged);
    }

    // Reopened records are triaged again on the next cycle.
    let summary = run(&h, apply()).await;
    assert_eq!(summary.skipped_count, 0);
    assert_eq!(summary.triaged_count, 2);
}

#[tokio::test]
async fn run_summary_is_recorded() {
    let h = harness(vec![newsletter_email()], policy(), None).await;
    let summary = run(&h, apply()).await;

    let latest = h.ledger.latest_run().await.unwrap().unwrap();
    assert_eq!(latest.id, summary.id);
    assert_eq!(latest.archived_count, 1);
    assert_eq!(latest.details.len(), 1);
    assert_eq!(latest.details[0].status, TriageStatus::Archived);
}

#[tokio::test]
async fn failed_commit_after_draft_does_not_draft_again() {
    let mailbox = FakeMailbox::with(vec![boss_email()]);
    let ledger = FlakyLedger::new().await;
    ledger.add_vip("boss@example.com", VipSource::Manual).await.unwrap();
    ledger.failing_commits.store(1, Ordering::SeqCst);
    let engine = engine_over(
        policy(),
        Arc::clone(&mailbox),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        None,
    );
    let stop = AtomicBool::new(false);

    let first = engine.run_cycle(&apply(), &stop).await.unwrap();
    assert_eq!(first.error_count, 1);
    assert_eq!(first.drafted_count, 1);

    let second = engine.run_cycle(&apply(), &stop).await.unwrap();
    assert_eq!(second.drafted_count, 0);
    assert_eq!(mailbox.draft_count(), 1);

    let record = ledger.get_record("e-boss").await.unwrap().unwrap();
    assert_eq!(record.draft_id.as_deref(), Some("draft-1"));
    assert_eq!(record.status, TriageStatus::Drafted);
}

#[tokio::test]
async fn unrecordable_draft_ends_the_cycle() {
    let mailbox = FakeMailbox::with(vec![
        email("e1", "alice@example.com", "Slides", "Could you send the slides?"),
        email("e2", "bob@example.com", "Report", "Please review the report."),
    ]);
    let ledger = FlakyLedger::new().await;
    ledger.failing_upserts.store(true, Ordering::SeqCst);
    let engine = engine_over(
        policy(),
        Arc::clone(&mailbox),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        None,
    );

    let result = engine.run_cycle(&apply(), &AtomicBool::new(false)).await;

    assert!(matches!(
        result,
        Err(Error::Triage(TriageError::DraftNotRecorded { ref draft_id, .. })) if draft_id == "draft-1"
    ));
    // Retried before giving up, and nothing further touched the mailbox.
    assert_eq!(ledger.upsert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(mailbox.draft_count(), 1);
    assert_eq!(mailbox.move_count(), 0);
    assert!(ledger.get_record("e2").await.unwrap().is_none());
}
