//! Classifier strategies.
//!
//! [`RuleClassifier`] is deterministic and always answers. [`AiClassifier`]
//! asks the reasoning backend and returns a typed failure when it cannot.
//! [`FallbackClassifier`] composes the two: it tries the AI backend while a
//! per-cycle failure budget remains and degrades to rules otherwise, so
//! `classify` never fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::TriageConfig;
use crate::error::{Error, LlmError};
use crate::llm::{BackendFactory, CompletionRequest, ReasoningBackend, create_backend};
use crate::mailbox::Message;
use crate::pipeline::rules::RuleClassifier;
use crate::pipeline::types::{Priority, SenderHistory, Verdict, VerdictSource};

/// Produces a verdict for one message. Never fails.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Reset per-cycle state (failure counters). `allow_ai` says whether
    /// the coming cycle may use the AI backend at all.
    async fn begin_cycle(&self, _allow_ai: bool) {}

    /// Whether an AI backend is ready for this cycle.
    fn ai_enabled(&self) -> bool {
        false
    }

    async fn classify(&self, message: &Message, history: &SenderHistory, allow_ai: bool)
    -> Verdict;
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(
        &self,
        message: &Message,
        history: &SenderHistory,
        _allow_ai: bool,
    ) -> Verdict {
        self.classify_rules(message, history)
    }
}

// ── AI classifier ───────────────────────────────────────────────────

/// Classifier backed by a reasoning backend, bounded by a timeout.
pub struct AiClassifier {
    backend: Arc<dyn ReasoningBackend>,
    timeout: Duration,
    max_body_chars: usize,
}

impl AiClassifier {
    pub fn new(backend: Arc<dyn ReasoningBackend>, timeout: Duration, max_body_chars: usize) -> Self {
        Self {
            backend,
            timeout,
            max_body_chars,
        }
    }

    /// Ask the backend. `baseline` is the unprefixed rule verdict; it is
    /// shown to the model and fills any fields the model leaves empty.
    pub async fn classify(&self, message: &Message, baseline: &Verdict) -> Result<Verdict, LlmError> {
        let request = CompletionRequest::new(build_prompt(message, baseline, self.max_body_chars))
            .with_schema(verdict_schema());

        let raw = tokio::time::timeout(self.timeout, self.backend.complete(&request))
            .await
            .map_err(|_| LlmError::Timeout {
                backend: self.backend.name().to_string(),
                timeout: self.timeout,
            })??;

        parse_verdict(&raw, baseline).map_err(|reason| LlmError::InvalidResponse {
            backend: self.backend.name().to_string(),
            reason,
        })
    }
}

// ── Fallback classifier ─────────────────────────────────────────────

/// AI first, rules on any failure; a circuit breaker stops calling the
/// backend after `max_failures` failures within one cycle.
///
/// When the backend could not be built, a [`BackendFactory`] given through
/// [`with_rebuild`](Self::with_rebuild) is tried again at the start of each
/// cycle; until it succeeds the cycles run rule-only.
pub struct FallbackClassifier {
    rules: RuleClassifier,
    ai: RwLock<Option<Arc<AiClassifier>>>,
    rebuild: Option<Rebuild>,
    failures: AtomicU32,
    /// 0 means no limit.
    max_failures: u32,
}

struct Rebuild {
    factory: Arc<dyn BackendFactory>,
    timeout: Duration,
    max_body_chars: usize,
}

impl FallbackClassifier {
    pub fn new(rules: RuleClassifier, ai: Option<AiClassifier>, max_failures: u32) -> Self {
        Self {
            rules,
            ai: RwLock::new(ai.map(Arc::new)),
            rebuild: None,
            failures: AtomicU32::new(0),
            max_failures,
        }
    }

    pub fn rules_only(rules: RuleClassifier) -> Self {
        Self::new(rules, None, 0)
    }

    /// Retry building the AI classifier from `factory` at each cycle start
    /// while none is available.
    pub fn with_rebuild(
        mut self,
        factory: Arc<dyn BackendFactory>,
        timeout: Duration,
        max_body_chars: usize,
    ) -> Self {
        self.rebuild = Some(Rebuild {
            factory,
            timeout,
            max_body_chars,
        });
        self
    }

    /// Build from configuration. With `use_ai` false, or `use_codex` off,
    /// the result is rule-only.
    ///
    /// A backend that cannot be constructed is an error unless
    /// `codex_fallback_to_rules` is set; then cycles run rule-only and the
    /// build is retried at each cycle start.
    pub async fn from_config(config: &TriageConfig, use_ai: bool) -> Result<Self, Error> {
        let rules = RuleClassifier::from_config(config)?;
        let automation = &config.automation;
        if !use_ai || !automation.use_codex {
            return Ok(Self::rules_only(rules));
        }

        let settings = config.codex_settings()?;
        let built = create_backend(&settings).await;
        match built {
            Ok(backend) => {
                info!(
                    backend = backend.name(),
                    model = backend.model_name(),
                    "Reasoning backend ready"
                );
                let ai = AiClassifier::new(
                    backend,
                    automation.codex_timeout(),
                    automation.codex_max_body_chars,
                );
                Ok(Self::new(rules, Some(ai), automation.codex_max_failures_per_cycle))
            }
            Err(e) if automation.codex_fallback_to_rules => {
                warn!(error = %e, "Reasoning backend unavailable, will retry at the next cycle");
                Ok(
                    Self::new(rules, None, automation.codex_max_failures_per_cycle).with_rebuild(
                        Arc::new(settings),
                        automation.codex_timeout(),
                        automation.codex_max_body_chars,
                    ),
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Backend failures seen so far in this cycle.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    fn breaker_open(&self) -> bool {
        self.max_failures > 0 && self.failures() >= self.max_failures
    }

    fn current_ai(&self) -> Option<Arc<AiClassifier>> {
        self.ai
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Classifier for FallbackClassifier {
    async fn begin_cycle(&self, allow_ai: bool) {
        self.failures.store(0, Ordering::Relaxed);
        if !allow_ai || self.current_ai().is_some() {
            return;
        }
        let Some(rebuild) = &self.rebuild else {
            return;
        };
        match rebuild.factory.build().await {
            Ok(backend) => {
                info!(
                    backend = backend.name(),
                    model = backend.model_name(),
                    "Reasoning backend ready"
                );
                let ai = AiClassifier::new(backend, rebuild.timeout, rebuild.max_body_chars);
                *self.ai.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(ai));
            }
            Err(e) => {
                warn!(error = %e, "Reasoning backend still unavailable, cycle runs rule-only");
            }
        }
    }

    fn ai_enabled(&self) -> bool {
        self.current_ai().is_some()
    }

    async fn classify(
        &self,
        message: &Message,
        history: &SenderHistory,
        allow_ai: bool,
    ) -> Verdict {
        let baseline = self.rules.evaluate(message, history);

        let Some(ai) = self.current_ai().filter(|_| allow_ai) else {
            return Verdict {
                reason: format!("[rules] {}", baseline.reason),
                ..baseline
            };
        };

        if self.breaker_open() {
            debug!(id = %message.id, failures = self.failures(), "AI breaker open, using rules");
            let detail = format!("skipped after {} failures this cycle", self.failures());
            return rules_fallback(baseline, &detail);
        }

        match ai.classify(message, &baseline).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    id = %message.id,
                    error = %e,
                    failures,
                    "AI classification failed, falling back to rules"
                );
                rules_fallback(baseline, &e.to_string())
            }
        }
    }
}

fn rules_fallback(baseline: Verdict, detail: &str) -> Verdict {
    Verdict {
        reason: format!("[rules-fallback] {}; codex_error={detail}", baseline.reason),
        source: VerdictSource::RulesFallback,
        ..baseline
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// JSON schema the backend's answer must satisfy.
pub fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["priority", "actionable", "reason", "summary", "reply_text"],
        "properties": {
            "priority": {"type": "string", "enum": ["high", "medium", "low"]},
            "actionable": {"type": "boolean"},
            "reason": {"type": "string"},
            "summary": {"type": "string"},
            "reply_text": {"type": "string"},
        }
    })
}

fn truncate_body(body: &str, max_chars: usize) -> String {
    if max_chars == 0 || body.chars().count() <= max_chars {
        return body.to_string();
    }
    let cut: String = body.chars().take(max_chars).collect();
    format!("{}\n[truncated]", cut.trim_end())
}

fn build_prompt(message: &Message, baseline: &Verdict, max_body_chars: usize) -> String {
    let list = |addrs: &[crate::mailbox::Address]| {
        addrs
            .iter()
            .map(|a| a.display())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let received = message
        .received_at
        .map(|d| d.to_rfc3339())
        .unwrap_or_default();

    let mut prompt = String::with_capacity(2048);
    prompt.push_str(
        "You triage email for the mailbox owner. Decide the priority (high, medium or low), \
         whether the message is actionable (the owner should reply or do something), \
         and draft a short reply when it is actionable.\n\n",
    );
    prompt.push_str("Rules baseline (deterministic; override when the content says otherwise):\n");
    prompt.push_str(&format!("- priority: {}\n", baseline.priority));
    prompt.push_str(&format!("- actionable: {}\n", baseline.actionable));
    prompt.push_str(&format!("- reason: {}\n\n", baseline.reason));

    prompt.push_str(
        "Respond with ONLY a JSON object:\n\
         {\"priority\": \"high|medium|low\", \"actionable\": true, \"reason\": \"...\", \
         \"summary\": \"...\", \"reply_text\": \"...\"}\n\n\
         Guidelines:\n\
         - summary is one sentence\n\
         - reply_text is plain text with no subject line and no signature\n\
         - reply_text is empty when the message is not actionable\n\
         - do not promise dates, decisions or facts that are not in the message\n\n",
    );

    if !baseline.reply_text.is_empty() {
        prompt.push_str(&format!("Fallback reply:\n{}\n\n", baseline.reply_text));
    }

    prompt.push_str("Email:\n");
    prompt.push_str(&format!("id: {}\n", message.id));
    prompt.push_str(&format!("subject: {}\n", message.subject));
    prompt.push_str(&format!("from: {}\n", message.sender_display()));
    prompt.push_str(&format!("to: {}\n", list(&message.to)));
    prompt.push_str(&format!("cc: {}\n", list(&message.cc)));
    prompt.push_str(&format!("received_at: {received}\n"));
    prompt.push_str(&format!("preview: {}\n", message.preview.trim()));
    prompt.push_str(&format!(
        "body:\n{}\n",
        truncate_body(message.text(), max_body_chars)
    ));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct AiResponse {
    priority: String,
    #[serde(default)]
    actionable: Value,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "reply", alias = "draft")]
    reply_text: String,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

/// Parse the backend's answer into a verdict.
fn parse_verdict(raw: &str, baseline: &Verdict) -> Result<Verdict, String> {
    let json_str = extract_json_object(raw);
    let response: AiResponse =
        serde_json::from_str(json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let priority: Priority = response.priority.parse()?;
    let non_empty = |s: String, default: &str| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            default.to_string()
        } else {
            trimmed.to_string()
        }
    };

    Ok(Verdict {
        priority,
        actionable: truthy(&response.actionable),
        reason: format!("[codex] {}", non_empty(response.reason, &baseline.reason)),
        summary: non_empty(response.summary, &baseline.summary),
        reply_text: non_empty(response.reply_text, &baseline.reply_text),
        source: VerdictSource::Codex,
    })
}

/// The first balanced `{...}` in model output that parses as a JSON object.
///
/// Covers bare JSON, fenced blocks and JSON embedded in prose, including
/// prose that itself contains braces. Braces inside string literals do not
/// count. Falls back to the trimmed text so the parse error names it.
fn extract_json_object(text: &str) -> &str {
    let trimmed = text.trim();
    for (start, _) in trimmed.match_indices('{') {
        let Some(len) = balanced_len(&trimmed.as_bytes()[start..]) else {
            continue;
        };
        let candidate = &trimmed[start..start + len];
        if serde_json::from_str::<Value>(candidate).is_ok_and(|v| v.is_object()) {
            return candidate;
        }
    }
    trimmed
}

/// Length of the brace-balanced prefix of `bytes`, which starts with `{`.
fn balanced_len(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
