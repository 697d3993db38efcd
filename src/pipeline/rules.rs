//! Deterministic rule classifier.
//!
//! Always available and never fails. Used directly in rule-only cycles, as
//! the baseline handed to the AI backend, and as the fallback when the AI
//! backend cannot answer.
//!
//! Resolution order:
//! - VIP sender, self identity in To/Cc, or an urgent keyword → High
//! - low-signal sender or keyword → Low
//! - otherwise → Medium

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

use crate::config::TriageConfig;
use crate::error::ConfigError;
use crate::mailbox::Message;
use crate::pipeline::reply::{append_signature, fallback_reply};
use crate::pipeline::types::{Priority, SenderHistory, Verdict, VerdictSource};

/// Phrases that mark a message as asking something of the reader.
const ACTION_MARKERS: &[&str] = &[
    "?",
    "please",
    "can you",
    "could you",
    "would you",
    "need you",
    "action required",
    "let me know",
    "follow up",
    "deadline",
    "asap",
    "eod",
];

const LOW_SIGNAL_MARKERS: &[&str] = &["newsletter", "digest", "notification", "promo", "marketing"];

/// Which message field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    /// Subject and body together.
    Text,
}

/// A single keyword rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    /// The keyword as configured.
    pub keyword: String,
    pub regex: Regex,
    pub field: RuleField,
}

impl KeywordRule {
    /// Case-insensitive match. Text rules are word-bounded when the keyword
    /// starts and ends with a word character; sender rules match substrings.
    pub fn new(keyword: &str, field: RuleField) -> Result<Self, regex::Error> {
        let keyword = keyword.trim();
        let escaped = regex::escape(keyword);
        let wordy = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
        let bounded = field == RuleField::Text
            && wordy(keyword.chars().next())
            && wordy(keyword.chars().last());
        let pattern = if bounded {
            format!(r"(?i)\b{escaped}\b")
        } else {
            format!("(?i){escaped}")
        };
        Ok(Self {
            keyword: keyword.to_string(),
            regex: Regex::new(&pattern)?,
            field,
        })
    }

    fn matches(&self, sender: &str, text: &str) -> bool {
        match self.field {
            RuleField::Sender => self.regex.is_match(sender),
            RuleField::Text => self.regex.is_match(text),
        }
    }
}

fn keyword_rules<'a>(
    words: impl IntoIterator<Item = &'a str>,
    field: RuleField,
) -> Result<Vec<KeywordRule>, regex::Error> {
    words
        .into_iter()
        .filter(|w| !w.trim().is_empty())
        .map(|w| KeywordRule::new(w, field))
        .collect()
}

/// Rule-based classifier.
pub struct RuleClassifier {
    identities: HashSet<String>,
    urgent_rules: Vec<KeywordRule>,
    action_rules: Vec<KeywordRule>,
    low_signal_rules: Vec<KeywordRule>,
    signature: Option<String>,
}

impl RuleClassifier {
    /// Build a classifier with the built-in markers plus configured keywords.
    pub fn new(
        identities: HashSet<String>,
        urgent_keywords: &[String],
        low_signal_keywords: &[String],
    ) -> Result<Self, regex::Error> {
        let urgent_rules = keyword_rules(urgent_keywords.iter().map(String::as_str), RuleField::Text)?;
        let action_rules = keyword_rules(ACTION_MARKERS.iter().copied(), RuleField::Text)?;

        let mut low_signal_rules =
            keyword_rules(["noreply", "no-reply", "notification"], RuleField::Sender)?;
        low_signal_rules.extend(keyword_rules(
            LOW_SIGNAL_MARKERS
                .iter()
                .copied()
                .chain(low_signal_keywords.iter().map(String::as_str)),
            RuleField::Text,
        )?);

        Ok(Self {
            identities,
            urgent_rules,
            action_rules,
            low_signal_rules,
            signature: None,
        })
    }

    /// Classifier for the configured identities, keywords and signature.
    pub fn from_config(config: &TriageConfig) -> Result<Self, ConfigError> {
        let rules = Self::new(
            config.sender_identities(),
            &config.triage.urgent_keywords,
            &config.triage.low_signal_keywords,
        )
        .map_err(|e| ConfigError::InvalidValue {
            key: "triage".into(),
            message: format!("keyword rule failed to compile: {e}"),
        })?;
        Ok(rules.with_signature(config.drafting.signature.clone()))
    }

    /// Signature appended to templated replies.
    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Whether any To/Cc recipient is one of the owner's addresses.
    pub fn addressed_to_self(&self, message: &Message) -> bool {
        message.targets_any(&self.identities, true)
    }

    /// Classify with rules alone. Reason is prefixed `[rules]`.
    pub fn classify_rules(&self, message: &Message, history: &SenderHistory) -> Verdict {
        let mut verdict = self.evaluate(message, history);
        verdict.reason = format!("[rules] {}", verdict.reason);
        verdict
    }

    /// Rule verdict with an unprefixed reason.
    pub fn evaluate(&self, message: &Message, history: &SenderHistory) -> Verdict {
        let sender = message.sender_email();
        let text = format!("{}\n{}", message.subject, message.text());
        let mut reasons: Vec<String> = Vec::new();

        let urgent = self.first_match(&self.urgent_rules, &sender, &text);
        let low_signal = self.first_match(&self.low_signal_rules, &sender, &text);

        let priority = if history.is_vip {
            reasons.push("vip sender".to_string());
            Priority::High
        } else if self.addressed_to_self(message) {
            reasons.push("addressed to self".to_string());
            Priority::High
        } else if let Some(rule) = urgent {
            reasons.push(format!("urgent keyword '{}'", rule.keyword));
            Priority::High
        } else if let Some(rule) = low_signal {
            reasons.push(format!("low-signal marker '{}'", rule.keyword));
            Priority::Low
        } else {
            reasons.push("no priority rule matched".to_string());
            Priority::Medium
        };

        let action = self.first_match(&self.action_rules, &sender, &text);
        let actionable = match action {
            Some(rule) if priority == Priority::Low => {
                reasons.push(format!("request marker '{}' ignored for low-signal mail", rule.keyword));
                false
            }
            Some(rule) => {
                reasons.push(format!("request marker '{}'", rule.keyword));
                true
            }
            None => false,
        };

        let subject = if message.subject.trim().is_empty() {
            "(no subject)"
        } else {
            message.subject.trim()
        };
        let from = match message.sender_display() {
            s if s.is_empty() => "unknown sender".to_string(),
            s => s,
        };
        let reply_text = if actionable {
            append_signature(fallback_reply(priority), self.signature())
        } else {
            String::new()
        };

        debug!(
            id = %message.id,
            sender = %sender,
            priority = %priority,
            actionable,
            "Rule classification"
        );

        Verdict {
            priority,
            actionable,
            reason: reasons.join("; "),
            summary: format!("From {from} about '{subject}'"),
            reply_text,
            source: VerdictSource::Rules,
        }
    }

    fn first_match<'a>(
        &self,
        rules: &'a [KeywordRule],
        sender: &str,
        text: &str,
    ) -> Option<&'a KeywordRule> {
        rules.iter().find(|r| r.matches(sender, text))
    }
}
