//! Shared types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Priority ────────────────────────────────────────────────────────

/// Triage priority. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: '{other}'")),
        }
    }
}

// ── Verdict ─────────────────────────────────────────────────────────

/// Which classifier produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// The AI backend answered.
    Codex,
    /// Rules only; the AI backend was disabled or not requested.
    Rules,
    /// Rules, after the AI backend failed or the breaker was open.
    RulesFallback,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Rules => "rules",
            Self::RulesFallback => "rules_fallback",
        }
    }
}

/// Classifier output for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub priority: Priority,
    pub actionable: bool,
    pub reason: String,
    pub summary: String,
    /// Proposed reply body. Empty when no reply is suggested.
    pub reply_text: String,
    pub source: VerdictSource,
}

// ── Sender history ──────────────────────────────────────────────────

/// What the ledger knows about a sender, handed to the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderHistory {
    /// Normalised sender address.
    pub sender: String,
    /// High-priority records for this sender, excluding the current message.
    pub prior_high_count: u32,
    pub is_vip: bool,
}
