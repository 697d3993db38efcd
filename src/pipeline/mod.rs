//! Triage pipeline.
//!
//! Every candidate flows through:
//! 1. `Ledger` eligibility check (settled records are skipped)
//! 2. `Classifier::classify()`: AI backend with rule fallback, never fails
//! 3. VIP override and auto-promotion
//! 4. Draft and archive side effects (apply mode only)
//! 5. One ledger transaction per message
//!
//! [`daemon::run_loop`] repeats cycles on an interval.

pub mod classifier;
pub mod daemon;
pub mod engine;
pub mod reply;
pub mod rules;
pub mod types;

pub use classifier::{AiClassifier, Classifier, FallbackClassifier};
pub use engine::{CycleParams, EnginePolicy, TriageEngine};
pub use rules::RuleClassifier;
pub use types::{Priority, SenderHistory, Verdict, VerdictSource};
