//! Error types for email triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),
}

/// Configuration-related errors. Always fatal before a cycle starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched:\n{searched}\nSet EMAIL_TRIAGE_CONFIG or pass --config.")]
    NotFound { searched: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox collaborator errors.
///
/// Transient failures leave the message to be retried on the next cycle;
/// permanent ones are recorded against the message.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("transient mailbox failure: {0}")]
    Transient(String),

    #[error("mailbox request rejected: {0}")]
    Permanent(String),

    #[error("mailbox not found (name={name:?}, role={role:?})")]
    MailboxNotFound { name: String, role: Option<String> },
}

impl MailboxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Reasoning backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Backend {backend} rate limited")]
    RateLimited { backend: String },

    #[error("Backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-message triage failures. Recorded as `status = error`.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("{0}")]
    Mailbox(#[from] MailboxError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Ledger write failed: {0}")]
    Ledger(#[from] DatabaseError),

    /// A draft exists in the mailbox but its id is not in the ledger. Ends
    /// the cycle.
    #[error("Draft {draft_id} for {email_id} could not be recorded: {source}")]
    DraftNotRecorded {
        email_id: String,
        draft_id: String,
        source: DatabaseError,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
