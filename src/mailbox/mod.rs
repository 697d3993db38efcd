//! Mailbox collaborator: the remote store the triage core reads from and
//! applies side effects to.
//!
//! The core only sees [`MailboxClient`]; [`JmapClient`] is the production
//! adapter.

pub mod jmap;
pub mod reply;
pub mod types;

pub use jmap::JmapClient;
pub use types::{Address, Message};

use async_trait::async_trait;

use crate::error::MailboxError;

/// Trait for mailbox adapters. Pure I/O, no triage logic.
///
/// Implementations must report network trouble as
/// [`MailboxError::Transient`] so the engine can leave the message for the
/// next cycle.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Up to `limit` candidate messages from `mailbox`, newest first.
    async fn list_candidates(
        &self,
        mailbox: &str,
        limit: usize,
    ) -> Result<Vec<Message>, MailboxError>;

    /// Store a reply (reply-all, quoting the thread) in `drafts_mailbox`.
    /// Returns the new draft's identifier.
    async fn create_reply_draft(
        &self,
        message: &Message,
        body: &str,
        drafts_mailbox: &str,
    ) -> Result<String, MailboxError>;

    /// Move a message between mailboxes.
    async fn move_message(
        &self,
        id: &str,
        from_mailbox: &str,
        to_mailbox: &str,
    ) -> Result<(), MailboxError>;
}
