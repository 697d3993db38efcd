//! Email triage: classify incoming mail, draft replies, archive the rest.

pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod report;
pub mod store;

pub use error::{Error, Result};
