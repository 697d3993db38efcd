//! Message types handed to the triage core by the mailbox collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named mailbox participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub email: String,
}

impl Address {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `Name <email>`, or whichever half is present.
    pub fn display(&self) -> String {
        let name = self.name.as_deref().map(str::trim).unwrap_or_default();
        let email = self.email.trim();
        match (name.is_empty(), email.is_empty()) {
            (false, false) => format!("{name} <{email}>"),
            (true, _) => email.to_string(),
            (false, true) => name.to_string(),
        }
    }

    /// Lowercased bare address.
    pub fn normalized(&self) -> String {
        normalize_address(&self.email)
    }
}

/// An inbound message as seen at fetch time. Read-only to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Opaque mailbox identifier.
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preview: String,
    /// Plain-text body, including any quoted thread content.
    #[serde(default)]
    pub body: String,
    /// `Message-ID` header values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl Message {
    /// Normalised sender address, empty when unknown.
    pub fn sender_email(&self) -> String {
        self.from.as_ref().map(Address::normalized).unwrap_or_default()
    }

    pub fn sender_display(&self) -> String {
        self.from.as_ref().map(Address::display).unwrap_or_default()
    }

    /// Body text, or the preview when the body is empty.
    pub fn text(&self) -> &str {
        if self.body.trim().is_empty() {
            self.preview.trim()
        } else {
            self.body.trim()
        }
    }

    /// Whether any recipient is in `identities`. Cc is optional.
    pub fn targets_any(&self, identities: &std::collections::HashSet<String>, include_cc: bool) -> bool {
        if identities.is_empty() {
            return false;
        }
        let cc: &[Address] = if include_cc { &self.cc } else { &[] };
        self.to
            .iter()
            .chain(cc.iter())
            .map(Address::normalized)
            .any(|addr| !addr.is_empty() && identities.contains(&addr))
    }
}

/// Normalise a raw address: trim, lowercase, drop `mailto:`, unwrap `<...>`.
pub fn normalize_address(raw: &str) -> String {
    let mut normalized = raw.trim().to_lowercase();
    if let Some(rest) = normalized.strip_prefix("mailto:") {
        normalized = rest.to_string();
    }
    if let (Some(lt), Some(gt)) = (normalized.rfind('<'), normalized.rfind('>'))
        && gt > lt
    {
        normalized = normalized[lt + 1..gt].trim().to_string();
    }
    normalized
}

/// Split comma-separated address arguments, normalise, and de-duplicate
/// while keeping first-seen order.
pub fn split_addresses<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        for part in raw.as_ref().split(',') {
            let addr = normalize_address(part);
            if !addr.is_empty() && !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    out
}
