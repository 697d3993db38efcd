//! JMAP mailbox adapter (Fastmail-compatible) over `reqwest`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use super::reply::compose_reply;
use super::types::{Address, Message};
use super::MailboxClient;
use crate::config::TriageConfig;
use crate::error::{ConfigError, MailboxError};

const CORE_CAPABILITY: &str = "urn:ietf:params:jmap:core";
const MAIL_CAPABILITY: &str = "urn:ietf:params:jmap:mail";

/// Per-request timeout for JMAP calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest body value fetched per message.
const MAX_BODY_VALUE_BYTES: u64 = 120_000;

const EMAIL_PROPERTIES: &[&str] = &[
    "id",
    "subject",
    "from",
    "to",
    "cc",
    "receivedAt",
    "sentAt",
    "preview",
    "textBody",
    "bodyValues",
    "keywords",
    "messageId",
    "references",
];

#[derive(Debug, Clone)]
struct Session {
    api_url: String,
    account_id: String,
    account_email: Option<String>,
}

#[derive(Debug, Clone)]
struct MailboxInfo {
    id: String,
    name: String,
    role: Option<String>,
}

/// JMAP client bound to one account.
pub struct JmapClient {
    http: reqwest::Client,
    token: SecretString,
    session_url: String,
    api_url: Option<String>,
    account_id: Option<String>,
    session: OnceCell<Session>,
    mailboxes: RwLock<Option<Vec<MailboxInfo>>>,
    reply_all: bool,
    own_addresses: HashSet<String>,
    sender_email: Option<String>,
    sender_name: Option<String>,
}

impl JmapClient {
    /// Build a client from configuration. Fails fast on missing credentials.
    pub fn from_config(config: &TriageConfig) -> Result<Self, ConfigError> {
        let token = config.api_token()?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "fastmail".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let mut own_addresses = config.sender_identities();
        let sender_email = config
            .mail
            .sender_email
            .as_deref()
            .map(super::types::normalize_address)
            .filter(|s| !s.is_empty());
        if let Some(ref s) = sender_email {
            own_addresses.insert(s.clone());
        }

        Ok(Self {
            http,
            token: SecretString::from(token),
            session_url: config.fastmail.session_url.clone(),
            api_url: config.fastmail.api_url.clone(),
            account_id: config.fastmail.account_id.clone(),
            session: OnceCell::new(),
            mailboxes: RwLock::new(None),
            reply_all: config.automation.reply_all,
            own_addresses,
            sender_email,
            sender_name: config.mail.sender_name.clone().filter(|s| !s.trim().is_empty()),
        })
    }

    async fn session(&self) -> Result<&Session, MailboxError> {
        self.session
            .get_or_try_init(|| async {
                let raw = self.http_json(reqwest::Method::GET, &self.session_url, None).await?;
                let session = parse_session(&raw, self.api_url.clone(), self.account_id.clone())?;
                info!(account = %session.account_id, "JMAP session established");
                Ok(session)
            })
            .await
    }

    async fn http_json(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<Value, MailboxError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(self.token.expose_secret())
            .header("Accept", "application/json");
        if let Some(body) = payload {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| MailboxError::Transient(format!("network error: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| MailboxError::Transient(format!("failed to read response: {e}")))?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(MailboxError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 300)
            )));
        }
        if !status.is_success() {
            return Err(MailboxError::Permanent(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 300)
            )));
        }

        serde_json::from_str(&text).map_err(|_| {
            MailboxError::Permanent(format!("invalid JSON response: {}", truncate(&text, 300)))
        })
    }

    /// Issue a JMAP request; method-level errors become permanent failures.
    async fn call(&self, method_calls: Value) -> Result<Value, MailboxError> {
        let session = self.session().await?;
        let payload = json!({
            "using": [CORE_CAPABILITY, MAIL_CAPABILITY],
            "methodCalls": method_calls,
        });
        let response = self
            .http_json(reqwest::Method::POST, &session.api_url, Some(&payload))
            .await?;

        if let Some(responses) = response.get("methodResponses").and_then(Value::as_array) {
            for item in responses {
                if item.get(0).and_then(Value::as_str) == Some("error") {
                    let detail = item.get(1).cloned().unwrap_or(Value::Null);
                    let kind = detail.get("type").and_then(Value::as_str).unwrap_or("unknown");
                    let desc = detail.get("description").and_then(Value::as_str).unwrap_or("");
                    let call_id = item.get(2).and_then(Value::as_str).unwrap_or("?");
                    return Err(MailboxError::Permanent(
                        format!("JMAP error ({call_id}): {kind} {desc}").trim().to_string(),
                    ));
                }
            }
        }
        Ok(response)
    }

    async fn mailboxes(&self) -> Result<Vec<MailboxInfo>, MailboxError> {
        if let Some(cached) = self.mailboxes.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let account_id = self.session().await?.account_id.clone();
        let response = self
            .call(json!([
                ["Mailbox/query", {
                    "accountId": account_id,
                    "sort": [{"property": "name", "isAscending": true}],
                }, "mbq"],
                ["Mailbox/get", {
                    "accountId": account_id,
                    "#ids": {"resultOf": "mbq", "name": "Mailbox/query", "path": "/ids"},
                    "properties": ["id", "name", "role"],
                }, "mbg"],
            ]))
            .await?;

        let list = get_call(&response, "mbg")?
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let parsed: Vec<MailboxInfo> = list
            .iter()
            .filter_map(|m| {
                Some(MailboxInfo {
                    id: m.get("id")?.as_str()?.to_string(),
                    name: m.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                    role: m.get("role").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect();

        debug!(count = parsed.len(), "Loaded mailboxes");
        *self.mailboxes.write().await = Some(parsed.clone());
        Ok(parsed)
    }

    async fn mailbox_id(&self, name: &str) -> Result<String, MailboxError> {
        let mailboxes = self.mailboxes().await?;
        find_mailbox(&mailboxes, name).map(|m| m.id.clone())
    }
}

#[async_trait]
impl MailboxClient for JmapClient {
    async fn list_candidates(
        &self,
        mailbox: &str,
        limit: usize,
    ) -> Result<Vec<Message>, MailboxError> {
        let mailbox_id = self.mailbox_id(mailbox).await?;
        let account_id = self.session().await?.account_id.clone();

        let response = self
            .call(json!([
                ["Email/query", {
                    "accountId": account_id,
                    "filter": {"inMailbox": mailbox_id, "notKeyword": "$seen"},
                    "sort": [{"property": "receivedAt", "isAscending": false}],
                    "position": 0,
                    "limit": limit.max(1),
                }, "eq"],
                ["Email/get", {
                    "accountId": account_id,
                    "#ids": {"resultOf": "eq", "name": "Email/query", "path": "/ids"},
                    "properties": EMAIL_PROPERTIES,
                    "fetchTextBodyValues": true,
                    "maxBodyValueBytes": MAX_BODY_VALUE_BYTES,
                }, "eg"],
            ]))
            .await?;

        let list = get_call(&response, "eg")?
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(list.iter().map(parse_email).collect())
    }

    async fn create_reply_draft(
        &self,
        message: &Message,
        body: &str,
        drafts_mailbox: &str,
    ) -> Result<String, MailboxError> {
        let session = self.session().await?;
        let mut own = self.own_addresses.clone();
        if let Some(ref email) = session.account_email {
            own.insert(email.clone());
        }

        let reply = compose_reply(message, body, self.reply_all, &own).ok_or_else(|| {
            MailboxError::Permanent(format!("message {} has no sender", message.id))
        })?;
        let drafts_id = self.mailbox_id(drafts_mailbox).await?;

        let mut email = json!({
            "mailboxIds": {drafts_id: true},
            "keywords": {"$draft": true},
            "to": addresses_json(&reply.to),
            "subject": reply.subject,
            "textBody": [{"partId": "1", "type": "text/plain"}],
            "bodyValues": {"1": {"value": reply.body}},
        });
        if !reply.cc.is_empty() {
            email["cc"] = addresses_json(&reply.cc);
        }
        if let Some(from) = self.sender_email.clone().or_else(|| session.account_email.clone()) {
            let mut entry = json!({"email": from});
            if let Some(ref name) = self.sender_name {
                entry["name"] = json!(name);
            }
            email["from"] = json!([entry]);
        }
        if !reply.in_reply_to.is_empty() {
            email["inReplyTo"] = json!(reply.in_reply_to);
        }
        if !reply.references.is_empty() {
            email["references"] = json!(reply.references);
        }

        let response = self
            .call(json!([
                ["Email/set", {
                    "accountId": session.account_id,
                    "create": {"draft-1": email},
                }, "es"],
            ]))
            .await?;
        let result = get_call(&response, "es")?;

        if let Some(failure) = result.get("notCreated").and_then(|n| n.get("draft-1")) {
            return Err(MailboxError::Permanent(format!(
                "draft create failed: {}",
                set_error_reason(failure)
            )));
        }
        let draft_id = result
            .get("created")
            .and_then(|c| c.get("draft-1"))
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| MailboxError::Permanent("draft created but no id returned".into()))?;

        info!(email_id = %message.id, draft_id = %draft_id, "Reply draft created");
        Ok(draft_id.to_string())
    }

    async fn move_message(
        &self,
        id: &str,
        from_mailbox: &str,
        to_mailbox: &str,
    ) -> Result<(), MailboxError> {
        let from_id = self.mailbox_id(from_mailbox).await?;
        let to_id = self.mailbox_id(to_mailbox).await?;
        let account_id = self.session().await?.account_id.clone();

        let mut patch = serde_json::Map::new();
        patch.insert(format!("mailboxIds/{from_id}"), Value::Null);
        patch.insert(format!("mailboxIds/{to_id}"), Value::Bool(true));

        let response = self
            .call(json!([
                ["Email/set", {
                    "accountId": account_id,
                    "update": {id: Value::Object(patch)},
                }, "es"],
            ]))
            .await?;
        let result = get_call(&response, "es")?;

        if let Some(failure) = result.get("notUpdated").and_then(|n| n.get(id)) {
            return Err(MailboxError::Permanent(format!(
                "move failed: {}",
                set_error_reason(failure)
            )));
        }

        debug!(email_id = %id, from = %from_mailbox, to = %to_mailbox, "Message moved");
        Ok(())
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

fn parse_session(
    raw: &Value,
    api_url: Option<String>,
    account_id: Option<String>,
) -> Result<Session, MailboxError> {
    let api_url = api_url
        .or_else(|| raw.get("apiUrl").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| MailboxError::Permanent("no apiUrl found in session response".into()))?;

    let account_id = account_id
        .or_else(|| {
            raw.get("primaryAccounts")
                .and_then(|p| p.get(MAIL_CAPABILITY))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            raw.get("accounts")
                .and_then(Value::as_object)
                .and_then(|a| a.keys().next().cloned())
        })
        .ok_or_else(|| MailboxError::Permanent("no usable accountId in session response".into()))?;

    let account_email = raw
        .get("accounts")
        .and_then(|a| a.get(&account_id))
        .and_then(|acct| {
            ["email", "emailAddress", "name"]
                .iter()
                .filter_map(|k| acct.get(*k).and_then(Value::as_str))
                .map(super::types::normalize_address)
                .find(|s| s.contains('@'))
        });

    Ok(Session {
        api_url,
        account_id,
        account_email,
    })
}

fn get_call<'a>(response: &'a Value, call_id: &str) -> Result<&'a Value, MailboxError> {
    response
        .get("methodResponses")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get(2).and_then(Value::as_str) == Some(call_id))
        })
        .and_then(|item| item.get(1))
        .ok_or_else(|| MailboxError::Permanent(format!("missing call response for {call_id}")))
}

/// Role hints for well-known mailbox names.
fn role_hint(name: &str) -> Option<&'static str> {
    match name.trim().to_lowercase().as_str() {
        "inbox" => Some("inbox"),
        "sent" | "sent messages" => Some("sent"),
        "drafts" => Some("drafts"),
        "trash" | "deleted" => Some("trash"),
        "junk" | "spam" => Some("junk"),
        "archive" => Some("archive"),
        _ => None,
    }
}

fn find_mailbox<'a>(mailboxes: &'a [MailboxInfo], name: &str) -> Result<&'a MailboxInfo, MailboxError> {
    let role = role_hint(name);
    if let Some(role) = role
        && let Some(found) = mailboxes
            .iter()
            .find(|m| m.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(role)))
    {
        return Ok(found);
    }
    let wanted = name.trim().to_lowercase();
    mailboxes
        .iter()
        .find(|m| m.name.trim().to_lowercase() == wanted)
        .ok_or_else(|| MailboxError::MailboxNotFound {
            name: name.to_string(),
            role: role.map(str::to_string),
        })
}

fn parse_addresses(value: Option<&Value>) -> Vec<Address> {
    value
        .and_then(Value::as_array)
        .map(|people| {
            people
                .iter()
                .map(|p| Address {
                    name: p
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .filter(|n| !n.trim().is_empty()),
                    email: p.get("email").and_then(Value::as_str).unwrap_or("").to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Concatenate text body parts; fall back to any body value, then preview.
fn extract_text(email: &Value) -> String {
    let values = email.get("bodyValues");
    let chunks: Vec<&str> = email
        .get("textBody")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("partId").and_then(Value::as_str))
                .filter_map(|id| values?.get(id)?.get("value")?.as_str())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !chunks.is_empty() {
        return chunks.join("\n\n").trim().to_string();
    }

    if let Some(first) = values
        .and_then(Value::as_object)
        .and_then(|m| m.values().next())
        .and_then(|v| v.get("value"))
        .and_then(Value::as_str)
    {
        return first.trim().to_string();
    }
    String::new()
}

fn parse_email(email: &Value) -> Message {
    let received_at = email
        .get("receivedAt")
        .or_else(|| email.get("sentAt"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    Message {
        id: email.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
        subject: email.get("subject").and_then(Value::as_str).unwrap_or("").to_string(),
        from: parse_addresses(email.get("from")).into_iter().next(),
        to: parse_addresses(email.get("to")),
        cc: parse_addresses(email.get("cc")),
        received_at,
        preview: email.get("preview").and_then(Value::as_str).unwrap_or("").to_string(),
        body: extract_text(email),
        message_id: string_list(email.get("messageId")),
        references: string_list(email.get("references")),
    }
}

fn addresses_json(addresses: &[Address]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|a| match a.name {
                Some(ref name) => json!({"email": a.email, "name": name}),
                None => json!({"email": a.email}),
            })
            .collect(),
    )
}

fn set_error_reason(failure: &Value) -> String {
    failure
        .get("description")
        .or_else(|| failure.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
