//! Configuration types and loading.
//!
//! Configuration is read from a YAML or JSON file (explicit path, then
//! `EMAIL_TRIAGE_CONFIG`, then the default locations under
//! `~/.config/email-triage/`). Secrets may come from the environment instead.
//! Any problem here is a [`ConfigError`] and aborts before the first cycle.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mailbox::types::normalize_address;
use crate::pipeline::types::Priority;

/// Default location of the state database.
pub const DEFAULT_STATE_DB: &str = "~/.config/email-triage/triage.db";

const DEFAULT_SESSION_URL: &str = "https://api.fastmail.com/jmap/session";
const DEFAULT_CODEX_MODEL: &str = "gpt-5-codex";
const DEFAULT_CODEX_BASE_URL: &str = "https://api.openai.com/v1";

/// A value that may be written either as a list or as one delimited string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    /// Flatten into individual entries, splitting on `,`, `;` and newlines.
    pub fn entries(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .flat_map(|s| s.split([',', ';', '\n']))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Full configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub fastmail: FastmailConfig,
    pub mail: MailConfig,
    pub automation: AutomationConfig,
    pub triage: TriageRulesConfig,
    pub drafting: DraftingConfig,
    pub ai: AiConfig,
    pub logging: LoggingConfig,
}

/// JMAP account access.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FastmailConfig {
    pub api_token: Option<String>,
    pub session_url: String,
    pub api_url: Option<String>,
    pub account_id: Option<String>,
}

impl Default for FastmailConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            session_url: DEFAULT_SESSION_URL.to_string(),
            api_url: None,
            account_id: None,
        }
    }
}

/// Mailbox names and self identities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub mailbox: String,
    pub drafts_mailbox: String,
    pub archive_mailbox: String,
    /// Addresses that identify the mailbox owner.
    pub sender_emails: Option<StringOrList>,
    /// Address used as `From` on drafts.
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".to_string(),
            drafts_mailbox: "Drafts".to_string(),
            archive_mailbox: "Archive".to_string(),
            sender_emails: None,
            sender_email: None,
            sender_name: None,
        }
    }
}

/// Which side effect wins when a message is both draft- and archive-eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPrecedence {
    /// Drafted messages stay in the inbox.
    #[default]
    DraftFirst,
    /// Archive-eligible messages are archived and never drafted.
    ArchiveFirst,
    /// Draft, then archive as well.
    DraftThenArchive,
}

/// Side-effect policy and cycle sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub max_emails_per_cycle: usize,
    pub auto_draft: bool,
    pub auto_archive_low_priority: bool,
    pub auto_archive_priorities: Option<StringOrList>,
    pub reply_all: bool,
    pub min_priority_for_draft: Option<String>,
    pub require_direct_recipient: bool,
    pub action_precedence: ActionPrecedence,
    pub state_db: String,
    pub loop_interval_seconds: u64,
    pub use_codex: bool,
    pub codex_timeout_seconds: u64,
    pub codex_fallback_to_rules: bool,
    pub codex_max_body_chars: usize,
    pub codex_max_failures_per_cycle: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            max_emails_per_cycle: 20,
            auto_draft: true,
            auto_archive_low_priority: true,
            auto_archive_priorities: None,
            reply_all: true,
            min_priority_for_draft: None,
            require_direct_recipient: false,
            action_precedence: ActionPrecedence::default(),
            state_db: DEFAULT_STATE_DB.to_string(),
            loop_interval_seconds: 900,
            use_codex: true,
            codex_timeout_seconds: 60,
            codex_fallback_to_rules: true,
            codex_max_body_chars: 4000,
            codex_max_failures_per_cycle: 3,
        }
    }
}

impl AutomationConfig {
    /// Priorities that are moved to the archive in apply mode.
    ///
    /// Unset means `[low, medium]`, or nothing when
    /// `auto_archive_low_priority` is false. Unknown values are dropped.
    pub fn archive_priorities(&self) -> BTreeSet<Priority> {
        match &self.auto_archive_priorities {
            Some(values) => values
                .entries()
                .iter()
                .filter_map(|v| v.parse::<Priority>().ok())
                .collect(),
            None if self.auto_archive_low_priority => {
                [Priority::Low, Priority::Medium].into_iter().collect()
            }
            None => BTreeSet::new(),
        }
    }

    /// Lowest priority that may receive a draft, if a floor is configured.
    pub fn draft_priority_floor(&self) -> Result<Option<Priority>, ConfigError> {
        match self.min_priority_for_draft.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<Priority>().map(Some).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "automation.min_priority_for_draft".into(),
                    message: format!("'{raw}' is not one of high, medium, low"),
                }
            }),
        }
    }

    pub fn codex_timeout(&self) -> Duration {
        Duration::from_secs(self.codex_timeout_seconds.max(1))
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_seconds.max(1))
    }
}

/// Rule-classifier inputs and VIP policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriageRulesConfig {
    pub urgent_keywords: Vec<String>,
    pub low_signal_keywords: Vec<String>,
    pub vip_senders: Vec<String>,
    /// High-priority count at which a sender is promoted to VIP. 0 disables.
    pub vip_frequency_threshold: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DraftingConfig {
    pub signature: Option<String>,
}

/// How the Codex backend authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodexAuthMode {
    /// Local `codex` CLI with a ChatGPT login.
    Subscription,
    /// Direct HTTP calls with an API key.
    ApiKey,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub backend: String,
    pub codex: CodexConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend: "codex".to_string(),
            codex: CodexConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodexConfig {
    pub model: Option<String>,
    #[serde(alias = "reasoning")]
    pub reasoning_effort: Option<String>,
    pub auth_mode: Option<String>,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
}

/// Resolved reasoning-backend settings.
#[derive(Debug, Clone)]
pub struct CodexSettings {
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub auth_mode: CodexAuthMode,
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for a daily rolling log file, in addition to stderr.
    pub dir: Option<String>,
}

impl TriageConfig {
    /// Locate and load the configuration file.
    ///
    /// Returns the parsed config and the path it came from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit {
            candidates.push(expand_tilde(&path.to_string_lossy()));
        }
        if let Ok(env_path) = std::env::var("EMAIL_TRIAGE_CONFIG")
            && !env_path.trim().is_empty()
        {
            candidates.push(expand_tilde(&env_path));
        }
        for name in ["config.yaml", "config.yml", "config.json"] {
            candidates.push(expand_tilde(&format!("~/.config/email-triage/{name}")));
        }

        let mut seen = HashSet::new();
        for candidate in &candidates {
            if !seen.insert(candidate.clone()) || !candidate.exists() {
                continue;
            }
            let config = Self::from_path(candidate)?;
            return Ok((config, candidate.clone()));
        }

        let searched = candidates
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(ConfigError::NotFound { searched })
    }

    /// Parse a config file; the format is chosen from its extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let name = name.strip_suffix(".example").unwrap_or(&name);

        let parse_err = |reason: String| ConfigError::ParseError {
            path: path.display().to_string(),
            reason,
        };

        let config: Self = if name.ends_with(".json") {
            serde_json::from_str(&raw).map_err(|e| parse_err(e.to_string()))?
        } else if name.ends_with(".yaml") || name.ends_with(".yml") {
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&raw).map_err(|e| parse_err(e.to_string()))?
            }
        } else {
            return Err(parse_err("unsupported config format".into()));
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, mid-cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.automation.draft_priority_floor()?;
        if self.automation.use_codex {
            self.codex_settings()?;
        }
        Ok(())
    }

    /// Resolve AI backend settings, pulling the API key from the environment
    /// when it is not in the file.
    pub fn codex_settings(&self) -> Result<CodexSettings, ConfigError> {
        let backend = self.ai.backend.trim().to_lowercase();
        if backend != "codex" {
            return Err(ConfigError::InvalidValue {
                key: "ai.backend".into(),
                message: format!("unsupported backend '{backend}'; set ai.backend: codex"),
            });
        }

        let codex = &self.ai.codex;
        let api_key = codex
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                let env_name = codex.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
                std::env::var(env_name).ok()
            })
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .or_else(|| std::env::var("CODEX_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());

        let requested = codex
            .auth_mode
            .as_deref()
            .unwrap_or("subscription")
            .trim()
            .to_lowercase();
        let auth_mode = match requested.as_str() {
            "subscription" => CodexAuthMode::Subscription,
            "api_key" => CodexAuthMode::ApiKey,
            "auto" if api_key.is_some() => CodexAuthMode::ApiKey,
            "auto" => CodexAuthMode::Subscription,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "ai.codex.auth_mode".into(),
                    message: format!("'{other}' is not one of subscription, api_key, auto"),
                });
            }
        };

        if auth_mode == CodexAuthMode::ApiKey && api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "ai.codex.api_key".into(),
                hint: "Set ai.codex.api_key or OPENAI_API_KEY (or CODEX_API_KEY).".into(),
            });
        }

        let reasoning_effort = codex
            .reasoning_effort
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        Ok(CodexSettings {
            model: codex
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CODEX_MODEL.to_string()),
            reasoning_effort,
            auth_mode,
            api_key,
            base_url: codex
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_CODEX_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// JMAP API token from the file or `FASTMAIL_API_TOKEN`.
    pub fn api_token(&self) -> Result<String, ConfigError> {
        self.fastmail
            .api_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var("FASTMAIL_API_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "fastmail.api_token".into(),
                hint: "Set fastmail.api_token in config or FASTMAIL_API_TOKEN in environment."
                    .into(),
            })
    }

    /// Normalised addresses that identify the mailbox owner.
    pub fn sender_identities(&self) -> HashSet<String> {
        self.mail
            .sender_emails
            .as_ref()
            .map(|v| v.entries())
            .unwrap_or_default()
            .iter()
            .map(|e| normalize_address(e))
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// State DB path with `~` expanded.
    pub fn state_db_path(&self) -> PathBuf {
        expand_tilde(&self.automation.state_db)
    }
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return PathBuf::from(home).join(path.trim_start_matches('~').trim_start_matches('/'));
    }
    PathBuf::from(path)
}
