//! Reasoning backends for AI-assisted triage.
//!
//! Supports:
//! - **Responses API**: direct HTTP calls with an API key
//! - **Codex CLI**: `codex exec` subprocess using the local ChatGPT login
//!
//! Both sit behind [`ReasoningBackend`]; the classifier never sees which one
//! it is talking to.

pub mod codex_cli;
pub mod openai;

pub use codex_cli::CodexCliBackend;
pub use openai::ResponsesBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{CodexAuthMode, CodexSettings};
use crate::error::LlmError;

/// A single prompt, optionally constrained to a JSON schema.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub schema: Option<Value>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// A black-box text oracle. Calls have no side effects on failure.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Backend name for logs and error messages.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Run one prompt and return the raw output text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Create a reasoning backend from resolved settings.
///
/// The subscription backend checks the CLI login here, so a missing login
/// surfaces before the first cycle rather than on every message.
pub async fn create_backend(
    settings: &CodexSettings,
) -> Result<Arc<dyn ReasoningBackend>, LlmError> {
    match settings.auth_mode {
        CodexAuthMode::ApiKey => {
            let backend = ResponsesBackend::new(settings)?;
            tracing::info!("Using Responses API (model: {})", settings.model);
            Ok(Arc::new(backend))
        }
        CodexAuthMode::Subscription => {
            let backend = CodexCliBackend::connect(settings).await?;
            tracing::info!("Using codex CLI subscription (model: {})", settings.model);
            Ok(Arc::new(backend))
        }
    }
}

/// Builds a reasoning backend on demand. Lets the classifier try again
/// after a backend could not be set up.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn build(&self) -> Result<Arc<dyn ReasoningBackend>, LlmError>;
}

#[async_trait]
impl BackendFactory for CodexSettings {
    async fn build(&self) -> Result<Arc<dyn ReasoningBackend>, LlmError> {
        create_backend(self).await
    }
}

/// Shorten backend output for error messages.
pub(crate) fn truncate_detail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(auth_mode: CodexAuthMode, api_key: Option<&str>) -> CodexSettings {
        CodexSettings {
            model: "gpt-5-codex".to_string(),
            reasoning_effort: None,
            auth_mode,
            api_key: api_key.map(str::to_string),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    #[tokio::test]
    async fn api_key_backend_constructs_without_network() {
        let backend = create_backend(&settings(CodexAuthMode::ApiKey, Some("sk-test")))
            .await
            .unwrap();
        assert_eq!(backend.name(), "codex-api");
        assert_eq!(backend.model_name(), "gpt-5-codex");
    }

    #[tokio::test]
    async fn api_key_backend_requires_key() {
        let result = create_backend(&settings(CodexAuthMode::ApiKey, None)).await;
        assert!(matches!(result, Err(LlmError::Unavailable { .. })));
    }

    #[test]
    fn request_builder_sets_schema() {
        let req = CompletionRequest::new("hi").with_schema(serde_json::json!({"type": "object"}));
        assert_eq!(req.prompt, "hi");
        assert!(req.schema.is_some());
    }

    #[test]
    fn truncate_detail_marks_cut() {
        assert_eq!(truncate_detail("  short ", 10), "short");
        assert_eq!(truncate_detail("abcdefghij", 4), "abcd...");
    }
}
