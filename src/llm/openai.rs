//! Responses API backend (API-key auth) over `reqwest`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use super::{CompletionRequest, ReasoningBackend, truncate_detail};
use crate::config::CodexSettings;
use crate::error::LlmError;

const BACKEND_NAME: &str = "codex-api";

pub struct ResponsesBackend {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
    reasoning_effort: Option<String>,
    base_url: String,
}

impl ResponsesBackend {
    pub fn new(settings: &CodexSettings) -> Result<Self, LlmError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: "no API key configured".to_string(),
            })?;

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model: settings.model.clone(),
            reasoning_effort: settings.reasoning_effort.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "input": request.prompt,
        });
        if let Some(ref effort) = self.reasoning_effort {
            body["reasoning"] = json!({"effort": effort});
        }
        if let Some(ref schema) = request.schema {
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": "triage_verdict",
                    "schema": schema,
                    "strict": true,
                }
            });
        }
        body
    }
}

#[async_trait]
impl ReasoningBackend for ResponsesBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let url = format!("{}/responses", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                backend: BACKEND_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::RequestFailed {
            backend: BACKEND_NAME.to_string(),
            reason: format!("failed to read body: {e}"),
        })?;

        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                backend: BACKEND_NAME.to_string(),
            });
        }
        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                backend: BACKEND_NAME.to_string(),
                reason: format!("HTTP {}: {}", status.as_u16(), truncate_detail(&text, 500)),
            });
        }

        let value: Value = serde_json::from_str(&text).map_err(|_| LlmError::InvalidResponse {
            backend: BACKEND_NAME.to_string(),
            reason: format!("non-JSON body: {}", truncate_detail(&text, 200)),
        })?;

        let output = extract_output_text(&value).ok_or_else(|| LlmError::InvalidResponse {
            backend: BACKEND_NAME.to_string(),
            reason: "response had no output text".to_string(),
        })?;
        debug!(model = %self.model, chars = output.len(), "Responses API call complete");
        Ok(output)
    }
}

/// Pull the text out of a Responses API payload.
///
/// Prefers the top-level `output_text`; otherwise joins every text part in
/// `output[].content[]`.
pub fn extract_output_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("output_text").and_then(Value::as_str)
        && !text.trim().is_empty()
    {
        return Some(text.trim().to_string());
    }

    let parts: Vec<&str> = payload
        .get("output")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|t| !t.trim().is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n").trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodexAuthMode;

    fn backend(effort: Option<&str>) -> ResponsesBackend {
        ResponsesBackend::new(&CodexSettings {
            model: "gpt-5-codex".into(),
            reasoning_effort: effort.map(str::to_string),
            auth_mode: CodexAuthMode::ApiKey,
            api_key: Some("sk-test".into()),
            base_url: "https://example.test/v1/".into(),
        })
        .unwrap()
    }

    #[test]
    fn output_text_preferred() {
        let payload = json!({"output_text": " {\"a\":1} ", "output": []});
        assert_eq!(extract_output_text(&payload).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn output_parts_joined() {
        let payload = json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "first"},
                    {"type": "output_text", "text": "second"}
                ]}
            ]
        });
        assert_eq!(extract_output_text(&payload).unwrap(), "first\nsecond");
    }

    #[test]
    fn empty_payload_has_no_text() {
        assert!(extract_output_text(&json!({})).is_none());
        assert!(extract_output_text(&json!({"output": []})).is_none());
    }

    #[test]
    fn request_body_includes_effort_and_schema() {
        let b = backend(Some("low"));
        let req = CompletionRequest::new("prompt").with_schema(json!({"type": "object"}));
        let body = b.request_body(&req);
        assert_eq!(body["model"], "gpt-5-codex");
        assert_eq!(body["reasoning"]["effort"], "low");
        assert_eq!(body["text"]["format"]["type"], "json_schema");
        assert_eq!(b.base_url, "https://example.test/v1");
    }

    #[test]
    fn request_body_omits_unset_fields() {
        let body = backend(None).request_body(&CompletionRequest::new("p"));
        assert!(body.get("reasoning").is_none());
        assert!(body.get("text").is_none());
    }
}
