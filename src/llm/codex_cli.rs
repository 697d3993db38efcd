//! Codex CLI backend (subscription auth).
//!
//! Each call runs `codex exec` in a throwaway directory, feeding the prompt on
//! stdin and reading the final message from the `-o` file. The child is
//! killed if the caller's future is dropped (e.g. on timeout).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::{CompletionRequest, ReasoningBackend, truncate_detail};
use crate::config::CodexSettings;
use crate::error::LlmError;

const BACKEND_NAME: &str = "codex-cli";

/// Scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create() -> Result<Self, LlmError> {
        let path = std::env::temp_dir().join(format!("email-triage-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

pub struct CodexCliBackend {
    binary: String,
    model: String,
    reasoning_effort: Option<String>,
}

impl CodexCliBackend {
    /// Locate the CLI and verify it is logged in.
    pub async fn connect(settings: &CodexSettings) -> Result<Self, LlmError> {
        let binary = std::env::var("CODEX_BIN")
            .ok()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| "codex".to_string());

        let output = Command::new(&binary)
            .args(["login", "status"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| LlmError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("failed to run '{binary} login status': {e}"),
            })?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!(
                    "not logged in ({}); run 'codex login'",
                    truncate_detail(&detail, 200)
                ),
            });
        }

        Ok(Self {
            binary,
            model: settings.model.clone(),
            reasoning_effort: settings.reasoning_effort.clone(),
        })
    }

    fn command(&self, schema_path: Option<&Path>, output_path: &Path, work_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "exec",
            "--ephemeral",
            "--skip-git-repo-check",
            "--sandbox",
            "read-only",
            "--model",
            self.model.as_str(),
            "--color",
            "never",
        ]);
        if let Some(ref effort) = self.reasoning_effort {
            cmd.arg("-c").arg(format!("model_reasoning_effort=\"{effort}\""));
        }
        if let Some(schema) = schema_path {
            cmd.arg("--output-schema").arg(schema);
        }
        cmd.arg("-o")
            .arg(output_path)
            .arg("-")
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReasoningBackend for CodexCliBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let scratch = ScratchDir::create()?;
        let output_path = scratch.path().join("last_message.txt");
        let schema_path = match request.schema {
            Some(ref schema) => {
                let path = scratch.path().join("schema.json");
                tokio::fs::write(&path, serde_json::to_vec(schema)?).await?;
                Some(path)
            }
            None => None,
        };

        let mut child = self
            .command(schema_path.as_deref(), &output_path, scratch.path())
            .spawn()
            .map_err(|e| LlmError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("failed to spawn '{}': {e}", self.binary),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::RequestFailed {
                backend: BACKEND_NAME.to_string(),
                reason: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    truncate_detail(&stderr, 500)
                ),
            });
        }

        let mut text = tokio::fs::read_to_string(&output_path)
            .await
            .unwrap_or_default();
        if text.trim().is_empty() {
            text = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                backend: BACKEND_NAME.to_string(),
                reason: "empty output".to_string(),
            });
        }

        debug!(model = %self.model, chars = text.len(), "codex exec complete");
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(effort: Option<&str>) -> CodexCliBackend {
        CodexCliBackend {
            binary: "codex".into(),
            model: "gpt-5-codex".into(),
            reasoning_effort: effort.map(str::to_string),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_is_read_only_and_ephemeral() {
        let b = backend(None);
        let cmd = b.command(None, Path::new("/tmp/out.txt"), Path::new("/tmp"));
        let args = args(&cmd);
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--ephemeral".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--sandbox" && w[1] == "read-only"));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "/tmp/out.txt"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(!args.contains(&"--output-schema".to_string()));
    }

    #[test]
    fn command_passes_schema_and_effort() {
        let b = backend(Some("high"));
        let cmd = b.command(
            Some(Path::new("/tmp/schema.json")),
            Path::new("/tmp/out.txt"),
            Path::new("/tmp"),
        );
        let args = args(&cmd);
        assert!(args.contains(&"model_reasoning_effort=\"high\"".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--output-schema" && w[1] == "/tmp/schema.json"));
    }

    #[test]
    fn scratch_dir_removed_on_drop() {
        let path = {
            let scratch = ScratchDir::create().unwrap();
            assert!(scratch.path().exists());
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
