//! Validator collaborator that builds and tests the checkout with its own
//! build tool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::detect::{self, BuildSystem};
use super::diagnostics::parse_build_output;
use super::streamer;
use crate::constants::build::{DEFAULT_TIMEOUT_SECS, OUTPUT_TAIL_LINES};
use crate::error::CollaboratorError;
use crate::pipeline::artifacts::{CodeChanges, ValidationResult};
use crate::pipeline::collaborators::{CollabResult, LineSink, Validator};

#[derive(Debug, Clone)]
pub struct CommandValidator {
    /// Overrides detection when set.
    command: Option<String>,
    timeout: Duration,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self {
            command: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl CommandValidator {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout,
        }
    }

    /// `Ok(None)` means there is nothing to build.
    fn resolve_command(&self, repo_path: &Path) -> CollabResult<Option<String>> {
        if let Some(command) = &self.command {
            return Ok(Some(command.clone()));
        }
        let Some(system) = detect::detect(repo_path) else {
            return Ok(None);
        };
        if let Some(tool) = system.required_tool() {
            which::which(tool).map_err(|_| {
                CollaboratorError::Unavailable(format!(
                    "{} project detected but `{}` is not on PATH",
                    describe(system),
                    tool
                ))
            })?;
        }
        Ok(Some(system.command().to_string()))
    }
}

fn describe(system: BuildSystem) -> &'static str {
    match system {
        BuildSystem::Maven | BuildSystem::MavenWrapper => "Maven",
        BuildSystem::Gradle | BuildSystem::GradleWrapper => "Gradle",
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(
        &self,
        changes: &CodeChanges,
        repo_path: &Path,
        on_line: LineSink<'_>,
        cancel: &CancellationToken,
    ) -> CollabResult<ValidationResult> {
        let Some(command) = self.resolve_command(repo_path)? else {
            tracing::warn!(
                repo = %repo_path.display(),
                "No build system detected, skipping validation"
            );
            on_line("No build system detected; validation skipped");
            return Ok(ValidationResult {
                success: true,
                ..ValidationResult::default()
            });
        };

        tracing::info!(
            command = %command,
            files = changes.changes.len(),
            "Validating changes"
        );

        let outcome = streamer::run(&command, repo_path, on_line, self.timeout, cancel)
            .await
            .map_err(|e| {
                CollaboratorError::Unavailable(format!("failed to start `{}`: {}", command, e))
            })?;

        let diagnostics = if outcome.success() {
            Vec::new()
        } else {
            parse_build_output(&outcome.lines)
        };

        if outcome.dropped_lines > 0 {
            tracing::debug!(dropped = outcome.dropped_lines, "Build output exceeded capture window");
        }

        Ok(ValidationResult {
            success: outcome.success(),
            command,
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            duration_ms: outcome.duration.as_millis() as u64,
            diagnostics,
            output_tail: outcome.tail(OUTPUT_TAIL_LINES),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    async fn validate(validator: &CommandValidator, dir: &Path) -> (CollabResult<ValidationResult>, Vec<String>) {
        let seen = Mutex::new(Vec::new());
        let on_line = |line: &str| seen.lock().push(line.to_string());
        let result = validator
            .validate(&CodeChanges::default(), dir, &on_line, &CancellationToken::new())
            .await;
        (result, seen.into_inner())
    }

    #[tokio::test]
    async fn failing_command_yields_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(
            Some("echo '[ERROR] /x/App.java:[3,7] cannot find symbol'; exit 1".into()),
            Duration::from_secs(10),
        );
        let (result, seen) = validate(&validator, dir.path()).await;
        let result = result.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.diagnostics[0].line, Some(3));
        assert_eq!(seen, result.output_tail);
    }

    #[tokio::test]
    async fn passing_command_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(Some("echo ok".into()), Duration::from_secs(10));
        let (result, _) = validate(&validator, dir.path()).await;
        let result = result.unwrap();
        assert!(result.success);
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.command, "echo ok");
    }

    #[tokio::test]
    async fn no_build_system_is_a_skipped_success() {
        let dir = tempfile::tempdir().unwrap();
        let (result, seen) = validate(&CommandValidator::default(), dir.path()).await;
        assert!(result.unwrap().success);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn timeout_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(Some("sleep 30".into()), Duration::from_millis(200));
        let (result, _) = validate(&validator, dir.path()).await;
        let result = result.unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
    }
}
