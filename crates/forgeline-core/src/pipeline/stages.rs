//! Stage executors. Each takes typed input plus its collaborator and returns
//! a typed artifact or a `StageFailure` saying how the controller should react.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;

use super::artifacts::{
    CodeChanges, FileChange, FixHint, PrDescription, PushResult, RefactorPlan, RefactorSpec,
    ValidationResult,
};
use super::collaborators::{
    GitOperations, IntakeAgent, LineSink, NarrateAgent, PlanAgent, PlanContext, TransformAgent,
    TransformContext, Validator,
};
use super::types::{RepoSource, Stage};
use crate::build::diagnostics;
use crate::error::CollaboratorError;
use crate::workspace;

const REPO_SUMMARY_MAX_ENTRIES: usize = 400;

/// How the controller should treat a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Feed back into regeneration if retries remain.
    Retryable,
    /// Build or tests failed; retryable with diagnostics as fix hint.
    Validation,
    /// No retry; session fails.
    Terminal,
    /// External system (git, build tool) could not do its job.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub detail: String,
    /// Collaborator gave up after its own transient-retry budget.
    pub transient: bool,
    pub validation: Option<ValidationResult>,
}

pub type StageResult<T> = Result<T, StageFailure>;

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
            transient: false,
            validation: None,
        }
    }

    fn from_collaborator(stage: Stage, err: CollaboratorError) -> Self {
        let kind = match (stage, &err) {
            (_, CollaboratorError::Unavailable(_)) => FailureKind::Unavailable,
            (Stage::Transformation, _) => FailureKind::Retryable,
            _ => FailureKind::Terminal,
        };
        let mut failure = Self::new(stage, kind, err.detail());
        failure.transient = matches!(err, CollaboratorError::Transient(_));
        failure
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Retryable | FailureKind::Validation)
    }

    /// Context for the next transformation attempt.
    pub fn fix_hint(&self, attempt: u32) -> FixHint {
        match &self.validation {
            Some(result) => FixHint {
                attempt,
                summary: self.detail.clone(),
                diagnostics: result.diagnostics.clone(),
                output_tail: result.output_tail.clone(),
                user_feedback: None,
            },
            None => FixHint {
                attempt,
                summary: self.detail.clone(),
                ..FixHint::default()
            },
        }
    }
}

/// Where the session's checkout ended up.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub path: PathBuf,
    pub cloned: bool,
}

/// Clone a remote repository into `dest`, or validate a local checkout.
pub async fn prepare_workspace(
    git: &dyn GitOperations,
    source: &RepoSource,
    dest: &Path,
) -> StageResult<PreparedWorkspace> {
    match source {
        RepoSource::Remote { url, token, branch } => {
            let path = git
                .clone_repo(url, token.as_deref(), branch.as_deref(), dest)
                .await
                .map_err(|e| StageFailure::from_collaborator(Stage::Intake, e))?;
            Ok(PreparedWorkspace { path, cloned: true })
        }
        RepoSource::Local { path } => {
            if !path.is_dir() {
                return Err(StageFailure::new(
                    Stage::Intake,
                    FailureKind::Terminal,
                    format!("repository path {} is not a directory", path.display()),
                ));
            }
            Ok(PreparedWorkspace {
                path: path.clone(),
                cloned: false,
            })
        }
    }
}

pub async fn run_intake(agent: &dyn IntakeAgent, prompt: &str) -> StageResult<RefactorSpec> {
    if prompt.trim().is_empty() {
        return Err(StageFailure::new(
            Stage::Intake,
            FailureKind::Terminal,
            "prompt is empty",
        ));
    }
    agent
        .intake(prompt)
        .await
        .map_err(|e| StageFailure::from_collaborator(Stage::Intake, e))
}

pub async fn run_planning(
    agent: &dyn PlanAgent,
    spec: &RefactorSpec,
    repo_path: &Path,
    feedback: Option<String>,
) -> StageResult<RefactorPlan> {
    let repo_summary = summarize_repo(repo_path).await;
    let ctx = PlanContext {
        repo_path: repo_path.to_path_buf(),
        repo_summary,
        feedback,
    };
    let plan = agent
        .plan(spec, &ctx)
        .await
        .map_err(|e| StageFailure::from_collaborator(Stage::Planning, e))?;
    if plan.steps.is_empty() {
        return Err(StageFailure::new(
            Stage::Planning,
            FailureKind::Terminal,
            "plan has no steps",
        ));
    }
    Ok(plan)
}

/// Generate code changes and write them into the checkout. `on_applied` is
/// called once per file written.
pub async fn run_transformation(
    agent: &dyn TransformAgent,
    plan: &RefactorPlan,
    ctx: &TransformContext,
    fix_hint: Option<&FixHint>,
    mut on_applied: impl FnMut(&FileChange),
) -> StageResult<CodeChanges> {
    let changes = agent
        .transform(plan, ctx, fix_hint)
        .await
        .map_err(|e| StageFailure::from_collaborator(Stage::Transformation, e))?;

    if changes.changes.is_empty() {
        return Err(StageFailure::new(
            Stage::Transformation,
            FailureKind::Retryable,
            "transformation produced no changes",
        ));
    }

    for change in &changes.changes {
        workspace::apply_change(&ctx.repo_path, change).map_err(|e| {
            StageFailure::new(Stage::Transformation, FailureKind::Retryable, e.to_string())
        })?;
        on_applied(change);
    }
    Ok(changes)
}

/// Run the build. A failed build becomes a `Validation` failure carrying the
/// result so the diagnostics can drive the next attempt.
pub async fn run_validation(
    validator: &dyn Validator,
    changes: &CodeChanges,
    repo_path: &Path,
    on_line: LineSink<'_>,
    cancel: &CancellationToken,
) -> StageResult<ValidationResult> {
    let result = validator
        .validate(changes, repo_path, on_line, cancel)
        .await
        .map_err(|e| StageFailure::from_collaborator(Stage::Validation, e))?;

    if result.success {
        return Ok(result);
    }

    let detail = if result.timed_out {
        format!("build timed out after {}ms", result.duration_ms)
    } else {
        diagnostics::summarize(&result.diagnostics, &result.output_tail)
    };
    Err(StageFailure {
        stage: Stage::Validation,
        kind: FailureKind::Validation,
        detail,
        transient: false,
        validation: Some(result),
    })
}

pub async fn run_narration(
    agent: &dyn NarrateAgent,
    changes: &CodeChanges,
    validation: &ValidationResult,
) -> StageResult<PrDescription> {
    agent
        .narrate(changes, validation)
        .await
        .map_err(|e| StageFailure::from_collaborator(Stage::Narration, e))
}

pub async fn run_git_operations(
    git: &dyn GitOperations,
    repo_path: &Path,
    branch: &str,
    message: &str,
) -> StageResult<PushResult> {
    git.commit_and_push(repo_path, branch, message)
        .await
        .map_err(|e| StageFailure::new(Stage::GitOperations, FailureKind::Unavailable, e.detail()))
}

/// Newline-separated listing of tracked-looking files, honouring .gitignore.
pub async fn summarize_repo(repo_path: &Path) -> String {
    let root = repo_path.to_path_buf();
    let listing = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&root).hidden(true).git_ignore(true).build();
        for entry in walker.flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&root) {
                files.push(rel.display().to_string());
            }
            if files.len() >= REPO_SUMMARY_MAX_ENTRIES {
                files.push("...".to_string());
                break;
            }
        }
        files.join("\n")
    })
    .await;

    listing.unwrap_or_else(|e| {
        tracing::warn!("Repository listing failed: {}", e);
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifacts::{BuildDiagnostic, Severity};

    #[test]
    fn collaborator_errors_map_by_stage() {
        let f = StageFailure::from_collaborator(
            Stage::Planning,
            CollaboratorError::Transient("rate limited".into()),
        );
        assert_eq!(f.kind, FailureKind::Terminal);
        assert!(f.transient);

        let f = StageFailure::from_collaborator(
            Stage::Transformation,
            CollaboratorError::Rejected("bad json".into()),
        );
        assert!(f.is_retryable());

        let f = StageFailure::from_collaborator(
            Stage::Narration,
            CollaboratorError::Unavailable("connection refused".into()),
        );
        assert_eq!(f.kind, FailureKind::Unavailable);
    }

    #[test]
    fn fix_hint_carries_diagnostics() {
        let result = ValidationResult {
            success: false,
            diagnostics: vec![BuildDiagnostic {
                file: Some("A.java".into()),
                line: Some(3),
                column: None,
                severity: Severity::Error,
                message: "cannot find symbol".into(),
            }],
            output_tail: vec!["BUILD FAILURE".into()],
            ..ValidationResult::default()
        };
        let failure = StageFailure {
            stage: Stage::Validation,
            kind: FailureKind::Validation,
            detail: "1 error".into(),
            transient: false,
            validation: Some(result),
        };
        let hint = failure.fix_hint(2);
        assert_eq!(hint.attempt, 2);
        assert_eq!(hint.diagnostics.len(), 1);
        assert_eq!(hint.output_tail, vec!["BUILD FAILURE".to_string()]);
    }

    #[tokio::test]
    async fn repo_summary_respects_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/Main.java"), "class Main {}").unwrap();
        std::fs::write(dir.path().join("target/Main.class"), "").unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        // .gitignore is only honoured inside a repository
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();

        let summary = summarize_repo(dir.path()).await;
        assert!(summary.contains("Main.java"));
        assert!(!summary.contains("Main.class"));
    }
}
