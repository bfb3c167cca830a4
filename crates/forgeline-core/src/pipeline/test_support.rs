//! Scripted in-memory collaborators for controller and registry tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::artifacts::{
    ChangeOp, CodeChanges, FileChange, FixHint, PlanStep, PrDescription, PushResult, RefactorPlan,
    RefactorSpec, ValidationResult,
};
use super::collaborators::{
    CollabResult, Collaborators, GitOperations, IntakeAgent, LineSink, NarrateAgent, PlanAgent,
    PlanContext, TransformAgent, TransformContext, Validator,
};
use super::types::{ConfirmationMode, PipelineInput, PipelineSettings, RepoSource};
use crate::ai::intent::KeywordIntentClassifier;
use crate::error::CollaboratorError;

/// One object implementing every stage collaborator, with knobs for failure
/// injection and counters for assertions.
#[derive(Default)]
pub struct ScriptedAgents {
    /// Number of upcoming validations that report a failing build.
    pub failing_validations: AtomicU32,
    pub fail_intake: AtomicBool,
    pub fail_push: AtomicBool,
    /// Makes validation sleep, to exercise cancellation mid-build.
    pub validation_delay: Mutex<Option<Duration>>,

    pub plan_calls: AtomicU32,
    pub transform_calls: AtomicU32,
    pub validate_calls: AtomicU32,
    pub push_called: AtomicBool,
    pub plan_feedback: Mutex<Vec<Option<String>>>,
    pub fix_hints: Mutex<Vec<Option<FixHint>>>,
    pub pushed: Mutex<Option<(String, String)>>,
}

impl ScriptedAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(validations: u32) -> Arc<Self> {
        let agents = Self::default();
        agents.failing_validations.store(validations, Ordering::SeqCst);
        Arc::new(agents)
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            intake: self.clone(),
            planner: self.clone(),
            transformer: self.clone(),
            validator: self.clone(),
            narrator: self.clone(),
            classifier: Arc::new(KeywordIntentClassifier),
            git: self.clone(),
        }
    }
}

#[async_trait]
impl IntakeAgent for ScriptedAgents {
    async fn intake(&self, prompt: &str) -> CollabResult<RefactorSpec> {
        if self.fail_intake.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected("could not parse request".into()));
        }
        Ok(RefactorSpec {
            title: "Rename service".into(),
            goal: prompt.to_string(),
            ..RefactorSpec::default()
        })
    }
}

#[async_trait]
impl PlanAgent for ScriptedAgents {
    async fn plan(&self, _spec: &RefactorSpec, ctx: &PlanContext) -> CollabResult<RefactorPlan> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        self.plan_feedback.lock().push(ctx.feedback.clone());
        Ok(RefactorPlan {
            summary: "Rename UserService to AccountService".into(),
            steps: vec![PlanStep {
                description: "Rename class".into(),
                files: vec!["src/AccountService.java".into()],
            }],
            risks: Vec::new(),
        })
    }
}

#[async_trait]
impl TransformAgent for ScriptedAgents {
    async fn transform(
        &self,
        _plan: &RefactorPlan,
        ctx: &TransformContext,
        fix_hint: Option<&FixHint>,
    ) -> CollabResult<CodeChanges> {
        self.transform_calls.fetch_add(1, Ordering::SeqCst);
        self.fix_hints.lock().push(fix_hint.cloned());
        Ok(CodeChanges {
            changes: vec![FileChange {
                path: "src/AccountService.java".into(),
                operation: ChangeOp::Create,
                content: Some(format!("class AccountService {{}} // attempt {}", ctx.attempt)),
            }],
            summary: "renamed".into(),
        })
    }
}

#[async_trait]
impl Validator for ScriptedAgents {
    async fn validate(
        &self,
        _changes: &CodeChanges,
        _repo_path: &Path,
        on_line: LineSink<'_>,
        cancel: &CancellationToken,
    ) -> CollabResult<ValidationResult> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        on_line("[INFO] Compiling 1 source file");

        let delay = *self.validation_delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(ValidationResult { success: false, command: "mvn".into(), ..ValidationResult::default() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let fail = self
            .failing_validations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            on_line("[ERROR] /src/AccountService.java:[1,7] cannot find symbol");
            return Ok(ValidationResult {
                success: false,
                command: "mvn -B test".into(),
                exit_code: Some(1),
                output_tail: vec!["BUILD FAILURE".into()],
                ..ValidationResult::default()
            });
        }
        on_line("BUILD SUCCESS");
        Ok(ValidationResult {
            success: true,
            command: "mvn -B test".into(),
            exit_code: Some(0),
            duration_ms: 12,
            ..ValidationResult::default()
        })
    }
}

#[async_trait]
impl NarrateAgent for ScriptedAgents {
    async fn narrate(
        &self,
        changes: &CodeChanges,
        _validation: &ValidationResult,
    ) -> CollabResult<PrDescription> {
        Ok(PrDescription {
            title: "Rename UserService".into(),
            body: format!("{} file(s) changed", changes.changes.len()),
            commit_message: None,
        })
    }
}

#[async_trait]
impl GitOperations for ScriptedAgents {
    async fn clone_repo(
        &self,
        _repo_url: &str,
        _token: Option<&str>,
        _branch: Option<&str>,
        dest: &Path,
    ) -> CollabResult<PathBuf> {
        std::fs::create_dir_all(dest).map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        Ok(dest.to_path_buf())
    }

    async fn commit_and_push(
        &self,
        _repo_path: &Path,
        branch: &str,
        message: &str,
    ) -> CollabResult<PushResult> {
        self.push_called.store(true, Ordering::SeqCst);
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "remote: Permission denied".into(),
            ));
        }
        *self.pushed.lock() = Some((branch.to_string(), message.to_string()));
        Ok(PushResult {
            branch: branch.to_string(),
            commit: "abc1234".into(),
            remote: "origin".into(),
        })
    }
}

pub fn local_input(repo: &Path, mode: ConfirmationMode) -> PipelineInput {
    PipelineInput {
        prompt: "Rename UserService to AccountService".into(),
        mode,
        repo: RepoSource::Local {
            path: repo.to_path_buf(),
        },
        target_branch: None,
        build_command: None,
        max_retries: None,
    }
}

pub fn settings(root: &Path, max_retries: u32) -> PipelineSettings {
    PipelineSettings {
        max_retries,
        checkpoint_timeout: Duration::from_secs(5),
        session_ttl: Duration::from_secs(60),
        workspace_root: root.to_path_buf(),
    }
}
