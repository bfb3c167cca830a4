//! Pipeline controller: one task per session driving the stage state machine.
//!
//! The controller is the only writer of `PipelineState`. Every change goes
//! through `transition`/`commit`, which publishes the progress event first and
//! then the state snapshot, so a watcher never sees a state without its event.

mod checkpoint;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::artifacts::{CodeChanges, FileChange, FixHint, RefactorPlan, RefactorSpec, ValidationResult};
use super::broadcaster::{ProgressBroadcaster, Subscription};
use super::collaborators::{Collaborators, TransformContext};
use super::events::{EventType, ProgressEvent};
use super::rendezvous::{ConfirmationMessage, ConfirmationRendezvous};
use super::stages::{self, FailureKind, StageFailure, StageResult};
use super::types::{
    Artifacts, CheckpointKind, ErrorInfo, PipelineInput, PipelineSettings, PipelineState, Stage,
    Status,
};
use crate::constants;
use crate::error::{PipelineError, RendezvousError};
use crate::git;
use crate::workspace::WorkspaceLease;

use checkpoint::CheckpointDecision;

/// How long an in-flight build gets to tear down its process tree after cancel.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Shared, cloneable view of a running (or finished) session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    broadcaster: Arc<ProgressBroadcaster>,
    rendezvous: Arc<ConfirmationRendezvous>,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn snapshot(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.broadcaster.snapshot()
    }

    /// Deliver a checkpoint answer. Rejected when nothing is pending.
    pub fn confirm(&self, message: ConfirmationMessage) -> Result<CheckpointKind, RendezvousError> {
        self.rendezvous.resolve(message)
    }

    pub fn pending_checkpoint(&self) -> Option<CheckpointKind> {
        self.rendezvous.pending()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Resolve once the session reaches a terminal status.
    pub async fn wait_terminal(&self) -> PipelineState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(|s| s.is_terminal()).await {
            return state.clone();
        }
        // Controller gone without a terminal state; report what it left
        rx.borrow().clone()
    }
}

/// Publishes out-of-band events (file writes, build lines) with the
/// stage/status/progress captured when it was created.
#[derive(Clone)]
struct LiveEmitter {
    broadcaster: Arc<ProgressBroadcaster>,
    template: ProgressEvent,
}

impl LiveEmitter {
    fn emit(&self, event_type: EventType, message: String, data: Option<serde_json::Value>) {
        let mut event = self.template.clone();
        event.event_type = event_type;
        event.message = message;
        event.data = data;
        event.timestamp = Utc::now();
        self.broadcaster.publish(event);
    }
}

pub struct PipelineController {
    state: PipelineState,
    input: PipelineInput,
    settings: PipelineSettings,
    collab: Collaborators,
    broadcaster: Arc<ProgressBroadcaster>,
    rendezvous: Arc<ConfirmationRendezvous>,
    state_tx: Arc<watch::Sender<PipelineState>>,
    cancel: CancellationToken,
    working_dir: PathBuf,
    _lease: Option<WorkspaceLease>,
}

impl PipelineController {
    /// Build the session and spawn its controller task. Returns immediately.
    pub fn start(
        session_id: String,
        input: PipelineInput,
        settings: PipelineSettings,
        collab: Collaborators,
        working_dir: PathBuf,
        lease: Option<WorkspaceLease>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let max_retries = input.max_retries.unwrap_or(settings.max_retries);
        let state = PipelineState::new(session_id.clone(), &input, max_retries);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let rendezvous = Arc::new(ConfirmationRendezvous::new(session_id.clone()));
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            session_id,
            broadcaster: Arc::clone(&broadcaster),
            rendezvous: Arc::clone(&rendezvous),
            state: state_rx,
            cancel: cancel.clone(),
        };

        let controller = Self {
            state,
            input,
            settings,
            collab,
            broadcaster,
            rendezvous,
            state_tx: Arc::new(state_tx),
            cancel,
            working_dir,
            _lease: lease,
        };

        let task = tokio::spawn(controller.run());
        (handle, task)
    }

    async fn run(mut self) {
        let session_id = self.state.session_id.clone();
        let state_tx = Arc::clone(&self.state_tx);
        let broadcaster = Arc::clone(&self.broadcaster);

        tracing::info!(session_id = %session_id, mode = ?self.state.mode, "Pipeline started");

        let outcome = AssertUnwindSafe(async move {
            let result = self.drive().await;
            self.finish(result);
        })
        .catch_unwind()
        .await;

        if outcome.is_err() {
            tracing::error!(session_id = %session_id, "Pipeline task panicked");
            let mut state = state_tx.borrow().clone();
            if !state.is_terminal() {
                state.status = Status::Failed;
                state.error = Some(ErrorInfo {
                    kind: "internal_error".to_string(),
                    message: "pipeline task panicked".to_string(),
                });
                state.end_time = Some(Utc::now());
                state.updated_at = Utc::now();
                let event = ProgressEvent::draft(&state, EventType::Failed, "Pipeline crashed")
                    .with_data(json!({ "kind": "internal_error" }));
                broadcaster.publish(event);
                state_tx.send_replace(state);
            }
        }
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let spec = self.intake().await?;
        let plan = self.planning(&spec).await?;
        let (changes, validation) = self.transform_until_valid(&spec, &plan).await?;

        self.enter(Stage::Narration, "Writing pull request description");
        let narration = self
            .guarded(stages::run_narration(
                &*self.collab.narrator,
                &changes,
                &validation,
            ))
            .await?
            .map_err(|f| self.fatal(f))?;
        Artifacts::record(&mut self.state.artifacts.narration, narration.clone(), "narration");
        self.complete_stage(
            Stage::Narration,
            "Pull request description ready",
            Some(json!({ "title": narration.title })),
        );

        let mut branch = self
            .input
            .target_branch
            .clone()
            .unwrap_or_else(|| default_branch(&self.state.session_id));
        let mut message = narration
            .commit_message
            .clone()
            .unwrap_or_else(|| narration.title.clone());

        if self.state.mode.requires(CheckpointKind::Push) {
            let summary = format!("Push to '{}' with message '{}'", branch, message);
            let data = json!({ "branch": branch, "commit_message": message, "narration": narration });
            self.await_checkpoint(CheckpointKind::Push, summary, data).await?;
            if let Some(overrides) = self.state.confirmation_data.as_ref().map(|c| &c.overrides) {
                if let Some(name) = overrides.branch_name.as_deref() {
                    if git::is_valid_branch_name(name) {
                        branch = name.to_string();
                    } else {
                        tracing::warn!(session_id = %self.state.session_id, branch = name, "Ignoring invalid branch override");
                    }
                }
                if let Some(msg) = overrides.commit_message.as_deref() {
                    message = msg.to_string();
                }
            }
        }

        self.enter(Stage::GitOperations, format!("Committing and pushing to {}", branch));
        let repo = self.repo_path();
        let push = self
            .guarded(stages::run_git_operations(
                &*self.collab.git,
                &repo,
                &branch,
                &message,
            ))
            .await?
            .map_err(|f| self.fatal(f))?;
        Artifacts::record(&mut self.state.artifacts.push, push.clone(), "push");
        self.complete_stage(
            Stage::GitOperations,
            format!("Pushed {} to {}", push.commit, push.branch),
            Some(json!(push)),
        );
        Ok(())
    }

    async fn intake(&mut self) -> Result<RefactorSpec, PipelineError> {
        self.enter(Stage::Intake, "Preparing workspace");
        let prepared = self
            .guarded(stages::prepare_workspace(
                &*self.collab.git,
                &self.input.repo,
                &self.working_dir,
            ))
            .await?
            .map_err(|f| self.fatal(f))?;
        self.working_dir = prepared.path.clone();
        self.state.working_dir = Some(prepared.path);

        let spec = self
            .guarded(stages::run_intake(&*self.collab.intake, &self.input.prompt))
            .await?
            .map_err(|f| self.fatal(f))?;
        Artifacts::record(&mut self.state.artifacts.spec, spec.clone(), "spec");
        self.complete_stage(
            Stage::Intake,
            format!("Request understood: {}", spec.title),
            Some(json!(spec)),
        );
        Ok(spec)
    }

    /// Plan, and re-plan with user feedback until the plan is approved.
    async fn planning(&mut self, spec: &RefactorSpec) -> Result<RefactorPlan, PipelineError> {
        let mut feedback = None;
        loop {
            self.enter(Stage::Planning, "Planning the refactor");
            let repo = self.repo_path();
            let plan = self
                .guarded(stages::run_planning(
                    &*self.collab.planner,
                    spec,
                    &repo,
                    feedback.take(),
                ))
                .await?
                .map_err(|f| self.fatal(f))?;
            self.complete_stage(
                Stage::Planning,
                format!("Plan ready with {} step(s)", plan.steps.len()),
                Some(json!(plan)),
            );

            if !self.state.mode.requires(CheckpointKind::Plan) {
                Artifacts::record(&mut self.state.artifacts.plan, plan.clone(), "plan");
                return Ok(plan);
            }

            let data = json!({ "plan": plan });
            match self
                .await_checkpoint(CheckpointKind::Plan, plan.summary.clone(), data)
                .await?
            {
                CheckpointDecision::Approve => {
                    Artifacts::record(&mut self.state.artifacts.plan, plan.clone(), "plan");
                    return Ok(plan);
                }
                CheckpointDecision::Modify(text) => {
                    tracing::info!(session_id = %self.state.session_id, "Re-planning with user feedback");
                    feedback = text;
                }
            }
        }
    }

    /// Transformation and validation, regenerating on failure until the
    /// build passes or the retry budget is spent.
    async fn transform_until_valid(
        &mut self,
        spec: &RefactorSpec,
        plan: &RefactorPlan,
    ) -> Result<(CodeChanges, ValidationResult), PipelineError> {
        let mut hint: Option<FixHint> = None;
        loop {
            let attempt = match self.transform_once(spec, plan, hint.as_ref()).await? {
                Ok(changes) => self.validate_once(&changes).await?.map(|v| (changes, v)),
                Err(failure) => Err(failure),
            };

            let (changes, validation) = match attempt {
                Ok(pair) => pair,
                Err(failure) => {
                    hint = Some(self.retry_or_fail(failure)?);
                    continue;
                }
            };

            if self.state.mode.requires(CheckpointKind::Validation) {
                let summary = format!(
                    "{} file(s) changed, build passed in {}ms",
                    changes.changes.len(),
                    validation.duration_ms
                );
                let data = json!({ "changes": changes.paths(), "validation": validation });
                if let CheckpointDecision::Modify(text) = self
                    .await_checkpoint(CheckpointKind::Validation, summary, data)
                    .await?
                {
                    hint = Some(FixHint {
                        attempt: self.state.retry_count,
                        summary: "Changes requested at validation review".to_string(),
                        user_feedback: text,
                        ..FixHint::default()
                    });
                    continue;
                }
            }

            Artifacts::record(
                &mut self.state.artifacts.code_changes,
                changes.clone(),
                "code_changes",
            );
            Artifacts::record(&mut self.state.artifacts.validation, validation.clone(), "validation");
            return Ok((changes, validation));
        }
    }

    async fn transform_once(
        &mut self,
        spec: &RefactorSpec,
        plan: &RefactorPlan,
        hint: Option<&FixHint>,
    ) -> Result<StageResult<CodeChanges>, PipelineError> {
        let message = match hint {
            Some(h) => format!("Regenerating changes (attempt {})", h.attempt + 1),
            None => "Generating code changes".to_string(),
        };
        self.enter(Stage::Transformation, message);

        let ctx = TransformContext {
            repo_path: self.repo_path(),
            spec: spec.clone(),
            attempt: self.state.retry_count + 1,
        };
        let emitter = self.emitter();
        let mut applied: Vec<String> = Vec::new();
        let on_applied = |change: &FileChange| {
            applied.push(change.path.clone());
            emitter.emit(
                EventType::FileChanged,
                format!("{} {}", change.operation.as_str(), change.path),
                Some(json!({ "path": change.path, "operation": change.operation })),
            );
        };

        let result = self
            .guarded(stages::run_transformation(
                &*self.collab.transformer,
                plan,
                &ctx,
                hint,
                on_applied,
            ))
            .await;

        for path in applied {
            if !self.state.applied_files.contains(&path) {
                self.state.applied_files.push(path);
            }
        }

        let result = result?;
        if let Ok(changes) = &result {
            self.complete_stage(
                Stage::Transformation,
                format!("Applied {} change(s)", changes.changes.len()),
                Some(json!({ "files": changes.paths(), "summary": changes.summary })),
            );
        }
        Ok(result)
    }

    async fn validate_once(
        &mut self,
        changes: &CodeChanges,
    ) -> Result<StageResult<ValidationResult>, PipelineError> {
        self.enter(Stage::Validation, "Building and running tests");
        let emitter = self.emitter();
        let on_line = move |line: &str| emitter.emit(EventType::BuildOutput, line.to_string(), None);
        let repo = self.repo_path();

        let result = self
            .guarded_with_grace(
                stages::run_validation(
                    &*self.collab.validator,
                    changes,
                    &repo,
                    &on_line,
                    &self.cancel,
                ),
                CANCEL_GRACE,
            )
            .await?;

        if let Ok(validation) = &result {
            self.complete_stage(
                Stage::Validation,
                format!("Build passed in {}ms", validation.duration_ms),
                Some(json!(validation)),
            );
        }
        Ok(result)
    }

    /// Consume one retry for a retryable failure, or end the session.
    fn retry_or_fail(&mut self, failure: StageFailure) -> Result<FixHint, PipelineError> {
        if !failure.is_retryable() {
            return Err(self.fatal(failure));
        }

        if self.state.retry_count >= self.state.max_retries {
            tracing::warn!(
                session_id = %self.state.session_id,
                retries = self.state.retry_count,
                "Retry budget exhausted"
            );
            return Err(match failure.kind {
                FailureKind::Validation => PipelineError::ValidationFailure {
                    retries: self.state.retry_count,
                    summary: failure.detail,
                },
                _ if failure.transient => PipelineError::TransientAi {
                    stage: failure.stage,
                    detail: failure.detail,
                },
                _ => PipelineError::TerminalStage {
                    stage: failure.stage,
                    detail: failure.detail,
                },
            });
        }

        self.state.retry_count += 1;
        tracing::info!(
            session_id = %self.state.session_id,
            stage = ?failure.stage,
            retry = self.state.retry_count,
            max = self.state.max_retries,
            "Retrying after failure"
        );
        let data = json!({
            "attempt": self.state.retry_count,
            "max_retries": self.state.max_retries,
            "failed_stage": failure.stage,
            "detail": failure.detail,
            "diagnostics": failure.validation.as_ref().map(|v| &v.diagnostics),
        });
        self.transition(
            failure.stage,
            Status::Retrying,
            EventType::Retrying,
            format!(
                "Retry {}/{}: {}",
                self.state.retry_count, self.state.max_retries, failure.detail
            ),
            Some(data),
        );
        Ok(failure.fix_hint(self.state.retry_count))
    }

    fn fatal(&self, failure: StageFailure) -> PipelineError {
        match failure.kind {
            FailureKind::Unavailable => PipelineError::CollaboratorUnavailable {
                collaborator: collaborator_name(failure.stage),
                detail: failure.detail,
            },
            _ if failure.transient => PipelineError::TransientAi {
                stage: failure.stage,
                detail: failure.detail,
            },
            _ => PipelineError::TerminalStage {
                stage: failure.stage,
                detail: failure.detail,
            },
        }
    }

    /// Publish the single terminal event and final snapshot.
    fn finish(&mut self, result: Result<(), PipelineError>) {
        let now = Utc::now();
        self.state.end_time = Some(now);
        match result {
            Ok(()) => {
                self.state.progress = 1.0;
                let data = json!({
                    "artifacts": self.state.artifacts,
                    "retry_count": self.state.retry_count,
                });
                self.transition(
                    Stage::Complete,
                    Status::Completed,
                    EventType::Completed,
                    "Pipeline complete",
                    Some(data),
                );
                tracing::info!(session_id = %self.state.session_id, retries = self.state.retry_count, "Pipeline completed");
            }
            Err(err) => {
                let (status, event_type) = if err.is_cancellation() {
                    (Status::Cancelled, EventType::Cancelled)
                } else {
                    (Status::Failed, EventType::Failed)
                };
                self.state.error = Some(ErrorInfo {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                let data = json!({
                    "kind": err.kind(),
                    "error": err.to_string(),
                    "stage": self.state.stage,
                    "retry_count": self.state.retry_count,
                    "applied_files": self.state.applied_files,
                });
                let stage = self.state.stage;
                self.transition(stage, status, event_type, err.to_string(), Some(data));
                if err.is_cancellation() {
                    tracing::info!(session_id = %self.state.session_id, stage = ?stage, "Pipeline cancelled");
                } else {
                    tracing::warn!(session_id = %self.state.session_id, stage = ?stage, error = %err, "Pipeline failed");
                }
            }
        }
    }

    // ── State + events ─────────────────────────────────────────────────

    fn enter(&mut self, stage: Stage, message: impl Into<String>) {
        if let Some((start, _)) = stage.progress_range() {
            self.state.bump_progress(start);
        }
        tracing::info!(session_id = %self.state.session_id, stage = ?stage, "Stage started");
        self.transition(stage, Status::Running, EventType::StageStarted, message, None);
    }

    fn complete_stage(
        &mut self,
        stage: Stage,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        if let Some((_, end)) = stage.progress_range() {
            self.state.bump_progress(end);
        }
        self.transition(stage, Status::Running, EventType::StageCompleted, message, data);
    }

    fn transition(
        &mut self,
        stage: Stage,
        status: Status,
        event_type: EventType,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        self.state.stage = stage;
        self.state.status = status;
        let mut event = ProgressEvent::draft(&self.state, event_type, message);
        event.data = data;
        self.commit(event);
    }

    fn commit(&mut self, event: ProgressEvent) {
        self.state.updated_at = event.timestamp;
        self.broadcaster.publish(event);
        self.state_tx.send_replace(self.state.clone());
    }

    fn emitter(&self) -> LiveEmitter {
        LiveEmitter {
            broadcaster: Arc::clone(&self.broadcaster),
            template: ProgressEvent::draft(&self.state, EventType::BuildOutput, ""),
        }
    }

    fn repo_path(&self) -> PathBuf {
        self.working_dir.clone()
    }

    // ── Suspension points ──────────────────────────────────────────────

    async fn guarded<T>(
        &self,
        fut: impl Future<Output = StageResult<T>>,
    ) -> Result<StageResult<T>, PipelineError> {
        self.guarded_with_grace(fut, Duration::ZERO).await
    }

    /// Race a stage against session cancellation. With a grace period the
    /// stage keeps being polled for a while after cancel so it can clean up.
    async fn guarded_with_grace<T>(
        &self,
        fut: impl Future<Output = StageResult<T>>,
        grace: Duration,
    ) -> Result<StageResult<T>, PipelineError> {
        tokio::pin!(fut);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                if !grace.is_zero() {
                    let _ = tokio::time::timeout(grace, &mut fut).await;
                }
                Err(PipelineError::UserCancelled)
            }
            result = &mut fut => Ok(result),
        }
    }
}

fn collaborator_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Intake => "intake",
        Stage::Planning => "planner",
        Stage::Transformation => "transformer",
        Stage::Validation => "build",
        Stage::Narration => "narrator",
        Stage::GitOperations => "git",
        _ => "pipeline",
    }
}

fn default_branch(session_id: &str) -> String {
    let short: String = session_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    format!("{}{}", constants::pipeline::BRANCH_PREFIX, short)
}
