//! Pipeline state machine vocabulary and the per-session state record.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifacts::{
    CodeChanges, PrDescription, PushResult, RefactorPlan, RefactorSpec, ValidationResult,
};
use crate::constants;

/// Pipeline stage. Bracketed `Awaiting*` stages only occur when the
/// confirmation mode asks for that checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Intake,
    Planning,
    AwaitingPlanConfirmation,
    Transformation,
    Validation,
    AwaitingValidationConfirmation,
    Narration,
    AwaitingPushConfirmation,
    GitOperations,
    Complete,
}

impl Stage {
    /// Fixed progress band for executable stages.
    pub fn progress_range(self) -> Option<(f64, f64)> {
        match self {
            Self::Intake => Some((0.0, 0.15)),
            Self::Planning => Some((0.15, 0.30)),
            Self::Transformation => Some((0.30, 0.55)),
            Self::Validation => Some((0.55, 0.75)),
            Self::Narration => Some((0.75, 0.85)),
            Self::GitOperations => Some((0.85, 1.0)),
            Self::Complete => Some((1.0, 1.0)),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Intake => "intake",
            Self::Planning => "planning",
            Self::AwaitingPlanConfirmation => "awaiting_plan_confirmation",
            Self::Transformation => "transformation",
            Self::Validation => "validation",
            Self::AwaitingValidationConfirmation => "awaiting_validation_confirmation",
            Self::Narration => "narration",
            Self::AwaitingPushConfirmation => "awaiting_push_confirmation",
            Self::GitOperations => "git_operations",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    AwaitingConfirmation,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Human checkpoint positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Plan,
    Validation,
    Push,
}

impl CheckpointKind {
    pub fn stage(self) -> Stage {
        match self {
            Self::Plan => Stage::AwaitingPlanConfirmation,
            Self::Validation => Stage::AwaitingValidationConfirmation,
            Self::Push => Stage::AwaitingPushConfirmation,
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plan => "plan",
            Self::Validation => "validation",
            Self::Push => "push",
        })
    }
}

/// Which checkpoints a session stops at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Never stop.
    Autonomous,
    /// Stop after planning and before pushing.
    #[default]
    #[serde(alias = "checkpoint_on_plan", alias = "plan_and_push")]
    CheckpointOnPlanAndPush,
    /// Stop after planning, after validation and before pushing.
    #[serde(alias = "every_stage")]
    CheckpointOnEveryStage,
}

impl ConfirmationMode {
    pub fn requires(self, checkpoint: CheckpointKind) -> bool {
        match self {
            Self::Autonomous => false,
            Self::CheckpointOnPlanAndPush => {
                matches!(checkpoint, CheckpointKind::Plan | CheckpointKind::Push)
            }
            Self::CheckpointOnEveryStage => true,
        }
    }
}

impl FromStr for ConfirmationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "autonomous" | "auto" => Ok(Self::Autonomous),
            "checkpoint_on_plan_and_push" | "checkpoint_on_plan" | "plan_and_push" => {
                Ok(Self::CheckpointOnPlanAndPush)
            }
            "checkpoint_on_every_stage" | "every_stage" => Ok(Self::CheckpointOnEveryStage),
            other => Err(format!(
                "unknown confirmation mode '{}'; expected autonomous, checkpoint-on-plan-and-push or checkpoint-on-every-stage",
                other
            )),
        }
    }
}

/// Where the code to refactor comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoSource {
    /// Cloned into a fresh per-session directory under the workspace root.
    Remote {
        url: String,
        #[serde(default, skip_serializing)]
        token: Option<String>,
        #[serde(default)]
        branch: Option<String>,
    },
    /// An existing checkout, used in place and never deleted.
    Local { path: PathBuf },
}

/// Everything a session is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInput {
    pub prompt: String,
    #[serde(default)]
    pub mode: ConfirmationMode,
    pub repo: RepoSource,
    /// Branch to push to; generated from the session id when absent.
    #[serde(default)]
    pub target_branch: Option<String>,
    /// Build/test command; detected from the checkout when absent.
    #[serde(default)]
    pub build_command: Option<String>,
    /// Per-session override of the configured retry cap.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Process-wide knobs the controller and registry run with.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_retries: u32,
    pub checkpoint_timeout: Duration,
    pub session_ttl: Duration,
    pub workspace_root: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: constants::pipeline::DEFAULT_MAX_RETRIES,
            checkpoint_timeout: Duration::from_secs(
                constants::pipeline::DEFAULT_CHECKPOINT_TIMEOUT_SECS,
            ),
            session_ttl: Duration::from_secs(constants::pipeline::DEFAULT_SESSION_TTL_SECS),
            workspace_root: crate::paths::workspaces_dir(),
        }
    }
}

/// Results of completed stages. Each slot is written once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    pub spec: Option<RefactorSpec>,
    pub plan: Option<RefactorPlan>,
    pub code_changes: Option<CodeChanges>,
    pub validation: Option<ValidationResult>,
    pub narration: Option<PrDescription>,
    pub push: Option<PushResult>,
}

impl Artifacts {
    /// Write a slot that has not been written yet. A second write is ignored.
    pub(crate) fn record<T>(slot: &mut Option<T>, value: T, name: &str) {
        if slot.is_some() {
            tracing::warn!(artifact = name, "Artifact already recorded, keeping first value");
            return;
        }
        *slot = Some(value);
    }
}

/// User decision at a checkpoint, after any freeform interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationAction {
    Approve,
    Modify,
    Cancel,
}

/// Optional user-provided overrides attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOverrides {
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub modification: Option<String>,
}

/// Last checkpoint decision, set only from a rendezvous resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationData {
    pub checkpoint: CheckpointKind,
    pub action: ConfirmationAction,
    /// Raw freeform text when the decision came from natural language.
    pub text: Option<String>,
    pub confidence: Option<f32>,
    #[serde(flatten)]
    pub overrides: ConfirmationOverrides,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

/// Per-session pipeline state. Mutated only by the controller task; every
/// other reader gets a cloned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub session_id: String,
    pub stage: Stage,
    pub status: Status,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub mode: ConfirmationMode,
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub artifacts: Artifacts,
    pub confirmation_data: Option<ConfirmationData>,
    pub error: Option<ErrorInfo>,
    /// Files written to the working tree so far (across attempts).
    pub applied_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn new(session_id: impl Into<String>, input: &PipelineInput, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            stage: Stage::Pending,
            status: Status::Pending,
            progress: 0.0,
            retry_count: 0,
            max_retries,
            mode: input.mode,
            prompt: input.prompt.clone(),
            working_dir: None,
            artifacts: Artifacts::default(),
            confirmation_data: None,
            error: None,
            applied_files: Vec::new(),
            created_at: now,
            updated_at: now,
            end_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Raise progress, never lower it.
    pub(crate) fn bump_progress(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if value > self.progress {
            self.progress = value;
        }
    }
}
