//! External capabilities the controller drives.
//!
//! Each trait is a black box: structured input in, typed result or
//! `CollaboratorError` out. Transient failures are retried inside the
//! implementation and only surface once its own budget is spent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::artifacts::{
    CodeChanges, FixHint, PrDescription, PushResult, RefactorPlan, RefactorSpec, ValidationResult,
};
use super::types::CheckpointKind;
use crate::error::CollaboratorError;

pub type CollabResult<T> = Result<T, CollaboratorError>;

/// Line sink for streaming build output.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub repo_path: PathBuf,
    /// Short file listing of the checkout.
    pub repo_summary: String,
    /// User modification text from a plan checkpoint.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformContext {
    pub repo_path: PathBuf,
    pub spec: RefactorSpec,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct IntentContext {
    pub checkpoint: CheckpointKind,
    /// What the user is being asked to confirm.
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Approve,
    Modify,
    Cancel,
    Clarify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub action: IntentAction,
    #[serde(default)]
    pub extracted_override: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

#[async_trait]
pub trait IntakeAgent: Send + Sync {
    async fn intake(&self, prompt: &str) -> CollabResult<RefactorSpec>;
}

#[async_trait]
pub trait PlanAgent: Send + Sync {
    async fn plan(&self, spec: &RefactorSpec, ctx: &PlanContext) -> CollabResult<RefactorPlan>;
}

#[async_trait]
pub trait TransformAgent: Send + Sync {
    async fn transform(
        &self,
        plan: &RefactorPlan,
        ctx: &TransformContext,
        fix_hint: Option<&FixHint>,
    ) -> CollabResult<CodeChanges>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Build and test the checkout, forwarding each output line to `on_line`.
    /// A failing build is `Ok` with `success == false`; `Err` means the
    /// build could not be run at all.
    async fn validate(
        &self,
        changes: &CodeChanges,
        repo_path: &Path,
        on_line: LineSink<'_>,
        cancel: &CancellationToken,
    ) -> CollabResult<ValidationResult>;
}

#[async_trait]
pub trait NarrateAgent: Send + Sync {
    async fn narrate(
        &self,
        changes: &CodeChanges,
        validation: &ValidationResult,
    ) -> CollabResult<PrDescription>;
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify_intent(
        &self,
        text: &str,
        ctx: &IntentContext,
    ) -> CollabResult<IntentClassification>;
}

#[async_trait]
pub trait GitOperations: Send + Sync {
    async fn clone_repo(
        &self,
        repo_url: &str,
        token: Option<&str>,
        branch: Option<&str>,
        dest: &Path,
    ) -> CollabResult<PathBuf>;

    async fn commit_and_push(
        &self,
        repo_path: &Path,
        branch: &str,
        message: &str,
    ) -> CollabResult<PushResult>;
}

/// Dependency bundle handed to every controller.
#[derive(Clone)]
pub struct Collaborators {
    pub intake: Arc<dyn IntakeAgent>,
    pub planner: Arc<dyn PlanAgent>,
    pub transformer: Arc<dyn TransformAgent>,
    pub validator: Arc<dyn Validator>,
    pub narrator: Arc<dyn NarrateAgent>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub git: Arc<dyn GitOperations>,
}
