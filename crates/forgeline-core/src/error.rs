//! Error taxonomy for the pipeline core.
//!
//! `CollaboratorError` is what external capabilities (AI agents, build, git)
//! report. The controller folds those into `PipelineError`, which is what
//! ends up in the terminal progress event and the final `PipelineState`.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::{CheckpointKind, Stage};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// Retryable inside the collaborator (rate limits, 5xx, timeouts).
    /// Only surfaces once the collaborator's own retry budget is spent.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The collaborator ran but produced an unusable result.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached or the operation failed outright.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn detail(&self) -> &str {
        match self {
            Self::Transient(d) | Self::Rejected(d) | Self::Unavailable(d) => d,
        }
    }
}

/// Why a pipeline ended in FAILED or CANCELLED.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("AI call failed during {stage}: {detail}")]
    TransientAi { stage: Stage, detail: String },

    #[error("validation failed after {retries} retries: {summary}")]
    ValidationFailure { retries: u32, summary: String },

    #[error("{stage} failed: {detail}")]
    TerminalStage { stage: Stage, detail: String },

    #[error("no confirmation for {checkpoint} checkpoint within {}s", after.as_secs())]
    CheckpointTimeout {
        checkpoint: CheckpointKind,
        after: Duration,
    },

    /// Not an error from the user's point of view; ends the session CANCELLED.
    #[error("cancelled by user")]
    UserCancelled,

    #[error("{collaborator} unavailable: {detail}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        detail: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientAi { .. } => "transient_ai_error",
            Self::ValidationFailure { .. } => "validation_failure",
            Self::TerminalStage { .. } => "terminal_stage_error",
            Self::CheckpointTimeout { .. } => "checkpoint_timeout",
            Self::UserCancelled => "user_cancelled",
            Self::CollaboratorUnavailable { .. } => "collaborator_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }
}

/// Confirmation rendezvous failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("no pending checkpoint")]
    NoPendingCheckpoint,

    #[error("a checkpoint is already awaiting confirmation")]
    AlreadyWaiting,

    #[error("confirmation addressed to session {got}, expected {expected}")]
    SessionMismatch { expected: String, got: String },
}

/// Session registry failures.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("working directory {path} is in use by session {owner}")]
    WorkspaceBusy { path: String, owner: String },

    #[error("invalid session input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Rejected(#[from] RendezvousError),
}
