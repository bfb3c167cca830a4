//! Progress event protocol.
//!
//! Every controller transition produces exactly one `ProgressEvent`. Transport
//! layers (SSE, the headless CLI) render these as they see fit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{CheckpointKind, PipelineState, Stage, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // ── Stage lifecycle ────────────────────────────────────────────────
    StageStarted,
    StageCompleted,
    FileChanged,
    BuildOutput,
    // ── Checkpoints ────────────────────────────────────────────────────
    CheckpointRequired,
    CheckpointResolved,
    Retrying,
    // ── Terminal ───────────────────────────────────────────────────────
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::FileChanged => "file_changed",
            Self::BuildOutput => "build_output",
            Self::CheckpointRequired => "checkpoint_required",
            Self::CheckpointResolved => "checkpoint_resolved",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable once published. `sequence_number` is assigned by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub sequence_number: u64,
    pub stage: Stage,
    pub status: Status,
    pub progress: f64,
    pub message: String,
    pub event_type: EventType,
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_type: Option<CheckpointKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Unsequenced event carrying the state's current stage/status/progress.
    pub fn draft(state: &PipelineState, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            session_id: state.session_id.clone(),
            sequence_number: 0,
            stage: state.stage,
            status: state.status,
            progress: state.progress,
            message: message.into(),
            event_type,
            requires_confirmation: false,
            confirmation_type: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn requiring(mut self, checkpoint: CheckpointKind) -> Self {
        self.requires_confirmation = true;
        self.confirmation_type = Some(checkpoint);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
