//! Refactoring pipeline: stage executors, checkpoints, progress streaming and
//! the per-session controller that ties them together.

pub mod artifacts;
pub mod broadcaster;
pub mod collaborators;
pub mod controller;
pub mod events;
pub mod rendezvous;
pub mod stages;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use artifacts::{
    BuildDiagnostic, ChangeOp, CodeChanges, FileChange, FixHint, PlanStep, PrDescription,
    PushResult, RefactorPlan, RefactorSpec, Severity, ValidationResult,
};
pub use broadcaster::{ProgressBroadcaster, Subscription};
pub use collaborators::{
    Collaborators, GitOperations, IntakeAgent, IntentAction, IntentClassification,
    IntentClassifier, IntentContext, NarrateAgent, PlanAgent, PlanContext, TransformAgent,
    TransformContext, Validator,
};
pub use controller::{PipelineController, SessionHandle};
pub use events::{EventType, ProgressEvent};
pub use rendezvous::{ConfirmationMessage, ConfirmationRendezvous, WaitOutcome};
pub use types::{
    CheckpointKind, ConfirmationAction, ConfirmationData, ConfirmationMode,
    ConfirmationOverrides, ErrorInfo, PipelineInput, PipelineSettings, PipelineState, RepoSource,
    Stage, Status,
};
