//! forgeline core
//!
//! Orchestration core for prompt-driven refactoring pipelines:
//! - `pipeline` - stage executors, checkpoint rendezvous, progress broadcaster, controller
//! - `registry` - process-wide session registry with TTL eviction
//! - `build` - streaming build/test runner and diagnostics parser
//! - `git` - clone / commit / push collaborator over the git CLI
//! - `ai` - LLM-backed stage collaborators and intent classification

pub mod ai;
pub mod build;
pub mod config;
pub mod constants;
pub mod error;
pub mod git;
pub mod paths;
pub mod pipeline;
pub mod registry;
pub mod workspace;

pub use config::ForgelineConfig;
pub use error::{CollaboratorError, PipelineError, RegistryError, RendezvousError};
pub use pipeline::{
    Collaborators, ConfirmationMessage, ConfirmationMode, PipelineInput, PipelineSettings,
    PipelineState, ProgressEvent, Stage, Status,
};
pub use registry::SessionRegistry;
