//! Process-wide session registry.
//!
//! Sessions are inserted on start and stay readable after they finish, until
//! `session_ttl` has passed since their terminal event. The map is only locked
//! for insert, lookup and removal; a running session never touches it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ai::{AiClient, FallbackIntentClassifier, KeywordIntentClassifier, LlmAgents};
use crate::build::CommandValidator;
use crate::config::ForgelineConfig;
use crate::error::RegistryError;
use crate::git::{self, CliGit};
use crate::pipeline::{
    CheckpointKind, Collaborators, ConfirmationMessage, IntentClassifier, PipelineController,
    PipelineInput, PipelineSettings, PipelineState, RepoSource, SessionHandle, Subscription,
};
use crate::workspace::{self, WorkspaceClaims};

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
    working_dir: PathBuf,
    /// Created by us, so deleted on eviction.
    cloned: bool,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    claims: WorkspaceClaims,
    settings: PipelineSettings,
    collab: Collaborators,
    build_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(settings: PipelineSettings, collab: Collaborators) -> Self {
        Self {
            sessions: DashMap::new(),
            claims: WorkspaceClaims::new(),
            settings,
            collab,
            build_timeout: Duration::from_secs(crate::constants::build::DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Timeout used for per-session `build_command` overrides.
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Registry wired to the LLM agents, the build validator and the git CLI.
    pub fn from_config(config: &ForgelineConfig) -> Result<Self> {
        let collab = default_collaborators(config)?;
        Ok(Self::new(config.pipeline_settings(), collab).with_build_timeout(config.build_timeout()))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start a session under a fresh id.
    pub fn start(&self, input: PipelineInput) -> Result<SessionHandle, RegistryError> {
        self.start_with_id(Uuid::new_v4().to_string(), input)
    }

    pub fn start_with_id(
        &self,
        session_id: String,
        input: PipelineInput,
    ) -> Result<SessionHandle, RegistryError> {
        validate_input(&input)?;
        let (working_dir, cloned) = self.working_dir_for(&session_id, &input.repo)?;

        let vacant = match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyExists(session_id)),
            Entry::Vacant(vacant) => vacant,
        };
        let lease = self.claims.claim(&working_dir, &session_id)?;

        let collab = self.collaborators_for(&input);
        let (handle, task) = PipelineController::start(
            session_id.clone(),
            input,
            self.settings.clone(),
            collab,
            working_dir.clone(),
            Some(lease),
        );

        tracing::info!(
            session_id = %session_id,
            working_dir = %working_dir.display(),
            cloned,
            "Session registered"
        );
        vacant.insert(SessionEntry {
            handle: handle.clone(),
            task,
            working_dir,
            cloned,
        });
        Ok(handle)
    }

    fn working_dir_for(
        &self,
        session_id: &str,
        repo: &RepoSource,
    ) -> Result<(PathBuf, bool), RegistryError> {
        match repo {
            RepoSource::Remote { url, .. } => {
                if url.trim().is_empty() {
                    return Err(RegistryError::InvalidInput("repo_url is empty".into()));
                }
                Ok((self.settings.workspace_root.join(session_id), true))
            }
            RepoSource::Local { path } => {
                let path = path.canonicalize().map_err(|e| {
                    RegistryError::InvalidInput(format!(
                        "repository path {} is not usable: {}",
                        path.display(),
                        e
                    ))
                })?;
                if !path.is_dir() {
                    return Err(RegistryError::InvalidInput(format!(
                        "repository path {} is not a directory",
                        path.display()
                    )));
                }
                Ok((path, false))
            }
        }
    }

    fn collaborators_for(&self, input: &PipelineInput) -> Collaborators {
        let mut collab = self.collab.clone();
        if let Some(command) = input.build_command.as_ref().filter(|c| !c.trim().is_empty()) {
            collab.validator = Arc::new(CommandValidator::new(
                Some(command.clone()),
                self.build_timeout,
            ));
        }
        collab
    }

    pub fn get(&self, session_id: &str) -> Result<SessionHandle, RegistryError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    pub fn snapshot(&self, session_id: &str) -> Result<PipelineState, RegistryError> {
        self.get(session_id).map(|handle| handle.snapshot())
    }

    /// Snapshots of every registered session, oldest first.
    pub fn list(&self) -> Vec<PipelineState> {
        let mut states: Vec<PipelineState> = self
            .sessions
            .iter()
            .map(|entry| entry.handle.snapshot())
            .collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        states
    }

    pub fn subscribe(&self, session_id: &str) -> Result<Subscription, RegistryError> {
        self.get(session_id).map(|handle| handle.subscribe())
    }

    pub fn confirm(
        &self,
        session_id: &str,
        message: ConfirmationMessage,
    ) -> Result<CheckpointKind, RegistryError> {
        let handle = self.get(session_id)?;
        let checkpoint = handle.confirm(message)?;
        tracing::info!(session_id, checkpoint = %checkpoint, "Confirmation delivered");
        Ok(checkpoint)
    }

    /// Request cancellation. A finished session is left as it is.
    pub fn cancel(&self, session_id: &str) -> Result<(), RegistryError> {
        let handle = self.get(session_id)?;
        if !handle.is_terminal() {
            tracing::info!(session_id, "Cancellation requested");
            handle.cancel();
        }
        Ok(())
    }

    /// Cancel every live session, e.g. on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            if !entry.handle.is_terminal() {
                entry.handle.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that have not reached a terminal status.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.handle.is_terminal())
            .count()
    }

    /// Drop sessions whose terminal event is older than the TTL and whose
    /// task has exited. Returns the evicted ids.
    pub async fn evict_expired(&self) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.settings.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let state = entry.handle.snapshot();
                let ended = state.end_time.filter(|_| state.is_terminal());
                entry.task.is_finished() && ended.is_some_and(|end| now - end >= ttl)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for session_id in expired {
            let Some((_, entry)) = self.sessions.remove(&session_id) else {
                continue;
            };
            if entry.cloned {
                let dir = entry.working_dir.clone();
                let removed = tokio::task::spawn_blocking(move || workspace::remove_workspace(&dir)).await;
                match removed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        session_id = %session_id,
                        path = %entry.working_dir.display(),
                        "Failed to remove cloned workspace: {}",
                        e
                    ),
                    Err(e) => tracing::warn!(session_id = %session_id, "Workspace cleanup task failed: {}", e),
                }
            }
            tracing::info!(session_id = %session_id, "Session evicted");
            evicted.push(session_id);
        }
        evicted
    }

    /// Periodically evict expired sessions until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_expired().await;
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "Sweeper evicted sessions");
                }
            }
        })
    }
}

fn validate_input(input: &PipelineInput) -> Result<(), RegistryError> {
    if input.prompt.trim().is_empty() {
        return Err(RegistryError::InvalidInput("prompt is empty".into()));
    }
    if let Some(branch) = &input.target_branch {
        if !git::is_valid_branch_name(branch) {
            return Err(RegistryError::InvalidInput(format!(
                "'{}' is not a valid branch name",
                branch
            )));
        }
    }
    Ok(())
}

/// LLM agents for the stages, keyword fallback for intent, build-tool
/// validation and the git CLI.
pub fn default_collaborators(config: &ForgelineConfig) -> Result<Collaborators> {
    let client = Arc::new(AiClient::new(config.ai_client_config())?);
    let configured = client.is_configured();
    if !configured {
        tracing::warn!("No AI API key configured; AI stages will fail as unavailable");
    }
    let agents = Arc::new(LlmAgents::new(client));

    let classifier: Arc<dyn IntentClassifier> = if configured {
        Arc::new(FallbackIntentClassifier::new(agents.clone()))
    } else {
        Arc::new(KeywordIntentClassifier)
    };

    Ok(Collaborators {
        intake: agents.clone(),
        planner: agents.clone(),
        transformer: agents.clone(),
        validator: Arc::new(CommandValidator::new(
            config.build.command.clone(),
            config.build_timeout(),
        )),
        narrator: agents,
        classifier,
        git: Arc::new(CliGit::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{local_input, settings, ScriptedAgents};
    use crate::pipeline::{ConfirmationMode, Status};
    use crate::error::RendezvousError;

    fn registry(root: &std::path::Path, ttl: Duration) -> SessionRegistry {
        let mut settings = settings(root, 3);
        settings.session_ttl = ttl;
        SessionRegistry::new(settings, ScriptedAgents::new().collaborators())
    }

    async fn wait_until_released(registry: &SessionRegistry) {
        for _ in 0..100 {
            if registry.claims.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workspace lease was never released");
    }

    #[tokio::test]
    async fn runs_and_lists_sessions() {
        let repo = tempfile::tempdir().unwrap();
        let registry = registry(repo.path(), Duration::from_secs(60));

        let handle = registry
            .start(local_input(repo.path(), ConfirmationMode::Autonomous))
            .unwrap();
        let state = handle.wait_terminal().await;
        assert_eq!(state.status, Status::Completed);

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, handle.session_id);
        assert_eq!(registry.snapshot(&handle.session_id).unwrap().status, Status::Completed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = registry(a.path(), Duration::from_secs(60));

        registry
            .start_with_id("s1".into(), local_input(a.path(), ConfirmationMode::CheckpointOnPlanAndPush))
            .unwrap();
        let err = registry
            .start_with_id("s1".into(), local_input(b.path(), ConfirmationMode::Autonomous))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        registry.cancel_all();
    }

    #[tokio::test]
    async fn working_directory_is_exclusive_until_session_ends() {
        let repo = tempfile::tempdir().unwrap();
        let registry = registry(repo.path(), Duration::from_secs(60));

        let first = registry
            .start(local_input(repo.path(), ConfirmationMode::CheckpointOnPlanAndPush))
            .unwrap();
        let err = registry
            .start(local_input(repo.path(), ConfirmationMode::Autonomous))
            .unwrap_err();
        assert!(matches!(err, RegistryError::WorkspaceBusy { .. }));

        registry.cancel(&first.session_id).unwrap();
        assert_eq!(first.wait_terminal().await.status, Status::Cancelled);
        wait_until_released(&registry).await;

        let second = registry
            .start(local_input(repo.path(), ConfirmationMode::Autonomous))
            .unwrap();
        assert_eq!(second.wait_terminal().await.status, Status::Completed);
    }

    #[tokio::test]
    async fn confirm_errors_are_typed() {
        let repo = tempfile::tempdir().unwrap();
        let registry = registry(repo.path(), Duration::from_secs(60));

        let err = registry
            .confirm("missing", ConfirmationMessage::approve("missing"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));

        let handle = registry
            .start(local_input(repo.path(), ConfirmationMode::Autonomous))
            .unwrap();
        handle.wait_terminal().await;
        let err = registry
            .confirm(&handle.session_id, ConfirmationMessage::approve(&handle.session_id))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Rejected(RendezvousError::NoPendingCheckpoint)
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_refused() {
        let repo = tempfile::tempdir().unwrap();
        let registry = registry(repo.path(), Duration::from_secs(60));

        let mut input = local_input(repo.path(), ConfirmationMode::Autonomous);
        input.prompt = "  ".into();
        assert!(matches!(registry.start(input), Err(RegistryError::InvalidInput(_))));

        let input = local_input(&repo.path().join("nope"), ConfirmationMode::Autonomous);
        assert!(matches!(registry.start(input), Err(RegistryError::InvalidInput(_))));

        let mut input = local_input(repo.path(), ConfirmationMode::Autonomous);
        input.target_branch = Some("bad branch".into());
        assert!(matches!(registry.start(input), Err(RegistryError::InvalidInput(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn evicts_only_finished_sessions_and_their_clones() {
        let root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), Duration::ZERO);

        let mut remote = local_input(local.path(), ConfirmationMode::Autonomous);
        remote.repo = RepoSource::Remote {
            url: "https://example.com/acme/app.git".into(),
            token: None,
            branch: None,
        };
        let done = registry.start(remote).unwrap();
        assert_eq!(done.wait_terminal().await.status, Status::Completed);
        let clone_dir = root.path().join(&done.session_id);
        assert!(clone_dir.is_dir());

        let waiting = registry
            .start(local_input(local.path(), ConfirmationMode::CheckpointOnPlanAndPush))
            .unwrap();

        wait_until_finished(&registry, &done.session_id).await;
        let evicted = registry.evict_expired().await;
        assert_eq!(evicted, vec![done.session_id.clone()]);
        assert!(!clone_dir.exists());
        assert!(local.path().is_dir());
        assert!(registry.get(&waiting.session_id).is_ok());
        assert!(matches!(registry.get(&done.session_id), Err(RegistryError::NotFound(_))));

        registry.cancel_all();
    }

    async fn wait_until_finished(registry: &SessionRegistry, session_id: &str) {
        for _ in 0..100 {
            if registry
                .sessions
                .get(session_id)
                .is_some_and(|e| e.task.is_finished())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session task never finished");
    }

    #[tokio::test]
    async fn build_command_override_replaces_validator() {
        let repo = tempfile::tempdir().unwrap();
        let registry = registry(repo.path(), Duration::from_secs(60));
        let mut input = local_input(repo.path(), ConfirmationMode::Autonomous);
        input.build_command = Some("true".into());

        let collab = registry.collaborators_for(&input);
        assert!(!Arc::ptr_eq(&collab.validator, &registry.collab.validator));

        input.build_command = None;
        let collab = registry.collaborators_for(&input);
        assert!(Arc::ptr_eq(&collab.validator, &registry.collab.validator));
    }
}
