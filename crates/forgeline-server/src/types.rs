//! Request and response types for the API

use serde::{Deserialize, Serialize};

use forgeline_core::pipeline::{
    CheckpointKind, ConfirmationAction, ConfirmationOverrides, RepoSource,
};
use forgeline_core::{ConfirmationMessage, ConfirmationMode, PipelineInput, Status};

use crate::error::AppError;

// ============================================================================
// Session Types
// ============================================================================

/// `POST /api/start`. Exactly one of `repo_url` / `repo_path` is required.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: ConfirmationMode,
    pub repo_url: Option<String>,
    /// Access token for cloning and pushing `repo_url`.
    pub token: Option<String>,
    /// Base branch to clone.
    pub branch: Option<String>,
    pub repo_path: Option<String>,
    pub target_branch: Option<String>,
    pub build_command: Option<String>,
    pub max_retries: Option<u32>,
}

impl StartRequest {
    pub fn into_input(self) -> Result<PipelineInput, AppError> {
        let repo = match (non_empty(self.repo_url), non_empty(self.repo_path)) {
            (Some(url), None) => RepoSource::Remote {
                url,
                token: non_empty(self.token),
                branch: non_empty(self.branch),
            },
            (None, Some(path)) => RepoSource::Local { path: path.into() },
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest(
                    "give either repo_url or repo_path, not both".into(),
                ))
            }
            (None, None) => {
                return Err(AppError::BadRequest(
                    "repo_url or repo_path is required".into(),
                ))
            }
        };

        Ok(PipelineInput {
            prompt: self.prompt,
            mode: self.mode,
            repo,
            target_branch: non_empty(self.target_branch),
            build_command: non_empty(self.build_command),
            max_retries: self.max_retries,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
}

// ============================================================================
// Confirmation Types
// ============================================================================

/// `POST /api/sessions/:id/confirm`: a structured `action` (with optional
/// overrides) or freeform `text`.
#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    pub action: Option<ConfirmationAction>,
    pub text: Option<String>,
    pub branch_name: Option<String>,
    pub commit_message: Option<String>,
    pub modification: Option<String>,
}

impl ConfirmRequest {
    pub fn into_message(self, session_id: &str) -> Result<ConfirmationMessage, AppError> {
        let text = non_empty(self.text);
        match self.action {
            Some(action) => {
                let mut overrides = ConfirmationOverrides {
                    branch_name: non_empty(self.branch_name),
                    commit_message: non_empty(self.commit_message),
                    modification: non_empty(self.modification),
                };
                if action == ConfirmationAction::Modify && overrides.modification.is_none() {
                    overrides.modification = text;
                }
                Ok(ConfirmationMessage::Decision {
                    session_id: session_id.to_string(),
                    action,
                    overrides,
                })
            }
            None => match text {
                Some(text) => Ok(ConfirmationMessage::freeform(session_id, text)),
                None => Err(AppError::BadRequest("action or text is required".into())),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub session_id: String,
    /// Checkpoint the answer was delivered to.
    pub checkpoint: CheckpointKind,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub session_id: String,
    /// Status at the time of the request; the session reaches `cancelled`
    /// asynchronously.
    pub status: Status,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_request_with_remote_repo() {
        let req: StartRequest = serde_json::from_value(json!({
            "prompt": "Rename UserService",
            "mode": "autonomous",
            "repo_url": "https://github.com/acme/app.git",
            "token": "ghs_x",
            "branch": " main "
        }))
        .expect("request should deserialize");

        let input = req.into_input().expect("valid input");
        assert_eq!(input.mode, ConfirmationMode::Autonomous);
        match input.repo {
            RepoSource::Remote { url, token, branch } => {
                assert_eq!(url, "https://github.com/acme/app.git");
                assert_eq!(token.as_deref(), Some("ghs_x"));
                assert_eq!(branch.as_deref(), Some("main"));
            }
            other => panic!("unexpected repo source: {:?}", other),
        }
    }

    #[test]
    fn start_request_defaults_mode() {
        let req: StartRequest = serde_json::from_value(json!({
            "prompt": "Extract interface",
            "repo_path": "/tmp/repo"
        }))
        .expect("request should deserialize");
        let input = req.into_input().expect("valid input");
        assert_eq!(input.mode, ConfirmationMode::CheckpointOnPlanAndPush);
        assert!(matches!(input.repo, RepoSource::Local { .. }));
    }

    #[test]
    fn start_request_needs_exactly_one_repo() {
        let neither: StartRequest =
            serde_json::from_value(json!({ "prompt": "x" })).expect("request should deserialize");
        assert!(matches!(neither.into_input(), Err(AppError::BadRequest(_))));

        let both: StartRequest = serde_json::from_value(json!({
            "prompt": "x",
            "repo_url": "https://example.com/r.git",
            "repo_path": "/tmp/r"
        }))
        .expect("request should deserialize");
        assert!(matches!(both.into_input(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn start_request_rejects_unknown_mode() {
        let result = serde_json::from_value::<StartRequest>(json!({
            "prompt": "x",
            "repo_path": "/tmp/r",
            "mode": "yolo"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn confirm_request_with_action_and_overrides() {
        let req: ConfirmRequest = serde_json::from_value(json!({
            "action": "approve",
            "branch_name": "feature/rename"
        }))
        .expect("request should deserialize");
        let msg = req.into_message("s1").expect("valid message");
        assert_eq!(
            msg,
            ConfirmationMessage::Decision {
                session_id: "s1".into(),
                action: ConfirmationAction::Approve,
                overrides: ConfirmationOverrides {
                    branch_name: Some("feature/rename".into()),
                    ..ConfirmationOverrides::default()
                },
            }
        );
    }

    #[test]
    fn confirm_request_modify_uses_text_as_modification() {
        let req: ConfirmRequest = serde_json::from_value(json!({
            "action": "modify",
            "text": "keep the old name as a deprecated alias"
        }))
        .expect("request should deserialize");
        match req.into_message("s1").expect("valid message") {
            ConfirmationMessage::Decision { overrides, .. } => assert_eq!(
                overrides.modification.as_deref(),
                Some("keep the old name as a deprecated alias")
            ),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn confirm_request_freeform_and_empty() {
        let req: ConfirmRequest = serde_json::from_value(json!({ "text": "no, too risky" }))
            .expect("request should deserialize");
        assert_eq!(
            req.into_message("s1").expect("valid message"),
            ConfirmationMessage::freeform("s1", "no, too risky")
        );

        let empty = ConfirmRequest::default();
        assert!(matches!(empty.into_message("s1"), Err(AppError::BadRequest(_))));
    }
}
