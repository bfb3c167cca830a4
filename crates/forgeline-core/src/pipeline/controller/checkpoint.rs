//! Checkpoint suspension and natural-language resolution.

use chrono::Utc;
use serde_json::json;

use super::PipelineController;
use crate::error::PipelineError;
use crate::pipeline::collaborators::{IntentAction, IntentContext};
use crate::pipeline::events::{EventType, ProgressEvent};
use crate::pipeline::rendezvous::{ConfirmationMessage, WaitOutcome};
use crate::pipeline::types::{
    CheckpointKind, ConfirmationAction, ConfirmationData, ConfirmationOverrides, Status,
};

/// What the controller does after a checkpoint. Cancel never gets here; it
/// surfaces as `PipelineError::UserCancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum CheckpointDecision {
    Approve,
    Modify(Option<String>),
}

struct Interpreted {
    action: ConfirmationAction,
    overrides: ConfirmationOverrides,
    text: Option<String>,
    confidence: Option<f32>,
}

impl PipelineController {
    /// Announce the checkpoint, then suspend until it is answered, times out
    /// or the session is cancelled. Unclear freeform answers re-announce it.
    pub(super) async fn await_checkpoint(
        &mut self,
        kind: CheckpointKind,
        summary: String,
        data: serde_json::Value,
    ) -> Result<CheckpointDecision, PipelineError> {
        let timeout = self.settings.checkpoint_timeout;
        let mut message = format!("Waiting for {} confirmation: {}", kind, summary);

        loop {
            self.state.stage = kind.stage();
            self.state.status = Status::AwaitingConfirmation;
            let event = ProgressEvent::draft(&self.state, EventType::CheckpointRequired, message.clone())
                .with_data(data.clone())
                .requiring(kind);
            self.commit(event);
            tracing::info!(session_id = %self.state.session_id, checkpoint = %kind, "Awaiting confirmation");

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::UserCancelled),
                outcome = self.rendezvous.wait(kind, timeout) => outcome,
            };

            let received = match outcome {
                Ok(WaitOutcome::Resolved(received)) => received,
                Ok(WaitOutcome::TimedOut) => {
                    tracing::warn!(session_id = %self.state.session_id, checkpoint = %kind, "Checkpoint timed out");
                    return Err(PipelineError::CheckpointTimeout {
                        checkpoint: kind,
                        after: timeout,
                    });
                }
                Err(e) => return Err(PipelineError::Internal(e.to_string())),
            };

            let Some(interpreted) = self.interpret(kind, &summary, received).await? else {
                message = format!(
                    "Could not tell whether to approve, modify or cancel. Waiting for {} confirmation: {}",
                    kind, summary
                );
                continue;
            };

            self.state.confirmation_data = Some(ConfirmationData {
                checkpoint: kind,
                action: interpreted.action,
                text: interpreted.text,
                confidence: interpreted.confidence,
                overrides: interpreted.overrides.clone(),
                received_at: Utc::now(),
            });

            tracing::info!(
                session_id = %self.state.session_id,
                checkpoint = %kind,
                action = ?interpreted.action,
                "Checkpoint resolved"
            );

            return match interpreted.action {
                ConfirmationAction::Cancel => Err(PipelineError::UserCancelled),
                action => {
                    let stage = self.state.stage;
                    self.transition(
                        stage,
                        Status::Running,
                        EventType::CheckpointResolved,
                        format!("{} checkpoint: {:?}", kind, action).to_lowercase(),
                        Some(json!({
                            "checkpoint": kind,
                            "action": action,
                            "overrides": interpreted.overrides,
                        })),
                    );
                    Ok(match action {
                        ConfirmationAction::Modify => {
                            CheckpointDecision::Modify(interpreted.overrides.modification)
                        }
                        _ => CheckpointDecision::Approve,
                    })
                }
            };
        }
    }

    /// Turn a message into a decision. `None` means ask again.
    async fn interpret(
        &self,
        kind: CheckpointKind,
        summary: &str,
        received: ConfirmationMessage,
    ) -> Result<Option<Interpreted>, PipelineError> {
        let text = match received {
            ConfirmationMessage::Decision {
                action, overrides, ..
            } => {
                return Ok(Some(Interpreted {
                    action,
                    overrides,
                    text: None,
                    confidence: None,
                }))
            }
            ConfirmationMessage::Freeform { text, .. } => text,
        };

        let ctx = IntentContext {
            checkpoint: kind,
            summary: summary.to_string(),
        };
        let classified = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::UserCancelled),
            result = self.collab.classifier.classify_intent(&text, &ctx) => result,
        };

        let classification = match classified {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(session_id = %self.state.session_id, error = %e, "Intent classification failed");
                return Ok(None);
            }
        };

        let action = match classification.action {
            IntentAction::Approve => ConfirmationAction::Approve,
            IntentAction::Modify => ConfirmationAction::Modify,
            IntentAction::Cancel => ConfirmationAction::Cancel,
            IntentAction::Clarify => return Ok(None),
        };

        let overrides = overrides_from_text(
            kind,
            action,
            classification.extracted_override.as_deref(),
            &text,
        );
        Ok(Some(Interpreted {
            action,
            overrides,
            text: Some(text),
            confidence: Some(classification.confidence),
        }))
    }
}

/// Map extracted override text onto the field it most likely targets. At a
/// push checkpoint a single token is a branch name, anything longer a commit
/// message. Elsewhere it is modification text.
fn overrides_from_text(
    kind: CheckpointKind,
    action: ConfirmationAction,
    extracted: Option<&str>,
    raw: &str,
) -> ConfirmationOverrides {
    let mut overrides = ConfirmationOverrides::default();
    let extracted = extracted.map(str::trim).filter(|s| !s.is_empty());

    match kind {
        CheckpointKind::Push => {
            if let Some(value) = extracted {
                if value.split_whitespace().count() == 1 {
                    overrides.branch_name = Some(value.to_string());
                } else {
                    overrides.commit_message = Some(value.to_string());
                }
            }
        }
        CheckpointKind::Plan | CheckpointKind::Validation => {
            if action == ConfirmationAction::Modify {
                overrides.modification = Some(extracted.unwrap_or(raw).to_string());
            }
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_override_single_token_is_branch() {
        let o = overrides_from_text(
            CheckpointKind::Push,
            ConfirmationAction::Modify,
            Some("feature/rename-dao"),
            "push it to feature/rename-dao",
        );
        assert_eq!(o.branch_name.as_deref(), Some("feature/rename-dao"));
        assert!(o.commit_message.is_none());
    }

    #[test]
    fn push_override_sentence_is_commit_message() {
        let o = overrides_from_text(
            CheckpointKind::Push,
            ConfirmationAction::Approve,
            Some("Rename DAO classes"),
            "ok but call it Rename DAO classes",
        );
        assert_eq!(o.commit_message.as_deref(), Some("Rename DAO classes"));
    }

    #[test]
    fn plan_modify_falls_back_to_raw_text() {
        let o = overrides_from_text(
            CheckpointKind::Plan,
            ConfirmationAction::Modify,
            None,
            "also update the tests",
        );
        assert_eq!(o.modification.as_deref(), Some("also update the tests"));
    }
}
