//! Single-slot confirmation handoff between a suspended controller and
//! whoever answers the checkpoint (HTTP handler, CLI prompt).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::types::{CheckpointKind, ConfirmationAction, ConfirmationOverrides};
use crate::error::RendezvousError;

/// One answer to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmationMessage {
    Decision {
        session_id: String,
        action: ConfirmationAction,
        #[serde(default)]
        overrides: ConfirmationOverrides,
    },
    /// Natural language, interpreted by the intent classifier.
    Freeform { session_id: String, text: String },
}

impl ConfirmationMessage {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Decision { session_id, .. } | Self::Freeform { session_id, .. } => session_id,
        }
    }

    pub fn approve(session_id: impl Into<String>) -> Self {
        Self::Decision {
            session_id: session_id.into(),
            action: ConfirmationAction::Approve,
            overrides: ConfirmationOverrides::default(),
        }
    }

    pub fn cancel(session_id: impl Into<String>) -> Self {
        Self::Decision {
            session_id: session_id.into(),
            action: ConfirmationAction::Cancel,
            overrides: ConfirmationOverrides::default(),
        }
    }

    pub fn freeform(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Freeform {
            session_id: session_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug)]
pub enum WaitOutcome {
    Resolved(ConfirmationMessage),
    TimedOut,
}

struct Pending {
    id: u64,
    checkpoint: CheckpointKind,
    tx: oneshot::Sender<ConfirmationMessage>,
}

pub struct ConfirmationRendezvous {
    session_id: String,
    slot: Mutex<Option<Pending>>,
    next_id: AtomicU64,
}

/// Clears the slot if the waiting future is dropped (session cancelled).
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<Pending>>,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|p| p.id == self.id) {
            *slot = None;
        }
    }
}

impl ConfirmationRendezvous {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Suspend until `resolve` delivers a message or `timeout` elapses.
    /// Only one wait may be outstanding.
    pub async fn wait(
        &self,
        checkpoint: CheckpointKind,
        timeout: Duration,
    ) -> Result<WaitOutcome, RendezvousError> {
        let (tx, mut rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                return Err(RendezvousError::AlreadyWaiting);
            }
            *slot = Some(Pending { id, checkpoint, tx });
        }
        let _guard = SlotGuard {
            slot: &self.slot,
            id,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(message)) => Ok(WaitOutcome::Resolved(message)),
            Ok(Err(_)) => Err(RendezvousError::NoPendingCheckpoint),
            Err(_) => {
                // Close the slot under the lock. A resolve that already took
                // the sender has sent before releasing it, so the message is
                // in the channel.
                let mut slot = self.slot.lock();
                if slot.as_ref().is_some_and(|p| p.id == id) {
                    *slot = None;
                    return Ok(WaitOutcome::TimedOut);
                }
                drop(slot);
                match rx.try_recv() {
                    Ok(message) => Ok(WaitOutcome::Resolved(message)),
                    Err(_) => Ok(WaitOutcome::TimedOut),
                }
            }
        }
    }

    /// Deliver a message to the pending wait. Never blocks. Rejected when no
    /// checkpoint is pending, including after the pending one was consumed.
    pub fn resolve(&self, message: ConfirmationMessage) -> Result<CheckpointKind, RendezvousError> {
        if message.session_id() != self.session_id {
            return Err(RendezvousError::SessionMismatch {
                expected: self.session_id.clone(),
                got: message.session_id().to_string(),
            });
        }

        let mut slot = self.slot.lock();
        let pending = slot.take().ok_or(RendezvousError::NoPendingCheckpoint)?;
        let checkpoint = pending.checkpoint;
        pending
            .tx
            .send(message)
            .map_err(|_| RendezvousError::NoPendingCheckpoint)?;
        Ok(checkpoint)
    }

    pub fn pending(&self) -> Option<CheckpointKind> {
        self.slot.lock().as_ref().map(|p| p.checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn resolve_without_wait_is_rejected() {
        let rv = ConfirmationRendezvous::new("s");
        assert_eq!(
            rv.resolve(ConfirmationMessage::approve("s")),
            Err(RendezvousError::NoPendingCheckpoint)
        );
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_once() {
        let rv = Arc::new(ConfirmationRendezvous::new("s"));
        let waiter = {
            let rv = Arc::clone(&rv);
            tokio::spawn(async move { rv.wait(CheckpointKind::Plan, Duration::from_secs(5)).await })
        };

        while rv.pending().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(rv.resolve(ConfirmationMessage::approve("s")), Ok(CheckpointKind::Plan));
        assert_eq!(
            rv.resolve(ConfirmationMessage::approve("s")),
            Err(RendezvousError::NoPendingCheckpoint)
        );

        let outcome = waiter.await.expect("join").expect("wait");
        assert!(matches!(
            outcome,
            WaitOutcome::Resolved(ConfirmationMessage::Decision {
                action: ConfirmationAction::Approve,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn second_wait_is_rejected() {
        let rv = Arc::new(ConfirmationRendezvous::new("s"));
        let first = {
            let rv = Arc::clone(&rv);
            tokio::spawn(async move { rv.wait(CheckpointKind::Push, Duration::from_secs(5)).await })
        };
        while rv.pending().is_none() {
            tokio::task::yield_now().await;
        }

        let second = rv.wait(CheckpointKind::Push, Duration::from_millis(10)).await;
        assert!(matches!(second, Err(RendezvousError::AlreadyWaiting)));

        rv.resolve(ConfirmationMessage::cancel("s")).expect("resolve");
        first.await.expect("join").expect("wait");
    }

    #[tokio::test]
    async fn timeout_closes_the_slot() {
        let rv = ConfirmationRendezvous::new("s");
        let outcome = rv
            .wait(CheckpointKind::Validation, Duration::from_millis(20))
            .await
            .expect("wait");
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(rv.pending().is_none());
        assert_eq!(
            rv.resolve(ConfirmationMessage::approve("s")),
            Err(RendezvousError::NoPendingCheckpoint)
        );
    }

    #[tokio::test]
    async fn dropped_wait_releases_slot() {
        let rv = ConfirmationRendezvous::new("s");
        {
            let fut = rv.wait(CheckpointKind::Plan, Duration::from_secs(5));
            tokio::pin!(fut);
            let _ = tokio::time::timeout(Duration::from_millis(10), &mut fut).await;
        }
        assert!(rv.pending().is_none());
    }

    #[test]
    fn message_for_other_session_is_rejected() {
        let rv = ConfirmationRendezvous::new("s");
        assert!(matches!(
            rv.resolve(ConfirmationMessage::approve("other")),
            Err(RendezvousError::SessionMismatch { .. })
        ));
    }
}
