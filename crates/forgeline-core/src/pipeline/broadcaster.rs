//! Per-session ordered event log with replay-then-live subscriptions.
//!
//! The log and the subscriber list sit behind one lock, so a subscriber
//! snapshotting the log and registering for live delivery can never miss or
//! duplicate an event published concurrently.

use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::events::ProgressEvent;

#[derive(Default)]
struct Inner {
    events: Vec<ProgressEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    closed: bool,
}

#[derive(Default)]
pub struct ProgressBroadcaster {
    inner: Mutex<Inner>,
}

/// Events already published at subscribe time, plus the live tail.
pub struct Subscription {
    pub replay: Vec<ProgressEvent>,
    pub live: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl Subscription {
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        stream::iter(self.replay).chain(UnboundedReceiverStream::new(self.live))
    }

    /// Like `into_stream`, skipping events a reconnecting client already has.
    pub fn into_stream_after(
        self,
        last_seen: u64,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        self.into_stream()
            .filter(move |e| futures::future::ready(e.sequence_number > last_seen))
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and fan out. Assigns the next sequence number and returns the
    /// stored event. The first terminal event closes the log; anything
    /// published afterwards is dropped and `None` is returned.
    pub fn publish(&self, mut event: ProgressEvent) -> Option<ProgressEvent> {
        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::warn!(
                session_id = %event.session_id,
                event_type = ?event.event_type,
                "Dropping event published after terminal event"
            );
            return None;
        }

        event.sequence_number = inner.events.len() as u64 + 1;
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        inner.events.push(event.clone());

        if event.is_terminal() {
            inner.closed = true;
            // Dropping the senders ends every live stream after the terminal event
            inner.subscribers.clear();
        }
        Some(event)
    }

    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock();
        let (tx, live) = mpsc::unbounded_channel();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        Subscription {
            replay: inner.events.clone(),
            live,
        }
    }

    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.inner.lock().events.clone()
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().events.len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::events::EventType;
    use crate::pipeline::types::{ConfirmationMode, PipelineInput, PipelineState, RepoSource};

    fn state() -> PipelineState {
        let input = PipelineInput {
            prompt: "rename".into(),
            mode: ConfirmationMode::Autonomous,
            repo: RepoSource::Local { path: ".".into() },
            target_branch: None,
            build_command: None,
            max_retries: None,
        };
        PipelineState::new("s-1", &input, 3)
    }

    fn event(kind: EventType) -> ProgressEvent {
        ProgressEvent::draft(&state(), kind, "msg")
    }

    #[test]
    fn sequence_numbers_are_gapless_from_one() {
        let b = ProgressBroadcaster::new();
        for _ in 0..5 {
            b.publish(event(EventType::StageStarted));
        }
        let seqs: Vec<u64> = b.snapshot().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn log_closes_after_terminal_event() {
        let b = ProgressBroadcaster::new();
        b.publish(event(EventType::StageStarted));
        assert!(b.publish(event(EventType::Completed)).is_some());
        assert!(b.publish(event(EventType::Failed)).is_none());
        assert!(b.is_closed());

        let terminals = b.snapshot().iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn late_subscriber_gets_full_replay_and_stream_ends() {
        let b = ProgressBroadcaster::new();
        b.publish(event(EventType::StageStarted));
        b.publish(event(EventType::StageCompleted));
        b.publish(event(EventType::Cancelled));

        let events: Vec<_> = b.subscribe().into_stream().collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().map(|e| e.event_type), Some(EventType::Cancelled));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_subscriber_sees_no_gap_or_duplicate() {
        let b = Arc::new(ProgressBroadcaster::new());
        let publisher = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                for i in 0..500 {
                    b.publish(event(EventType::BuildOutput));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                b.publish(event(EventType::Completed));
            })
        };

        tokio::task::yield_now().await;
        let events: Vec<_> = b.subscribe().into_stream().collect().await;
        publisher.await.expect("publisher");

        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        let expected: Vec<u64> = (1..=501).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn resume_skips_already_seen_events() {
        let b = ProgressBroadcaster::new();
        for _ in 0..4 {
            b.publish(event(EventType::StageStarted));
        }
        b.publish(event(EventType::Completed));

        let events: Vec<_> = b.subscribe().into_stream_after(3).collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![4, 5]);
    }
}
