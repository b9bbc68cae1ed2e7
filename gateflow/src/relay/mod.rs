//! Streaming token relay.
//!
//! Fragments from the streamed stage are forwarded to the caller over a
//! bounded channel as soon as they arrive, one event per fragment. A consumer
//! that goes away is treated exactly like a cancellation.

use tokio::sync::mpsc;
use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::errors::PipelineError;
use crate::pipeline::RunOutcome;

/// An item observed by the caller of a streamed run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A text fragment from the streamed stage.
    Token(String),
    /// The run finished; always the last event.
    Completed(RunOutcome),
}

impl PipelineEvent {
    /// Returns the fragment of a `Token` event.
    #[must_use]
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Token(text) => Some(text),
            Self::Completed(_) => None,
        }
    }
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct TokenRelay {
    sender: mpsc::Sender<PipelineEvent>,
}

impl TokenRelay {
    /// Wraps an existing sender.
    #[must_use]
    pub fn new(sender: mpsc::Sender<PipelineEvent>) -> Self {
        Self { sender }
    }

    /// Creates a relay and its receiving half.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self::new(sender), receiver)
    }

    /// Forwards one fragment, waiting for channel capacity.
    ///
    /// Fails with `Cancelled` if the run is cancelled while waiting or the
    /// consumer has gone away; in the latter case the token is cancelled too.
    pub async fn forward(
        &self,
        fragment: String,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let sent = cancel
            .run_until_cancelled(self.sender.send(PipelineEvent::Token(fragment)))
            .await?;
        if sent.is_err() {
            debug!("Event consumer dropped; cancelling run");
            cancel.cancel("event consumer dropped");
            return Err(cancel.to_error());
        }
        Ok(())
    }

    /// Sends the terminal event. Returns false if nobody is listening.
    pub async fn complete(&self, outcome: RunOutcome) -> bool {
        self.sender
            .send(PipelineEvent::Completed(outcome))
            .await
            .is_ok()
    }

    /// Returns true once the receiving half has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forward_preserves_order() {
        let (relay, mut rx) = TokenRelay::channel(8);
        let cancel = CancellationToken::new();
        for fragment in ["a", "b", "c"] {
            relay.forward(fragment.to_string(), &cancel).await.unwrap();
        }
        drop(relay);

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event.as_token().unwrap().to_string());
        }
        assert_eq!(received, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels() {
        let (relay, rx) = TokenRelay::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();

        let err = relay.forward("x".to_string(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(cancel.is_cancelled());
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_capacity() {
        let (relay, _rx) = TokenRelay::channel(1);
        let cancel = Arc::new(CancellationToken::new());
        relay.forward("fills buffer".to_string(), &cancel).await.unwrap();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel("stop");
            })
        };
        let err = relay.forward("blocked".to_string(), &cancel).await.unwrap_err();
        canceller.await.unwrap();
        assert!(err.to_string().contains("stop"));
    }

    #[tokio::test]
    async fn test_forward_after_cancel_sends_nothing() {
        let (relay, mut rx) = TokenRelay::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel("done");

        assert!(relay.forward("late".to_string(), &cancel).await.is_err());
        drop(relay);
        assert!(rx.recv().await.is_none());
    }
}
