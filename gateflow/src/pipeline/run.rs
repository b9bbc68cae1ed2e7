//! Run inputs, outcomes and the streamed run handle.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::cancellation::CancellationToken;
use crate::metrics::{ErrorRecord, RunSummary};
use crate::relay::PipelineEvent;
use crate::state::{Message, StageName, TextFormat};

/// Input of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Initial message log; the latest user message is the question.
    pub messages: Vec<Message>,
    /// Correlation identifier; generated when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Requesting actor.
    pub actor_id: String,
}

impl RunRequest {
    /// Creates a request holding a single user message.
    #[must_use]
    pub fn new(actor_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(content)],
            correlation_id: None,
            actor_id: actor_id.into(),
        }
    }

    /// Sets the correlation identifier.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Appends a message to the initial log.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

/// Terminal response of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Text shown to the user; never empty.
    pub final_text: String,
    /// Formatting of `final_text`.
    pub format: TextFormat,
    /// False when the run ended in the error stage.
    pub succeeded: bool,
    /// Metrics of the run.
    pub summary: RunSummary,
}

impl RunOutcome {
    /// Returns why the error stage ran, for failed runs.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorRecord> {
        self.summary
            .stages
            .get(StageName::Error)
            .and_then(|metrics| metrics.error.as_ref())
    }
}

/// Handle to a run executing on its own task.
///
/// Yields `Token` events while the final stage streams, then one
/// `Completed` event. After [`PipelineRun::cancel`] the stream ends
/// immediately and nothing further is yielded. Dropping the handle cancels
/// the run.
pub struct PipelineRun {
    events: ReceiverStream<PipelineEvent>,
    cancel: Arc<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl PipelineRun {
    pub(crate) fn new(
        events: ReceiverStream<PipelineEvent>,
        cancel: Arc<CancellationToken>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            cancel,
            task: Some(task),
        }
    }

    /// Cancels the run.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the background task to finish.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task failed");
            }
        }
    }
}

impl Stream for PipelineRun {
    type Item = PipelineEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.events).poll_next(cx)
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        self.cancel.cancel("run handle dropped");
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_none())
            .finish_non_exhaustive()
    }
}
