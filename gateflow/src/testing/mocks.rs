//! Scripted generative service for testing.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ServiceError;
use crate::service::{
    GenerativeService, ResponseContent, ServiceRequest, ServiceResponse, StreamChunk, TextStream,
    Usage,
};

/// A scripted streamed response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    fragments: Vec<String>,
    usage: Option<Usage>,
    failure: Option<(usize, ServiceError)>,
    fragment_delay: Option<Duration>,
}

impl ScriptedStream {
    /// Creates a stream yielding `fragments` in order.
    #[must_use]
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Ends the stream with a usage report.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Fails with `error` after `fragments` fragments have been yielded.
    #[must_use]
    pub fn failing_after(mut self, fragments: usize, error: ServiceError) -> Self {
        self.failure = Some((fragments, error));
        self
    }

    /// Waits `delay` before yielding each item.
    #[must_use]
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    fn into_stream(self, pulled: Arc<AtomicUsize>) -> TextStream {
        let mut items: Vec<Result<StreamChunk, ServiceError>> = Vec::new();
        let limit = self
            .failure
            .as_ref()
            .map_or(self.fragments.len(), |(n, _)| (*n).min(self.fragments.len()));
        items.extend(
            self.fragments
                .into_iter()
                .take(limit)
                .map(|f| Ok(StreamChunk::Fragment(f))),
        );
        match (self.failure, self.usage) {
            (Some((_, error)), _) => items.push(Err(error)),
            (None, Some(usage)) => items.push(Ok(StreamChunk::Usage(usage))),
            (None, None) => {}
        }

        let delay = self.fragment_delay;
        futures::stream::unfold(
            (items.into_iter(), pulled),
            move |(mut items, pulled)| async move {
                let item = items.next()?;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if matches!(item, Ok(StreamChunk::Fragment(_))) {
                    pulled.fetch_add(1, Ordering::SeqCst);
                }
                Some((item, (items, pulled)))
            },
        )
        .boxed()
    }
}

#[derive(Debug)]
enum Reply {
    Response(ServiceResponse),
    Stream(ScriptedStream),
    Failure(ServiceError),
}

/// A [`GenerativeService`] answering from a queue of scripted replies.
///
/// Replies are consumed in order, one per call, whichever method is called.
/// An exhausted script answers with a validation failure.
#[derive(Debug, Default)]
pub struct ScriptedService {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ServiceRequest>>,
    invoke_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    fragments_pulled: Arc<AtomicUsize>,
    call_delay: Option<Duration>,
}

impl ScriptedService {
    /// Creates a service with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, reply: Reply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Queues a structured answer without usage.
    #[must_use]
    pub fn with_structured(self, value: serde_json::Value) -> Self {
        self.with_structured_usage(value, Usage::default())
    }

    /// Queues a structured answer with usage.
    #[must_use]
    pub fn with_structured_usage(self, value: serde_json::Value, usage: Usage) -> Self {
        self.push(Reply::Response(ServiceResponse {
            content: ResponseContent::Structured(value),
            usage,
        }))
    }

    /// Queues a raw text answer.
    #[must_use]
    pub fn with_text(self, text: &str) -> Self {
        self.push(Reply::Response(ServiceResponse {
            content: ResponseContent::Text(text.to_string()),
            usage: Usage::default(),
        }))
    }

    /// Queues a failed call.
    #[must_use]
    pub fn with_failure(self, error: ServiceError) -> Self {
        self.push(Reply::Failure(error))
    }

    /// Queues the same failure `times` times.
    #[must_use]
    pub fn with_failures(self, error: &ServiceError, times: usize) -> Self {
        (0..times).fold(self, |service, _| service.with_failure(error.clone()))
    }

    /// Queues a streamed answer.
    #[must_use]
    pub fn with_stream(self, stream: ScriptedStream) -> Self {
        self.push(Reply::Stream(stream))
    }

    /// Delays every call by `delay` before it answers.
    #[must_use]
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Returns every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of non-streamed calls.
    #[must_use]
    pub fn invoke_calls(&self) -> usize {
        self.invoke_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of streamed calls.
    #[must_use]
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of calls of either kind.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.invoke_calls() + self.stream_calls()
    }

    /// Returns how many fragments consumers have pulled from scripted streams.
    #[must_use]
    pub fn fragments_pulled(&self) -> usize {
        self.fragments_pulled.load(Ordering::SeqCst)
    }

    /// Returns the number of replies not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    async fn next_reply(&self, request: &ServiceRequest) -> Option<Reply> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front();
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

#[async_trait]
impl GenerativeService for ScriptedService {
    async fn invoke(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply(request).await {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Failure(error)) => Err(error),
            Some(Reply::Stream(_)) => Err(ServiceError::malformed_request(
                "scripted a streamed reply, got a plain call",
            )),
            None => Err(ServiceError::validation("script exhausted")),
        }
    }

    async fn invoke_streaming(&self, request: &ServiceRequest) -> Result<TextStream, ServiceError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply(request).await {
            Some(Reply::Stream(stream)) => Ok(stream.into_stream(self.fragments_pulled.clone())),
            Some(Reply::Failure(error)) => Err(error),
            Some(Reply::Response(_)) => Err(ServiceError::malformed_request(
                "scripted a plain reply, got a streamed call",
            )),
            None => Err(ServiceError::validation("script exhausted")),
        }
    }
}
