use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures_util::{stream::BoxStream, Stream, StreamExt};

use crate::backend::BackendError;

/// Shared stop flag between a [`ResponseStream`] and whatever produces it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lazy, finite sequence of response fragments.
///
/// A stream is consumed once; a new generation needs a new `invoke_stream`
/// call. Cancelling (explicitly or by dropping the stream) ends iteration and
/// signals the producer to stop at its next step.
pub struct ResponseStream {
    inner: BoxStream<'static, Result<String, BackendError>>,
    cancel: CancelHandle,
    finished: bool,
}

impl ResponseStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, BackendError>> + Send + 'static,
    {
        Self::with_cancel(stream, CancelHandle::new())
    }

    pub fn with_cancel<S>(stream: S, cancel: CancelHandle) -> Self
    where
        S: Stream<Item = Result<String, BackendError>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            cancel,
            finished: false,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String, BackendError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for ResponseStream {
    type Item = Result<String, BackendError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }

        let next = self.inner.poll_next_unpin(cx);
        match &next {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => self.finished = true,
            _ => {}
        }
        next
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.finished)
            .finish()
    }
}
