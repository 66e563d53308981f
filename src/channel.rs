//! Deferred generator: the producer/consumer pair behind streaming calls.
//!
//! The producer side is driven by yield callbacks and by the completion of
//! the underlying invoke; the consumer side is the lazy sequence handed to
//! the caller of `iterate`. Item N+1 is not produced until item N's yield
//! callback resolves, so ordering needs no extra machinery.

use tokio::sync::mpsc;

use crate::errors::{InvokeError, RemoteFault};
use crate::value::{Callback, Value};

pub(crate) const STREAM_BUFFER: usize = 32;

enum StreamEvent {
    Item(Value),
    Finished,
    Failed(InvokeError),
}

/// Create a connected producer/consumer pair.
pub(crate) fn deferred() -> (ItemProducer, ItemStream) {
    let (events, receiver) = mpsc::channel(STREAM_BUFFER);
    (
        ItemProducer { events },
        ItemStream {
            events: receiver,
            terminated: false,
        },
    )
}

/// Producer side. Cloned into the yield callback and the completion task.
#[derive(Clone)]
pub(crate) struct ItemProducer {
    events: mpsc::Sender<StreamEvent>,
}

impl ItemProducer {
    /// Push one item; resolves once the consumer side has room for it.
    /// Fails when the consumer dropped the stream.
    pub(crate) async fn item(&self, value: Value) -> Result<(), ()> {
        self.events
            .send(StreamEvent::Item(value))
            .await
            .map_err(|_| ())
    }

    /// End the sequence normally.
    pub(crate) async fn finish(&self) {
        let _ = self.events.send(StreamEvent::Finished).await;
    }

    /// End the sequence with an error, raised after all prior items.
    pub(crate) async fn fail(&self, error: InvokeError) {
        let _ = self.events.send(StreamEvent::Failed(error)).await;
    }
}

/// Lazy sequence of values produced by a remote generator.
///
/// Returned by [`crate::Controller::iterate`]. Items arrive in the order the
/// generator yielded them; a generator failure surfaces as the final element.
pub struct ItemStream {
    events: mpsc::Receiver<StreamEvent>,
    terminated: bool,
}

impl ItemStream {
    /// Next item, `None` once the sequence ended.
    pub async fn next(&mut self) -> Option<Result<Value, InvokeError>> {
        if self.terminated {
            return None;
        }
        match self.events.recv().await {
            Some(StreamEvent::Item(value)) => Some(Ok(value)),
            Some(StreamEvent::Failed(error)) => {
                self.terminated = true;
                Some(Err(error))
            }
            Some(StreamEvent::Finished) | None => {
                self.terminated = true;
                None
            }
        }
    }

    /// Drain the remaining items, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<Value>, InvokeError> {
        let mut items = Vec::new();
        while let Some(next) = self.next().await {
            items.push(next?);
        }
        Ok(items)
    }
}

/// Handle a registered generator uses to emit items.
///
/// Wraps the yield callback the streaming protocol prepends to the argument
/// list; `item` resolves once the consumer acknowledged the value.
pub struct Yield {
    emit: Callback,
}

impl Yield {
    pub(crate) fn new(emit: Callback) -> Self {
        Self { emit }
    }

    /// Emit one item and wait for the consumer to take it.
    pub async fn item(&self, value: impl Into<Value>) -> Result<(), RemoteFault> {
        self.emit.call(vec![value.into()]).await.map(|_| ())
    }
}
