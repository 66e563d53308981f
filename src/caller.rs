//! Outgoing call paths: `invoke`, `invoke_one_way`, and `iterate`.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use crate::channel::{self, ItemStream};
use crate::controller::{ControllerInner, Outcome};
use crate::errors::{InvokeError, RemoteFault};
use crate::marshal;
use crate::message::Message;
use crate::value::{Callback, Value};
use crate::FunctionId;

/// Invoke a function on the peer and await its result.
pub(crate) async fn invoke(
    inner: &Arc<ControllerInner>,
    function_id: FunctionId,
    args: Vec<Value>,
) -> Result<Value, InvokeError> {
    // A caller-supplied token aborts the local wait; the peer is reached only
    // through the cancel descriptor the export transform creates for it.
    let cancel = args
        .iter()
        .rev()
        .find_map(|value| value.as_cancellation().cloned());

    let wire_args = marshal::export_args(inner, args);
    let message_id = inner.ids.next_message();
    let (reply_tx, mut reply_rx) = oneshot::channel();

    // The completion must be trackable before the send callback runs, so a
    // synchronous reply cannot race the registration.
    {
        let mut tables = inner.tables.lock().unwrap();
        if tables.released {
            return Err(InvokeError::ControllerReleased);
        }
        tables.invocations.insert(message_id.clone(), reply_tx);
    }
    trace!(controller_id = %inner.controller_id, message_id = %message_id, function_id = %function_id, "invoke");

    let message = Message::Invoke {
        message_id: message_id.clone(),
        function_id,
        args: wire_args,
        one_way: false,
    };
    let outcome = match (inner.on_send)(message) {
        Ok(outcome) => outcome,
        Err(error) => {
            inner.tables.lock().unwrap().invocations.remove(&message_id);
            return Err(InvokeError::Transport(error));
        }
    };

    match outcome {
        Outcome::Posted => {
            if let Some(token) = cancel {
                let raw = token.raw();
                tokio::select! {
                    _ = raw.cancelled() => {
                        inner.tables.lock().unwrap().invocations.remove(&message_id);
                        Err(InvokeError::Cancelled)
                    }
                    reply = &mut reply_rx => {
                        reply.unwrap_or_else(|_| Err(InvokeError::ControllerReleased))
                    }
                }
            } else {
                reply_rx
                    .await
                    .unwrap_or_else(|_| Err(InvokeError::ControllerReleased))
            }
        }
        Outcome::Replied(future) => {
            let reply = future.await;
            inner.tables.lock().unwrap().invocations.remove(&message_id);
            let message = reply.map_err(InvokeError::Transport)?;
            if message.message_id() != &message_id {
                return Err(InvokeError::UnexpectedResponse(format!(
                    "message id '{}' does not answer '{}'",
                    message.message_id(),
                    message_id
                )));
            }
            match message {
                Message::Result { result, .. } => Ok(marshal::import_value(inner, result)),
                Message::Error { error, .. } => {
                    Err(InvokeError::Remote(crate::dispatch::rebuild_fault(inner, error)))
                }
                Message::None { .. } => Ok(Value::Null),
                other => Err(InvokeError::UnexpectedResponse(format!(
                    "{} message cannot answer an invoke",
                    other.kind()
                ))),
            }
        }
    }
}

/// Invoke without registering a completion; any response is discarded.
pub(crate) fn invoke_one_way(
    inner: &Arc<ControllerInner>,
    function_id: FunctionId,
    args: Vec<Value>,
) -> Result<(), InvokeError> {
    if inner.tables.lock().unwrap().released {
        return Err(InvokeError::ControllerReleased);
    }
    let wire_args = marshal::export_args(inner, args);
    let message = Message::Invoke {
        message_id: inner.ids.next_message(),
        function_id,
        args: wire_args,
        one_way: true,
    };
    match (inner.on_send)(message) {
        Ok(Outcome::Posted) => Ok(()),
        Ok(Outcome::Replied(reply)) => {
            // Still drive the embedder's future, the answer is just ignored.
            tokio::spawn(async move {
                let _ = reply.await;
            });
            Ok(())
        }
        Err(error) => Err(InvokeError::Transport(error)),
    }
}

/// Invoke a remote generator, exposing its items as a lazy sequence.
pub(crate) fn iterate(
    inner: &Arc<ControllerInner>,
    function_id: FunctionId,
    mut args: Vec<Value>,
) -> ItemStream {
    let (producer, stream) = channel::deferred();

    // The yield callback travels as the first argument; the remote wrapper
    // awaits each call before producing the next item.
    let emit = {
        let producer = producer.clone();
        Callback::new(move |mut args| {
            let producer = producer.clone();
            async move {
                let item = if args.is_empty() {
                    Value::Null
                } else {
                    args.remove(0)
                };
                producer
                    .item(item)
                    .await
                    .map(|_| Value::Null)
                    .map_err(|_| RemoteFault::msg("stream consumer dropped"))
            }
        })
    };

    let mut full_args = Vec::with_capacity(args.len() + 1);
    full_args.push(Value::Function(emit));
    full_args.append(&mut args);

    let inner = inner.clone();
    tokio::spawn(async move {
        match invoke(&inner, function_id, full_args).await {
            Ok(_) => producer.finish().await,
            Err(error) => producer.fail(error).await,
        }
    });

    stream
}
