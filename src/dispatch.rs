//! Incoming message dispatch.
//!
//! `insert` is fire-and-forget: it routes one message, pushes any response
//! through the send callback, and never fails the caller. `insert_waitable`
//! has the same semantics but returns the response message instead, for
//! transports that carry the answer on the request itself.

use std::backtrace::Backtrace;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::controller::ControllerInner;
use crate::errors::RemoteFault;
use crate::marshal;
use crate::message::Message;
use crate::value::Value;
use crate::{FunctionId, MessageId};

pub(crate) fn insert(inner: &Arc<ControllerInner>, message: Message) {
    match message {
        Message::Invoke {
            message_id,
            function_id,
            args,
            one_way,
        } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Some(response) =
                    run_invoke(&inner, message_id, function_id, args, one_way).await
                {
                    inner.post(response, "invoke response");
                }
            });
        }
        Message::Result { message_id, result } => resolve_result(inner, message_id, result),
        Message::Error { message_id, error } => resolve_error(inner, message_id, error),
        Message::Purge { function_id, .. } => apply_purge(inner, &function_id),
        Message::None { message_id } => {
            debug!(controller_id = %inner.controller_id, message_id = %message_id, "discarding none message");
        }
    }
}

pub(crate) async fn insert_waitable(inner: &Arc<ControllerInner>, message: Message) -> Message {
    match message {
        Message::Invoke {
            message_id,
            function_id,
            args,
            one_way,
        } => {
            let reply_id = message_id.clone();
            run_invoke(inner, message_id, function_id, args, one_way)
                .await
                .unwrap_or(Message::None {
                    message_id: reply_id,
                })
        }
        Message::Result { message_id, result } => {
            resolve_result(inner, message_id.clone(), result.clone());
            Message::Result { message_id, result }
        }
        Message::Error { message_id, error } => {
            resolve_error(inner, message_id.clone(), error.clone());
            Message::Error { message_id, error }
        }
        Message::Purge {
            message_id,
            function_id,
        } => {
            apply_purge(inner, &function_id);
            Message::Purge {
                message_id,
                function_id,
            }
        }
        Message::None { message_id } => {
            debug!(controller_id = %inner.controller_id, message_id = %message_id, "echoing none message");
            Message::None { message_id }
        }
    }
}

/// Execute one incoming invoke. Returns the response to deliver, or `None`
/// when a one-way call produced nothing to send.
async fn run_invoke(
    inner: &Arc<ControllerInner>,
    message_id: MessageId,
    function_id: FunctionId,
    args: Vec<Value>,
    one_way: bool,
) -> Option<Message> {
    let target = {
        let tables = inner.tables.lock().unwrap();
        tables
            .objects
            .get(&function_id)
            .and_then(|slot| slot.callable())
    };

    let Some(target) = target else {
        warn!(controller_id = %inner.controller_id, function_id = %function_id, "invoke for unknown function");
        return Some(Message::Error {
            message_id,
            error: RemoteFault::msg(format!("Function '{function_id}' is not found")),
        });
    };

    let args = marshal::import_args(inner, args);
    let outcome = target.call(args).await;

    if one_way {
        if let Err(fault) = outcome {
            warn!(controller_id = %inner.controller_id, function_id = %function_id, %fault, "one-way invoke failed");
        }
        return None;
    }

    Some(match outcome {
        Ok(value) => Message::Result {
            message_id,
            result: marshal::export_value(inner, value),
        },
        Err(fault) => Message::Error {
            message_id,
            error: safe_record(inner, fault),
        },
    })
}

fn resolve_result(inner: &Arc<ControllerInner>, message_id: MessageId, result: Value) {
    let pending = inner.tables.lock().unwrap().invocations.remove(&message_id);
    match pending {
        Some(reply) => {
            let value = marshal::import_value(inner, result);
            let _ = reply.send(Ok(value));
        }
        None => {
            warn!(controller_id = %inner.controller_id, message_id = %message_id, "result for unknown invocation");
        }
    }
}

fn resolve_error(inner: &Arc<ControllerInner>, message_id: MessageId, error: RemoteFault) {
    let pending = inner.tables.lock().unwrap().invocations.remove(&message_id);
    match pending {
        Some(reply) => {
            let fault = rebuild_fault(inner, error);
            let _ = reply.send(Err(fault.into()));
        }
        None => {
            warn!(controller_id = %inner.controller_id, message_id = %message_id, "error for unknown invocation");
        }
    }
}

fn apply_purge(inner: &Arc<ControllerInner>, function_id: &FunctionId) {
    debug!(controller_id = %inner.controller_id, function_id = %function_id, "purge");
    inner.tables.lock().unwrap().evict(function_id);
}

/// Reduce a procedure failure to the record that crosses the boundary.
fn safe_record(inner: &Arc<ControllerInner>, fault: RemoteFault) -> RemoteFault {
    let stack = if inner.produce_stack_trace {
        fault.stack.as_ref().map(|stack| {
            format!(
                "\n------- Remote stack trace [{}]:\n{}",
                inner.controller_id, stack
            )
        })
    } else {
        None
    };
    RemoteFault {
        name: fault.name,
        message: fault.message,
        stack,
    }
}

/// Rebuild a fresh fault from a carried record on the importing side.
///
/// With stack traces enabled the carried text is appended to a locally
/// captured backtrace, so the caller sees a local stack with a remote-origin
/// trailer.
pub(crate) fn rebuild_fault(inner: &Arc<ControllerInner>, record: RemoteFault) -> RemoteFault {
    let stack = if inner.produce_stack_trace {
        record
            .stack
            .map(|remote| format!("{}{remote}", Backtrace::capture()))
    } else {
        None
    };
    RemoteFault {
        name: record.name,
        message: record.message,
        stack,
    }
}
