use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::caller;
use crate::channel::{ItemStream, Yield};
use crate::dispatch;
use crate::errors::{InvokeError, RegisterError, RemoteFault, SendError};
use crate::message::Message;
use crate::table::{FinalizeEvent, Finalizer, ObjectSlot, Tables};
use crate::value::{Callback, Value};
use crate::{ControllerId, FunctionId, IdAllocator};

/// Future returned by a waitable send callback, resolving to the response
/// message for the sent one.
pub type ReplyFuture = Pin<Box<dyn Future<Output = Result<Message, SendError>> + Send + 'static>>;

/// What the embedder's send callback did with a message.
pub enum Outcome {
    /// The message left fire-and-forget; any answer will come back through
    /// [`Controller::insert`].
    Posted,
    /// The transport carries the response on the request itself.
    Replied(ReplyFuture),
}

pub(crate) type SendHandler = Box<dyn Fn(Message) -> Result<Outcome, SendError> + Send + Sync>;

/// Construction options. The send callback is the only required input and is
/// passed separately to [`Controller::new`] / [`Controller::with_options`].
#[derive(Debug, Default)]
pub struct ControllerOptions {
    /// Diagnostic label; generated when absent. Also prefixes every
    /// identifier the controller allocates, which keeps the two peers'
    /// identifier spaces disjoint.
    pub controller_id: Option<ControllerId>,
    /// Carry stack text in error records and attach the remote-origin
    /// trailer on rebuilt faults.
    pub produce_stack_trace: bool,
}

pub(crate) struct ControllerInner {
    pub(crate) controller_id: ControllerId,
    pub(crate) produce_stack_trace: bool,
    pub(crate) on_send: SendHandler,
    pub(crate) ids: IdAllocator,
    pub(crate) tables: Mutex<Tables>,
    finalize_tx: mpsc::UnboundedSender<FinalizeEvent>,
}

impl ControllerInner {
    pub(crate) fn finalizer_for(&self, id: &FunctionId) -> Finalizer {
        Finalizer {
            id: id.clone(),
            events: self.finalize_tx.clone(),
        }
    }

    /// Push a message through the send callback outside any caller-visible
    /// path. Failures are logged, not surfaced.
    pub(crate) fn post(&self, message: Message, context: &'static str) {
        match (self.on_send)(message) {
            Ok(Outcome::Posted) => {}
            Ok(Outcome::Replied(reply)) => {
                tokio::spawn(async move {
                    let _ = reply.await;
                });
            }
            Err(error) => {
                warn!(controller_id = %self.controller_id, context, %error, "send callback failed");
            }
        }
    }

    /// Handle one finalize event: drop the dead table entry and tell the
    /// peer the identifier is gone. A live entry under the same identifier
    /// means it was re-exported or re-imported since the event was queued,
    /// and stays untouched.
    fn finalize(self: &Arc<Self>, id: FunctionId) {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            if tables.released {
                false
            } else {
                match tables.objects.get(&id) {
                    Some(slot) if !slot.is_live() => {
                        tables.objects.remove(&id);
                        true
                    }
                    _ => false,
                }
            }
        };
        if removed {
            debug!(controller_id = %self.controller_id, function_id = %id, "finalized, purging peer");
            self.post(
                Message::Purge {
                    message_id: self.ids.next_message(),
                    function_id: id,
                },
                "purge",
            );
        }
    }

    pub(crate) fn unregister(&self, id: &FunctionId) {
        debug!(controller_id = %self.controller_id, function_id = %id, "released registration");
        self.tables.lock().unwrap().evict(id);
    }

    /// Tear everything down: clear the tables, disarm every finalization
    /// hook, and reject every pending invocation. Idempotent.
    fn shutdown(&self) {
        let (registry, objects, invocations) = {
            let mut tables = self.tables.lock().unwrap();
            if tables.released {
                return;
            }
            tables.released = true;
            (
                std::mem::take(&mut tables.registry),
                std::mem::take(&mut tables.objects),
                std::mem::take(&mut tables.invocations),
            )
        };
        debug!(
            controller_id = %self.controller_id,
            pending = invocations.len(),
            "controller released"
        );
        for callback in registry.values() {
            callback.disarm();
            callback.clear_marker();
        }
        for slot in objects.values() {
            slot.disarm();
        }
        for (_, reply) in invocations {
            let _ = reply.send(Err(InvokeError::ControllerReleased));
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One peer's instance of the RPC engine.
///
/// Symmetric in role: it both exposes callable functions and invokes the
/// peer's. The embedder supplies a send callback and feeds received messages
/// back through [`insert`](Self::insert) or
/// [`insert_waitable`](Self::insert_waitable); everything else, matching
/// calls to results, marshalling callables and tokens by identifier, and
/// keeping the peers' object tables coherent, happens here.
///
/// Handles are cheap clones of one shared state. The controller spawns its
/// finalization watch on the current Tokio runtime, so create it inside one.
#[derive(Clone)]
pub struct Controller {
    pub(crate) inner: Arc<ControllerInner>,
}

impl Controller {
    /// Create a controller with default options.
    pub fn new<S>(on_send: S) -> Self
    where
        S: Fn(Message) -> Result<Outcome, SendError> + Send + Sync + 'static,
    {
        Self::with_options(on_send, ControllerOptions::default())
    }

    /// Create a controller.
    pub fn with_options<S>(on_send: S, options: ControllerOptions) -> Self
    where
        S: Fn(Message) -> Result<Outcome, SendError> + Send + Sync + 'static,
    {
        let controller_id = options
            .controller_id
            .unwrap_or_else(crate::fresh_controller_id);
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            ids: IdAllocator::new(controller_id.clone()),
            controller_id,
            produce_stack_trace: options.produce_stack_trace,
            on_send: Box::new(on_send),
            tables: Mutex::new(Tables::new()),
            finalize_tx,
        });
        spawn_finalize_watch(&inner, finalize_rx);
        Self { inner }
    }

    pub fn controller_id(&self) -> &ControllerId {
        &self.inner.controller_id
    }

    /// Expose a procedure to the peer under `function_id`.
    ///
    /// The registry owns the procedure strongly until the returned handle
    /// releases it, explicitly or on drop.
    pub fn register(
        &self,
        function_id: impl Into<FunctionId>,
        target: Callback,
    ) -> Result<Registration, RegisterError> {
        let id = function_id.into();
        {
            let mut tables = self.inner.tables.lock().unwrap();
            if tables.released {
                return Err(RegisterError::ControllerReleased);
            }
            if target.marker().is_some() || tables.registry.contains_key(&id) {
                return Err(RegisterError::AlreadyRegistered(id));
            }
            target.set_marker(id.clone());
            target.arm(self.inner.finalizer_for(&id));
            tables.registry.insert(id.clone(), target.clone());
            tables
                .objects
                .insert(id.clone(), ObjectSlot::Function(target.downgrade()));
        }
        debug!(controller_id = %self.inner.controller_id, function_id = %id, "registered");
        Ok(Registration {
            controller: Arc::downgrade(&self.inner),
            id,
            active: true,
        })
    }

    /// Expose a generator under `function_id`.
    ///
    /// Sugar over [`register`](Self::register): the exposed procedure
    /// prepends a yield callback, and the wrapper drives the generator,
    /// awaiting each emitted item before the next is produced. Normal
    /// termination resolves the call; a fault propagates to the consumer.
    /// This is the entire streaming protocol, there are no dedicated
    /// message kinds.
    pub fn register_generator<G, Fut>(
        &self,
        function_id: impl Into<FunctionId>,
        generator: G,
    ) -> Result<Registration, RegisterError>
    where
        G: Fn(Yield, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteFault>> + Send + 'static,
    {
        let generator = Arc::new(generator);
        let target = Callback::new(move |mut args| {
            let generator = generator.clone();
            async move {
                if args.is_empty() {
                    return Err(RemoteFault::msg("generator invoked without a yield callback"));
                }
                let Value::Function(emit) = args.remove(0) else {
                    return Err(RemoteFault::msg("generator invoked without a yield callback"));
                };
                generator(Yield::new(emit), args).await.map(|_| Value::Null)
            }
        });
        self.register(function_id, target)
    }

    /// Call `function_id` on the peer and await the result.
    pub async fn invoke(
        &self,
        function_id: impl Into<FunctionId>,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        caller::invoke(&self.inner, function_id.into(), args).await
    }

    /// Call `function_id` on the peer without awaiting any response.
    pub fn invoke_one_way(
        &self,
        function_id: impl Into<FunctionId>,
        args: Vec<Value>,
    ) -> Result<(), InvokeError> {
        caller::invoke_one_way(&self.inner, function_id.into(), args)
    }

    /// Call a generator on the peer, consuming its items lazily.
    pub fn iterate(&self, function_id: impl Into<FunctionId>, args: Vec<Value>) -> ItemStream {
        caller::iterate(&self.inner, function_id.into(), args)
    }

    /// Feed one received message in, fire-and-forget. Never fails the
    /// caller; peer-side problems become `error` responses or log lines.
    pub fn insert(&self, message: Message) {
        dispatch::insert(&self.inner, message);
    }

    /// Feed one received message in and get the response message back
    /// instead of having it pushed through the send callback.
    pub async fn insert_waitable(&self, message: Message) -> Message {
        dispatch::insert_waitable(&self.inner, message).await
    }

    /// Release the controller: reject everything pending and clear every
    /// table. Dropping the last handle does the same.
    pub fn release(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("controller_id", &self.inner.controller_id)
            .finish_non_exhaustive()
    }
}

/// Scoped handle for one registration.
///
/// Releasing, explicitly or on drop, unregisters the procedure, disarms its
/// finalization watch, and clears its export marker so it can be registered
/// again.
pub struct Registration {
    controller: Weak<ControllerInner>,
    id: FunctionId,
    active: bool,
}

impl Registration {
    pub fn function_id(&self) -> &FunctionId {
        &self.id
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.controller.upgrade() {
            inner.unregister(&self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release_now();
    }
}

fn spawn_finalize_watch(
    inner: &Arc<ControllerInner>,
    mut events: mpsc::UnboundedReceiver<FinalizeEvent>,
) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            inner.finalize(event.id);
        }
    });
}
