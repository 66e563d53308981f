use std::collections::HashMap;
use std::sync::Weak;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::cancel::{CancelInner, CancelToken};
use crate::errors::InvokeError;
use crate::value::{Callback, CallbackInner, Value};
use crate::{FunctionId, MessageId};

/// Notification that a weakly held object was dropped.
pub(crate) struct FinalizeEvent {
    pub id: FunctionId,
}

/// Armed finalization hook carried by exported objects and stubs.
///
/// Fires from `Drop`; the controller's watch task turns the event into table
/// cleanup and a best-effort `Purge` to the peer. Disarming (on purge,
/// release, or controller teardown) makes the drop silent.
pub(crate) struct Finalizer {
    pub id: FunctionId,
    pub events: mpsc::UnboundedSender<FinalizeEvent>,
}

impl Finalizer {
    pub(crate) fn fire(self) {
        trace!(function_id = %self.id, "finalize event");
        let _ = self.events.send(FinalizeEvent { id: self.id });
    }
}

/// Weak entry in the object table.
pub(crate) enum ObjectSlot {
    /// A local procedure, an anonymous callback we handed out, or a stub we
    /// synthesized for an imported descriptor.
    Function(Weak<CallbackInner>),
    /// An exported cancellation token; not callable by the peer.
    CancelSource(Weak<CancelInner>),
    /// Importer-side pair for a cancel descriptor: the abort adapter the peer
    /// invokes and the synthetic token handed to local procedures.
    CancelAdapter {
        callback: Weak<CallbackInner>,
        token: Weak<CancelInner>,
    },
}

impl ObjectSlot {
    /// The procedure to run for an incoming invoke on this identifier.
    pub(crate) fn callable(&self) -> Option<Callback> {
        match self {
            ObjectSlot::Function(callback) | ObjectSlot::CancelAdapter { callback, .. } => {
                callback.upgrade().map(Callback::from_inner)
            }
            ObjectSlot::CancelSource(_) => None,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        match self {
            ObjectSlot::Function(callback) => callback.strong_count() > 0,
            ObjectSlot::CancelSource(token) => token.strong_count() > 0,
            ObjectSlot::CancelAdapter { callback, token } => {
                callback.strong_count() > 0 || token.strong_count() > 0
            }
        }
    }

    /// Disarm finalization and clear markers on whatever still lives here.
    pub(crate) fn disarm(&self) {
        match self {
            ObjectSlot::Function(callback) => {
                if let Some(inner) = callback.upgrade() {
                    let callback = Callback::from_inner(inner);
                    callback.disarm();
                    callback.clear_marker();
                }
            }
            ObjectSlot::CancelSource(token) => {
                if let Some(inner) = token.upgrade() {
                    let token = CancelToken::from_inner(inner);
                    token.disarm();
                    token.clear_marker();
                    token.abort_watch();
                }
            }
            ObjectSlot::CancelAdapter { callback, token } => {
                if let Some(inner) = callback.upgrade() {
                    let callback = Callback::from_inner(inner);
                    callback.disarm();
                    callback.clear_marker();
                }
                if let Some(inner) = token.upgrade() {
                    let token = CancelToken::from_inner(inner);
                    token.disarm();
                    token.clear_marker();
                }
            }
        }
    }
}

/// Completion primitive for one outstanding invocation.
pub(crate) type PendingReply = oneshot::Sender<Result<Value, InvokeError>>;

/// The controller's shared tables.
///
/// `registry` owns target procedures strongly; `objects` holds weak entries
/// spanning exports and stubs; `invocations` tracks outstanding calls by
/// message identifier. One mutex covers every transition and is never held
/// across an await.
pub(crate) struct Tables {
    pub registry: HashMap<FunctionId, Callback>,
    pub objects: HashMap<FunctionId, ObjectSlot>,
    pub invocations: HashMap<MessageId, PendingReply>,
    pub released: bool,
}

impl Tables {
    pub(crate) fn new() -> Self {
        Self {
            registry: HashMap::new(),
            objects: HashMap::new(),
            invocations: HashMap::new(),
            released: false,
        }
    }

    /// Drop everything known under `id` and silence its finalization.
    ///
    /// Shared by purge handling and registration release; the unknown case is
    /// a no-op.
    pub(crate) fn evict(&mut self, id: &FunctionId) {
        if let Some(slot) = self.objects.remove(id) {
            slot.disarm();
        }
        if let Some(callback) = self.registry.remove(id) {
            callback.disarm();
            callback.clear_marker();
        }
    }
}
