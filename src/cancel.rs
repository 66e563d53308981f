use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::table::Finalizer;
use crate::FunctionId;

pub(crate) struct CancelInner {
    raw: CancellationToken,
    /// Export marker, same contract as on [`crate::Callback`].
    marker: Mutex<Option<FunctionId>>,
    finalizer: Mutex<Option<Finalizer>>,
    /// Exporter-side subscription task forwarding the fire signal to the peer.
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CancelInner {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.lock().unwrap().take() {
            watch.abort();
        }
        if let Some(finalizer) = self.finalizer.lock().unwrap().take() {
            finalizer.fire();
        }
    }
}

/// A cooperative cancellation token that can cross the controller boundary.
///
/// Passing a token as an invocation argument exports it by identifier; the
/// peer's procedure receives a synthetic token under the same identifier and
/// observes the fire signal delivered as a one-way invoke.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                raw: CancellationToken::new(),
                marker: Mutex::new(None),
                finalizer: Mutex::new(None),
                watch: Mutex::new(None),
            }),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.inner.raw.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.raw.is_cancelled()
    }

    /// Resolves once the token fires.
    pub async fn cancelled(&self) {
        self.inner.raw.cancelled().await;
    }

    /// Whether `self` and `other` are the same underlying token.
    pub fn ptr_eq(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Clone of the underlying primitive, detached from export bookkeeping.
    pub(crate) fn raw(&self) -> CancellationToken {
        self.inner.raw.clone()
    }

    pub(crate) fn marker(&self) -> Option<FunctionId> {
        self.inner.marker.lock().unwrap().clone()
    }

    pub(crate) fn set_marker(&self, id: FunctionId) {
        *self.inner.marker.lock().unwrap() = Some(id);
    }

    pub(crate) fn clear_marker(&self) {
        *self.inner.marker.lock().unwrap() = None;
    }

    pub(crate) fn arm(&self, finalizer: Finalizer) {
        *self.inner.finalizer.lock().unwrap() = Some(finalizer);
    }

    pub(crate) fn disarm(&self) {
        *self.inner.finalizer.lock().unwrap() = None;
    }

    pub(crate) fn set_watch(&self, handle: JoinHandle<()>) {
        *self.inner.watch.lock().unwrap() = Some(handle);
    }

    pub(crate) fn abort_watch(&self) {
        if let Some(watch) = self.inner.watch.lock().unwrap().take() {
            watch.abort();
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<CancelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<CancelInner>) -> Self {
        Self { inner }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("marker", &self.marker())
            .finish_non_exhaustive()
    }
}
