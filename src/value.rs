use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::errors::RemoteFault;
use crate::table::Finalizer;
use crate::FunctionId;

/// Boxed future returned by target procedures and callbacks.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, RemoteFault>> + Send + 'static>>;

/// A dynamically typed value crossing the controller boundary.
///
/// `Function` and `Cancellation` are live values that exist only on the local
/// side; marshalling replaces them with `FunctionRef` / `CancelRef`
/// descriptors before a message reaches the embedder, so the serializable
/// subset is exactly what appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Live callable, local procedures and stubs alike. Never serialized.
    #[serde(skip)]
    Function(Callback),
    /// Live cancellation token. Never serialized.
    #[serde(skip)]
    Cancellation(crate::cancel::CancelToken),
    /// Descriptor standing in for a function across the boundary.
    FunctionRef(FunctionId),
    /// Descriptor standing in for a cancellation token across the boundary.
    CancelRef(FunctionId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Callback> {
        match self {
            Value::Function(callback) => Some(callback),
            _ => None,
        }
    }

    pub fn as_cancellation(&self) -> Option<&crate::cancel::CancelToken> {
        match self {
            Value::Cancellation(token) => Some(token),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Callback> for Value {
    fn from(value: Callback) -> Self {
        Value::Function(value)
    }
}

impl From<crate::cancel::CancelToken> for Value {
    fn from(value: crate::cancel::CancelToken) -> Self {
        Value::Cancellation(value)
    }
}

pub(crate) struct CallbackInner {
    run: Box<dyn Fn(Vec<Value>) -> CallFuture + Send + Sync>,
    /// Export marker: the identifier this callback crossed the boundary under.
    marker: Mutex<Option<FunctionId>>,
    /// Armed finalization hook; fires from `Drop` unless disarmed.
    finalizer: Mutex<Option<Finalizer>>,
}

impl Drop for CallbackInner {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.lock().unwrap().take() {
            finalizer.fire();
        }
    }
}

/// A first-class asynchronous procedure.
///
/// Wraps local target procedures, anonymous callbacks handed across the
/// boundary, and stubs synthesized for imported function descriptors. Calling
/// a stub issues a remote invoke; calling a local callback runs it directly.
/// Identity is by allocation, which is what keeps re-imported descriptors
/// resolving to the same object.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackInner>,
}

impl Callback {
    /// Wrap an async closure as a callable value.
    pub fn new<F, Fut>(procedure: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteFault>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CallbackInner {
                run: Box::new(move |args| Box::pin(procedure(args))),
                marker: Mutex::new(None),
                finalizer: Mutex::new(None),
            }),
        }
    }

    /// Invoke the procedure with the given arguments.
    pub fn call(&self, args: Vec<Value>) -> CallFuture {
        (self.inner.run)(args)
    }

    /// Whether `self` and `other` are the same underlying object.
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
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

    pub(crate) fn downgrade(&self) -> Weak<CallbackInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<CallbackInner>) -> Self {
        Self { inner }
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("marker", &self.marker())
            .finish_non_exhaustive()
    }
}
