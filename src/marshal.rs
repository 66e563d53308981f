//! The export/import transforms that rewrite values crossing the boundary.
//!
//! Export replaces live functions and cancellation tokens with descriptors;
//! import turns descriptors back into callables and synthetic tokens. Both
//! transforms run element-wise over argument lists and result values,
//! recursing through containers, and both take the controller's table lock
//! exactly once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::controller::ControllerInner;
use crate::errors::RemoteFault;
use crate::table::{ObjectSlot, Tables};
use crate::value::{Callback, Value};

pub(crate) fn export_args(inner: &Arc<ControllerInner>, args: Vec<Value>) -> Vec<Value> {
    let mut tables = inner.tables.lock().unwrap();
    args.into_iter()
        .map(|value| export_locked(inner, &mut tables, value))
        .collect()
}

pub(crate) fn export_value(inner: &Arc<ControllerInner>, value: Value) -> Value {
    let mut tables = inner.tables.lock().unwrap();
    export_locked(inner, &mut tables, value)
}

pub(crate) fn import_args(inner: &Arc<ControllerInner>, args: Vec<Value>) -> Vec<Value> {
    let mut tables = inner.tables.lock().unwrap();
    args.into_iter()
        .map(|value| import_locked(inner, &mut tables, value))
        .collect()
}

pub(crate) fn import_value(inner: &Arc<ControllerInner>, value: Value) -> Value {
    let mut tables = inner.tables.lock().unwrap();
    import_locked(inner, &mut tables, value)
}

fn export_locked(inner: &Arc<ControllerInner>, tables: &mut Tables, value: Value) -> Value {
    match value {
        Value::Function(callback) => {
            if let Some(id) = callback.marker() {
                return Value::FunctionRef(id);
            }
            let id = inner.ids.next_function();
            callback.set_marker(id.clone());
            callback.arm(inner.finalizer_for(&id));
            // The strong registry entry keeps the callable alive until the
            // peer purges its stub; the weak entry serves dispatch lookups.
            tables.registry.insert(id.clone(), callback.clone());
            tables
                .objects
                .insert(id.clone(), ObjectSlot::Function(callback.downgrade()));
            debug!(controller_id = %inner.controller_id, function_id = %id, "exported callback");
            Value::FunctionRef(id)
        }
        Value::Cancellation(token) => {
            if let Some(id) = token.marker() {
                return Value::CancelRef(id);
            }
            let id = inner.ids.next_function();
            token.set_marker(id.clone());
            token.arm(inner.finalizer_for(&id));
            tables
                .objects
                .insert(id.clone(), ObjectSlot::CancelSource(token.downgrade()));

            // Forward the fire signal: when the local token cancels, tell the
            // peer's abort adapter with a one-way invoke on the shared id.
            let raw = token.raw();
            let weak = Arc::downgrade(inner);
            let fire_id = id.clone();
            let watch = tokio::spawn(async move {
                raw.cancelled().await;
                let Some(ctrl) = weak.upgrade() else { return };
                if let Err(error) = crate::caller::invoke_one_way(&ctrl, fire_id.clone(), Vec::new())
                {
                    warn!(function_id = %fire_id, %error, "cancel signal not delivered");
                }
            });
            token.set_watch(watch);
            debug!(controller_id = %inner.controller_id, function_id = %id, "exported cancellation token");
            Value::CancelRef(id)
        }
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| export_locked(inner, tables, item))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(key, item)| (key, export_locked(inner, tables, item)))
                .collect(),
        ),
        other => other,
    }
}

fn import_locked(inner: &Arc<ControllerInner>, tables: &mut Tables, value: Value) -> Value {
    match value {
        Value::FunctionRef(id) => {
            // Same identifier, same stub, as long as the referent lives.
            if let Some(callback) = tables.objects.get(&id).and_then(ObjectSlot::callable) {
                return Value::Function(callback);
            }
            let stub = make_stub(inner, &id);
            stub.set_marker(id.clone());
            stub.arm(inner.finalizer_for(&id));
            tables
                .objects
                .insert(id.clone(), ObjectSlot::Function(stub.downgrade()));
            debug!(controller_id = %inner.controller_id, function_id = %id, "synthesized stub");
            Value::Function(stub)
        }
        Value::CancelRef(id) => {
            if let Some(ObjectSlot::CancelAdapter { token, .. }) = tables.objects.get(&id)
                && let Some(existing) = token.upgrade()
            {
                return Value::Cancellation(CancelToken::from_inner(existing));
            }

            // Build the local controller and its abort adapter. The peer's
            // one-way invoke on this id reaches the adapter, which fires the
            // synthetic token observed by local procedures.
            let token = CancelToken::new();
            let raw = token.raw();
            let adapter = Callback::new(move |_args| {
                let raw = raw.clone();
                async move {
                    raw.cancel();
                    Ok(Value::Null)
                }
            });
            adapter.set_marker(id.clone());
            token.set_marker(id.clone());
            token.arm(inner.finalizer_for(&id));
            tables.registry.insert(id.clone(), adapter.clone());
            tables.objects.insert(
                id.clone(),
                ObjectSlot::CancelAdapter {
                    callback: adapter.downgrade(),
                    token: token.downgrade(),
                },
            );
            debug!(controller_id = %inner.controller_id, function_id = %id, "built abort adapter");
            Value::Cancellation(token)
        }
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| import_locked(inner, tables, item))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(key, item)| (key, import_locked(inner, tables, item)))
                .collect(),
        ),
        other => other,
    }
}

/// A stub procedure: calling it issues a remote invoke for `id`.
fn make_stub(inner: &Arc<ControllerInner>, id: &crate::FunctionId) -> Callback {
    let weak = Arc::downgrade(inner);
    let target = id.clone();
    Callback::new(move |args| {
        let weak = weak.clone();
        let target = target.clone();
        async move {
            let Some(ctrl) = weak.upgrade() else {
                return Err(RemoteFault::msg("Controller released"));
            };
            crate::caller::invoke(&ctrl, target, args)
                .await
                .map_err(RemoteFault::from)
        }
    })
}
