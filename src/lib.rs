#![deny(unsafe_code)]

//! Transport-agnostic, symmetric, full-duplex RPC controller core.
//!
//! Two peer [`Controller`]s each expose callable functions and invoke the
//! peer's. The embedder owns the wire: it supplies a send callback and feeds
//! received [`Message`]s back in; the controller owns the protocol state
//! machine and the object table that lets functions and cancellation tokens
//! cross the boundary by identifier.
//!
//! ```ignore
//! let controller = Controller::new(move |message| {
//!     websocket.send(encode(message))?;
//!     Ok(Outcome::Posted)
//! });
//! let _handle = controller.register("add", Callback::new(|args| async move {
//!     let (a, b) = (args[0].as_i64().unwrap(), args[1].as_i64().unwrap());
//!     Ok(Value::Int(a + b))
//! }))?;
//! // elsewhere: controller.insert(decode(frame));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! declare_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

declare_id!(
    /// Diagnostic label for one controller; prefixes generated identifiers.
    ControllerId
);
declare_id!(
    /// Opaque name of a callable across the boundary. Embedder-chosen for
    /// registered functions, generated for everything marshalled.
    FunctionId
);
declare_id!(
    /// Opaque identifier correlating an invoke with its result or error.
    MessageId
);

/// Monotonic identifier source, one per controller.
pub(crate) struct IdAllocator {
    prefix: ControllerId,
    next: AtomicU64,
}

impl IdAllocator {
    pub(crate) fn new(prefix: ControllerId) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_message(&self) -> MessageId {
        MessageId(format!("{}/m{}", self.prefix, self.bump()))
    }

    pub(crate) fn next_function(&self) -> FunctionId {
        FunctionId(format!("{}/f{}", self.prefix, self.bump()))
    }
}

pub(crate) fn fresh_controller_id() -> ControllerId {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(8);
    ControllerId(format!("peer-{hex}"))
}

mod caller;
mod dispatch;
mod marshal;
mod table;

mod cancel;
pub use cancel::CancelToken;

mod channel;
pub use channel::{ItemStream, Yield};

mod controller;
pub use controller::{Controller, ControllerOptions, Outcome, Registration, ReplyFuture};

mod errors;
pub use errors::{InvokeError, RegisterError, RemoteFault, SendError};

mod message;
pub use message::Message;

mod value;
pub use value::{CallFuture, Callback, Value};
