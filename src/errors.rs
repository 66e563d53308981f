use serde::{Deserialize, Serialize};

use crate::FunctionId;

/// Error record carried in `error` messages and returned by target procedures.
///
/// The controller never transports live error objects. A failure crossing the
/// boundary is reduced to this record on the exporting side and rebuilt into
/// a fresh fault on the importing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteFault {
    /// Error class name, `"Error"` for ordinary failures.
    pub name: String,
    /// Human-readable description.
    pub message: String,
    /// Optional stack text, populated only when stack traces are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteFault {
    /// Create a fault with an explicit class name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Create an ordinary `"Error"`-class fault.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Attach stack text to this fault.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<InvokeError> for RemoteFault {
    fn from(error: InvokeError) -> Self {
        match error {
            InvokeError::Remote(fault) => fault,
            InvokeError::Cancelled => RemoteFault::new("Cancelled", "invocation cancelled"),
            other => RemoteFault::msg(other.to_string()),
        }
    }
}

/// Failure reported by the embedder's send callback.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    message: String,
}

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SendError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// Failure registering a target procedure.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The procedure carries an export marker or the identifier is taken.
    #[error("function '{0}' is already registered")]
    AlreadyRegistered(FunctionId),
    /// The controller was released.
    #[error("Controller released")]
    ControllerReleased,
}

/// Failure of an outgoing invocation, surfaced to the calling code.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The peer's procedure failed; carries the rebuilt fault.
    #[error(transparent)]
    Remote(#[from] RemoteFault),
    /// A waitable send returned a message that does not answer the invoke.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The caller-supplied cancellation token fired while awaiting.
    #[error("invocation cancelled")]
    Cancelled,
    /// The controller was released while the invocation was pending.
    #[error("Controller released")]
    ControllerReleased,
    /// The send callback failed.
    #[error("transport failure: {0}")]
    Transport(#[from] SendError),
}
