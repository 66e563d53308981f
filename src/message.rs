use serde::{Deserialize, Serialize};

use crate::errors::RemoteFault;
use crate::value::Value;
use crate::{FunctionId, MessageId};

/// Protocol message.
///
/// Encoding is the embedder's concern; the controller exchanges these as
/// structured values, and every variant shares the `message_id` header that
/// correlates an invoke with its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request a call on the peer.
    Invoke {
        message_id: MessageId,
        function_id: FunctionId,
        args: Vec<Value>,
        #[serde(default)]
        one_way: bool,
    },
    /// Success response for a prior invoke.
    Result { message_id: MessageId, result: Value },
    /// Failure response for a prior invoke.
    Error {
        message_id: MessageId,
        error: RemoteFault,
    },
    /// The named identifier is no longer reachable on the sending side.
    Purge {
        message_id: MessageId,
        function_id: FunctionId,
    },
    /// Semantic "no response", used by the waitable dispatch variant to
    /// answer one-way invokes.
    None { message_id: MessageId },
}

impl Message {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Message::Invoke { message_id, .. }
            | Message::Result { message_id, .. }
            | Message::Error { message_id, .. }
            | Message::Purge { message_id, .. }
            | Message::None { message_id } => message_id,
        }
    }

    /// Message kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Invoke { .. } => "invoke",
            Message::Result { .. } => "result",
            Message::Error { .. } => "error",
            Message::Purge { .. } => "purge",
            Message::None { .. } => "none",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_survive_round_trip() {
        let message = Message::Invoke {
            message_id: "peer-a/m7".into(),
            function_id: "add".into(),
            args: vec![Value::Int(1), Value::Int(2)],
            one_way: false,
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.message_id(), &MessageId::from("peer-a/m7"));
    }

    #[test]
    fn one_way_defaults_to_false() {
        let json = r#"{"Invoke":{"message_id":"m1","function_id":"f","args":[]}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::Invoke { one_way, .. } => assert!(!one_way),
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn descriptors_round_trip_inside_args() {
        let message = Message::Result {
            message_id: "m2".into(),
            result: Value::List(vec![
                Value::FunctionRef("peer-b/f3".into()),
                Value::CancelRef("peer-b/f4".into()),
            ]),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
