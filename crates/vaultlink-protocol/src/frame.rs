//! Wire frame shapes exchanged between the two processes.
//!
//! Every payload on the transport is one JSON-encoded [`Frame`]. Requests
//! and responses carry a correlation id; unsolicited pushes carry a topic
//! and no correlation id. The union is untagged: a request always has
//! `command`, a response always has `result` and `error` (possibly null),
//! a push always has `topic`, and the decoder tells them apart by shape.

use crate::error::{LinkError, LinkResult};
use crate::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire marker a peer sends when it explicitly refuses an operation.
pub const DENIED_ERROR: &str = "denied";

/// Answer shape an out-of-date peer gives to the capability probe.
pub const LEGACY_ACK: &str = "ack";

/// Low-risk probe command answered by every peer generation.
pub const PROBE_COMMAND: &str = "capabilities";

/// Topics for unsolicited pushes.
pub mod topics {
    /// Host to client: show the approval prompt for a pending decision.
    pub const APPROVAL_PROMPT: &str = "approval/prompt";
    /// Client to host: the human's answer to a previously pushed prompt.
    pub const APPROVAL_ANSWER: &str = "approval/answer";
}

/// One outbound command awaiting a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub correlation_id: CorrelationId,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The correlated answer to a [`CommandRequest`].
///
/// `result` and `error` are serialized even when null so a response never
/// decodes as anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub correlation_id: CorrelationId,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// An explicit refusal, distinct from any transport failure.
    pub fn denied(correlation_id: CorrelationId) -> Self {
        Self::err(correlation_id, DENIED_ERROR)
    }

    pub fn is_denied(&self) -> bool {
        self.error.as_deref() == Some(DENIED_ERROR)
    }
}

/// An unsolicited push with no correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Union of everything that travels over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(CommandRequest),
    Response(CommandResponse),
    Push(PushFrame),
}

impl Frame {
    pub fn to_bytes(&self) -> LinkResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|error| LinkError::Serialization(error.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> LinkResult<Self> {
        serde_json::from_slice(bytes).map_err(|error| LinkError::Serialization(error.to_string()))
    }

    /// The embedded correlation id, if this frame participates in pairing.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Request(request) => Some(request.correlation_id),
            Self::Response(response) => Some(response.correlation_id),
            Self::Push(_) => None,
        }
    }
}
