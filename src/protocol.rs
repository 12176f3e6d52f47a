//! Wire frames exchanged with the remote executor.
//!
//! Frames are JSON objects, one per channel message:
//!
//! - `{"type":"register","requestId",...,"functionId","functionBody","paramNames"?}`
//! - `{"type":"execute","requestId",...,"functionId","markerId"?,"args":[...]}`
//! - `{"requestId","result"}` or `{"requestId","error"}` back from the executor
//!
//! `functionBody` is shipped as an opaque string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MarkerId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Register,
    Execute,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Execute => "execute",
        }
    }
}

/// Body of an outbound frame, without the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestPayload {
    #[serde(rename_all = "camelCase")]
    Register {
        function_id: MarkerId,
        function_body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param_names: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    Execute {
        function_id: MarkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker_id: Option<MarkerId>,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl RequestPayload {
    pub fn register(id: MarkerId, body: impl Into<String>) -> Self {
        Self::Register {
            function_id: id,
            function_body: body.into(),
            param_names: None,
        }
    }

    pub fn execute(id: MarkerId, args: Vec<Value>) -> Self {
        Self::Execute {
            marker_id: Some(id.clone()),
            function_id: id,
            args,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Register { .. } => RequestKind::Register,
            Self::Execute { .. } => RequestKind::Execute,
        }
    }

    pub fn function_id(&self) -> &MarkerId {
        match self {
            Self::Register { function_id, .. } | Self::Execute { function_id, .. } => function_id,
        }
    }
}

/// A complete client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

/// A server → client reply. Only `requestId` is needed to route it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    /// Optional observability tag naming the marker the result belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_id: Option<MarkerId>,
}

impl ReplyFrame {
    /// The reply as a call outcome: `Err(message)` when `error` is present.
    pub fn outcome(&self) -> Result<Value, String> {
        match &self.error {
            Some(Value::String(message)) => Err(message.clone()),
            Some(other) => Err(other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string())),
            None => Ok(self.result.clone().unwrap_or(Value::Null)),
        }
    }
}
