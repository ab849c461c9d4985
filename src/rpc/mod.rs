//! RPC envelope and channel.
//!
//! A JSON-RPC-like protocol carried on one multiplexer channel. Only the generic
//! envelope and dispatch mechanics live here; method names and parameter shapes
//! belong to the layers above.
//!
//! Wire shapes:
//! - request: `{"id": 1, "method": "invoke", "params": {...}}`
//! - success: `{"id": 1, "result": ...}`
//! - failure: `{"id": 1, "error": {"code": -32603, "message": "...", "data": ...}}`
//! - notification: `{"method": "$/cancelRequest", "params": {"id": 1}}`

pub mod channel;

pub use channel::{BusyGuard, InboundHandler, PendingCall, RpcChannel, CANCEL_METHOD};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Standard and host-specific error codes
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Raised by plugin code while handling a request
    pub const PLUGIN_ERROR: i64 = -32000;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const UNAUTHORIZED: i64 = 4100;
}

/// Request id; unique for the lifetime of one channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// Error object carried in a failure response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, detail)
    }

    pub fn cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "request cancelled")
    }

    pub fn unauthorized(capability: &str) -> Self {
        Self::new(codes::UNAUTHORIZED, format!("capability not granted: {}", capability))
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("channel disconnected")]
    Disconnected,

    #[error("remote error: {0}")]
    Remote(RpcErrorObject),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

/// One decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl RpcMessage {
    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        RpcMessage::Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        RpcMessage::Notification {
            method: method.to_string(),
            params,
        }
    }

    pub fn response(id: RequestId, outcome: Result<Value, RpcErrorObject>) -> Self {
        RpcMessage::Response { id, outcome }
    }

    /// Decode and classify an envelope. Anything that is not exactly one of the
    /// three shapes is rejected.
    pub fn parse(bytes: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RpcError::Malformed(format!("invalid json: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(RpcError::Malformed("envelope is not an object".to_string()));
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|_| RpcError::Malformed("id must be a number or string".to_string()))?,
            ),
        };
        let method = match object.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err(RpcError::Malformed("method must be a string".to_string())),
        };
        let params = object.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(RpcMessage::Request { id, method, params }),
            (None, Some(method)) => Ok(RpcMessage::Notification { method, params }),
            (Some(id), None) => Self::parse_outcome(id, &mut object),
            (None, None) => Err(RpcError::Malformed(
                "envelope has neither id nor method".to_string(),
            )),
        }
    }

    fn parse_outcome(id: RequestId, object: &mut Map<String, Value>) -> Result<Self, RpcError> {
        match (object.remove("result"), object.remove("error")) {
            (Some(_), Some(error)) if !error.is_null() => Err(RpcError::Malformed(format!(
                "response {} carries both result and error",
                id
            ))),
            (_, Some(error)) if !error.is_null() => {
                let error: RpcErrorObject = serde_json::from_value(error)
                    .map_err(|e| RpcError::Malformed(format!("invalid error object: {}", e)))?;
                Ok(RpcMessage::Response {
                    id,
                    outcome: Err(error),
                })
            }
            (Some(result), _) => Ok(RpcMessage::Response {
                id,
                outcome: Ok(result),
            }),
            (None, _) => Err(RpcError::Malformed(format!(
                "response {} carries neither result nor error",
                id
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RpcMessage::Request { id, method, params } => {
                json!({ "id": id, "method": method, "params": params })
            }
            RpcMessage::Response { id, outcome: Ok(result) } => {
                json!({ "id": id, "result": result })
            }
            RpcMessage::Response { id, outcome: Err(error) } => {
                json!({ "id": id, "error": error })
            }
            RpcMessage::Notification { method, params } => {
                json!({ "method": method, "params": params })
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, RpcError> {
        serde_json::to_vec(&self.to_value())
            .map(Bytes::from)
            .map_err(|e| RpcError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_all_shapes() {
        let request = RpcMessage::parse(br#"{"id":1,"method":"invoke","params":{"a":1}}"#).unwrap();
        assert_eq!(
            request,
            RpcMessage::request(RequestId::Number(1), "invoke", json!({"a": 1}))
        );

        let notification = RpcMessage::parse(br#"{"method":"log","params":["hi"]}"#).unwrap();
        assert!(matches!(notification, RpcMessage::Notification { .. }));

        let success = RpcMessage::parse(br#"{"id":"a","result":null}"#).unwrap();
        assert_eq!(
            success,
            RpcMessage::response(RequestId::String("a".to_string()), Ok(Value::Null))
        );

        let failure =
            RpcMessage::parse(br#"{"id":2,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        match failure {
            RpcMessage::Response { outcome: Err(error), .. } => {
                assert_eq!(error.code, codes::METHOD_NOT_FOUND)
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        for raw in [
            &b"not json"[..],
            br#"[1,2,3]"#,
            br#"{"params":{}}"#,
            br#"{"id":1}"#,
            br#"{"id":1,"method":7}"#,
            br#"{"id":{"x":1},"method":"m"}"#,
            br#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
        ] {
            assert!(
                matches!(RpcMessage::parse(raw), Err(RpcError::Malformed(_))),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_error_response_omits_absent_data() {
        let message = RpcMessage::response(
            RequestId::Number(9),
            Err(RpcErrorObject::cancelled()),
        );
        let value = message.to_value();
        assert_eq!(value["error"]["code"], json!(codes::REQUEST_CANCELLED));
        assert!(value["error"].get("data").is_none());
        assert!(value.get("result").is_none());
    }
}
