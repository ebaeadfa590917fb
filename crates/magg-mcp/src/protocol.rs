//! JSON-RPC 2.0 framing for MCP.
//!
//! The aggregator sits on both sides of the protocol: it serves clients and
//! it drives backends. Both directions share these frame types. Messages are
//! UTF-8 JSON, newline-delimited on stdio transports, one body per HTTP
//! round-trip, and must not contain embedded newlines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision this implementation negotiates.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes. The -32000 range carries aggregator-defined kinds.
pub mod code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// MCP request-cancelled code.
    pub const CANCELLED: i32 = -32800;
}

/// A request ID: string or integer, never null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A request frame (has an `id`, expects a response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A notification frame (no `id`, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A response frame: result or error, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(code::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_ERROR, message)
    }
}

/// Any frame that can arrive on a transport.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Classify and parse one frame.
    ///
    /// A frame with an `id` and a `method` is a request; `id` without
    /// `method` is a response; `method` without `id` is a notification.
    pub fn parse(text: &str) -> Result<Self, ErrorObject> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| ErrorObject::new(code::PARSE_ERROR, "invalid JSON"))?;

        let obj = value
            .as_object()
            .ok_or_else(|| ErrorObject::new(code::INVALID_REQUEST, "frame must be an object"))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => {
                return Err(ErrorObject::new(
                    code::INVALID_REQUEST,
                    "jsonrpc field must be \"2.0\"",
                ));
            }
        }

        let has_id = obj.contains_key("id") && !obj["id"].is_null();
        let has_method = obj.contains_key("method");

        match (has_id, has_method) {
            (true, true) => serde_json::from_value(value)
                .map(Self::Request)
                .map_err(|e| ErrorObject::new(code::INVALID_REQUEST, e.to_string())),
            (true, false) => serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| ErrorObject::new(code::INVALID_REQUEST, e.to_string())),
            (false, true) => serde_json::from_value(value)
                .map(Self::Notification)
                .map_err(|e| ErrorObject::new(code::INVALID_REQUEST, e.to_string())),
            (false, false) => Err(ErrorObject::new(
                code::INVALID_REQUEST,
                "frame has neither id nor method",
            )),
        }
    }

    /// Serialize to a single line with no embedded newlines.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let json = match self {
            Self::Request(r) => serde_json::to_string(r)?,
            Self::Notification(n) => serde_json::to_string(n)?,
            Self::Response(r) => serde_json::to_string(r)?,
        };
        debug_assert!(!json.contains('\n'));
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request() {
        let msg =
            Message::parse(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list","params":{}}"#).unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.id, RequestId::Number(7));
        assert_eq!(req.method, "tools/list");
    }

    #[test]
    fn parses_notification() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn parses_response_and_error_response() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":"a","result":{"tools":[]}}"#).unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::String("a".into()));
        assert!(resp.result.is_some());

        let msg = Message::parse(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(Message::parse("junk").is_err());
        assert!(Message::parse(r#"{"id":1,"method":"x"}"#).is_err());
        assert!(Message::parse(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).is_err());
        assert!(Message::parse(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn request_serializes_without_null_params() {
        let req = Request::new(1, "ping", None);
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains("params"));
    }

    #[test]
    fn to_line_is_single_line() {
        let msg = Message::Response(Response::ok(
            RequestId::Number(1),
            json!({"text": "two\nlines"}),
        ));
        assert!(!msg.to_line().unwrap().contains('\n'));
    }
}
