//! JSON-RPC 2.0 framing for the appliance middleware socket.
//!
//! The appliance speaks JSON-RPC 2.0 over a WebSocket, with one historical
//! quirk: error objects arrive in either the middleware's structured shape
//! (`{error, errname, reason, type}`) or the standard JSON-RPC shape
//! (`{code, message, data}`). Both are decoded through a single [`RpcError`]
//! so callers never branch on the wire dialect.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every outbound frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// An outbound JSON-RPC request frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: String,
    pub jsonrpc: &'static str,
    pub method: String,
    /// Positional parameters; omitted from the frame entirely when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
}

impl Request {
    pub fn new(id: String, method: &str, params: Option<Vec<Value>>) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// An inbound JSON-RPC response frame.
///
/// Exactly one of `result` and `error` is populated on a well-formed frame.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// An appliance-reported error in either historical wire shape.
///
/// All fields are optional so one struct decodes both dialects; the
/// [`Display`] impl picks the shape that was actually populated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcError {
    /// Structured shape: numeric errno.
    #[serde(default)]
    pub error: Option<i64>,
    /// Structured shape: symbolic errno name (`ENOENT`, `EEXIST`, ...).
    #[serde(default)]
    pub errname: Option<String>,
    /// Structured shape: human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Structured shape: error class name.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Standard shape: JSON-RPC error code.
    #[serde(default)]
    pub code: Option<i64>,
    /// Standard shape: message text.
    #[serde(default)]
    pub message: Option<String>,
    /// Standard shape: optional attached data.
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    /// Whether this error names the given symbolic errno.
    pub fn is_errno(&self, name: &str) -> bool {
        self.errname.as_deref() == Some(name)
            || self
                .reason
                .as_deref()
                .is_some_and(|r| r.starts_with(&format!("[{}]", name)))
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason.as_deref() {
            Some(reason) if !reason.is_empty() => {
                write!(f, "{}: {}", self.errname.as_deref().unwrap_or(""), reason)
            }
            _ => {
                let code = self.code.or(self.error).unwrap_or(0);
                write!(f, "{}: {}", code, self.message.as_deref().unwrap_or(""))?;
                if let Some(data) = &self.data {
                    if let Ok(encoded) = serde_json::to_string(data) {
                        write!(f, " ({})", encoded)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_without_params() {
        let request = Request::new("1".to_string(), "pool.query", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "pool.query");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_request_serializes_positional_params() {
        let request = Request::new(
            "42".to_string(),
            "auth.login_with_api_key",
            Some(vec![Value::String("secret".to_string())]),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["params"], serde_json::json!(["secret"]));
    }

    #[test]
    fn test_response_with_result() {
        let response: Response =
            serde_json::from_str(r#"{"id": "7", "jsonrpc": "2.0", "result": true}"#).unwrap();
        assert_eq!(response.id.as_deref(), Some("7"));
        assert_eq!(response.result, Some(Value::Bool(true)));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let response: Response = serde_json::from_str(
            r#"{"id": "7", "result": 1, "msg": "method", "extra": {"a": 1}}"#,
        )
        .unwrap();
        assert_eq!(response.id.as_deref(), Some("7"));
    }

    #[test]
    fn test_structured_error_display() {
        let response: Response = serde_json::from_str(
            r#"{"id": "3", "error": {"error": 2, "errname": "ENOENT", "reason": "dataset does not exist", "type": "CallError"}}"#,
        )
        .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.to_string(), "ENOENT: dataset does not exist");
        assert!(error.is_errno("ENOENT"));
    }

    #[test]
    fn test_standard_error_display() {
        let error: RpcError =
            serde_json::from_str(r#"{"code": -32601, "message": "Method not found"}"#).unwrap();
        assert_eq!(error.to_string(), "-32601: Method not found");
    }

    #[test]
    fn test_standard_error_display_with_data() {
        let error: RpcError = serde_json::from_str(
            r#"{"code": -32000, "message": "Server error", "data": {"trace": "short"}}"#,
        )
        .unwrap();
        assert_eq!(
            error.to_string(),
            r#"-32000: Server error ({"trace":"short"})"#
        );
    }

    #[test]
    fn test_structured_error_empty_reason_falls_back() {
        let error: RpcError = serde_json::from_str(
            r#"{"errname": "EINVAL", "reason": "", "code": 22, "message": "invalid"}"#,
        )
        .unwrap();
        assert_eq!(error.to_string(), "22: invalid");
    }

    #[test]
    fn test_errno_detection_from_reason_prefix() {
        let error: RpcError =
            serde_json::from_str(r#"{"reason": "[EEXIST] dataset already exists"}"#).unwrap();
        assert!(error.is_errno("EEXIST"));
        assert!(!error.is_errno("ENOENT"));
    }
}
