//! JSON-RPC-like request/response envelope and machine error codes.

use serde::{Deserialize, Serialize};

/// Machine error codes carried on the RPC surface, one per kernel error
/// kind. The HTTP-style status is advisory for gateway mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    Conflict,
    InvalidArgument,
    Timeout,
    NotLeader,
    Integrity,
    Backend,
    Internal,
}

impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::Conflict => 409,
            ErrorCode::InvalidArgument => 400,
            ErrorCode::Timeout => 408,
            ErrorCode::NotLeader => 421,
            ErrorCode::Integrity => 500,
            ErrorCode::Backend => 503,
            ErrorCode::Internal => 500,
        }
    }

    /// Expected kinds are part of normal operation and never reach the
    /// error observer.
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound
                | ErrorCode::PermissionDenied
                | ErrorCode::Conflict
                | ErrorCode::Timeout
                | ErrorCode::NotLeader
        )
    }
}

/// One RPC call: method name plus a params object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Correlation id echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
            request_id: None,
        }
    }
}

/// Structured RPC error: machine code, human message, optional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Set for `NotLeader` so clients can redirect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_address: Option<String>,
    /// Current etag, set for `Conflict` so clients can re-read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_etag: Option<String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            leader_address: None,
            current_etag: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// RPC result: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RpcResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            request_id: None,
        }
    }

    pub fn err(error: RpcError) -> Self {
        Self {
            result: None,
            error: Some(error),
            request_id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::NotLeader.http_status(), 421);
        assert_eq!(ErrorCode::Backend.http_status(), 503);
        assert!(ErrorCode::Conflict.is_expected());
        assert!(!ErrorCode::Internal.is_expected());
        assert!(!ErrorCode::Integrity.is_expected());
    }

    #[test]
    fn envelope_serializes_compactly() {
        let resp = RpcResponse::err(
            RpcError::new(ErrorCode::NotFound, "no such file").with_path("/x"),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], "not_found");
        assert!(json.get("result").is_none());
        assert!(json["error"].get("leader_address").is_none());
    }
}
