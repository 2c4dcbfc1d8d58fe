//! Unary replies.
//!
//! Streaming calls are answered with [`ServerMessage::Data`](super::ServerMessage)
//! frames instead; a `Response` only carries the single JSON value of a
//! runtime or image query.

use serde::{Deserialize, Serialize};

use super::error::{NodectlError, Result};
use super::RequestId;

/// JSON value produced by a unary call.
pub type RpcResult = serde_json::Value;

/// Reply to a unary call.
///
/// Exactly one of `result` and `error` is set, matching `success`.
///
/// ```
/// use nodectl_common::protocol::Response;
/// use serde_json::json;
///
/// let ok = Response::ok(7, json!({"version": "1.7.0"}));
/// assert_eq!(ok.into_result().unwrap()["version"], "1.7.0");
///
/// let failed = Response::failed(7, "runtime not ready");
/// assert!(failed.into_result().is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: RequestId, result: RpcResult) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }

    /// A failed reply becomes [`NodectlError::Remote`]; a successful one
    /// without a value is malformed.
    pub fn into_result(self) -> Result<RpcResult> {
        match (self.success, self.result, self.error) {
            (true, Some(result), _) => Ok(result),
            (true, None, _) => Err(NodectlError::InvalidResponse(format!(
                "reply to call {} has no result",
                self.id
            ))),
            (false, _, error) => Err(NodectlError::Remote(
                error.unwrap_or_else(|| "unknown agent error".to_string()),
            )),
        }
    }
}
