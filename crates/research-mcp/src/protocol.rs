//! JSON-RPC 2.0 wire types shared by both transports.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// A notification carries no id and must not receive a response.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    /// JSON-RPC version constant.
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: Cow::Borrowed(Self::VERSION), result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }

    /// Error response carrying a typed `data.kind`.
    #[must_use]
    pub fn error_kind(
        id: Option<serde_json::Value>,
        kind: ErrorKind,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        let mut payload = data.unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = payload.as_object_mut() {
            map.insert("kind".to_owned(), serde_json::Value::String(kind.as_str().to_owned()));
        }
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code: kind.code(), message: message.into(), data: Some(payload) }),
            id,
        }
    }
}

/// A parsed request body: a single message or a non-empty batch.
#[derive(Debug, Clone)]
pub enum IncomingBody {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

/// Failure to interpret a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Body was not valid JSON.
    Parse,
    /// Body was JSON but not a JSON-RPC request or batch.
    InvalidRequest,
    /// Body was the empty batch `[]`.
    EmptyBatch,
}

impl BodyError {
    /// Render as a JSON-RPC error response with a null id.
    #[must_use]
    pub fn to_response(&self) -> JsonRpcResponse {
        match self {
            Self::Parse => JsonRpcResponse::error_kind(None, ErrorKind::ParseError, "Parse error", None),
            Self::InvalidRequest => {
                JsonRpcResponse::error_kind(None, ErrorKind::InvalidRequest, "Invalid Request", None)
            }
            Self::EmptyBatch => JsonRpcResponse::error(None, -32600, "Invalid Request: Empty batch"),
        }
    }
}

/// Interpret a raw JSON value as a message or batch.
///
/// The empty batch is invalid per JSON-RPC 2.0 and is reported distinctly so
/// transports can produce the exact mandated response body.
pub fn parse_body(value: serde_json::Value) -> Result<IncomingBody, BodyError> {
    match value {
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                return Err(BodyError::EmptyBatch);
            }
            let mut requests = Vec::with_capacity(items.len());
            for item in items {
                let req: JsonRpcRequest =
                    serde_json::from_value(item).map_err(|_| BodyError::InvalidRequest)?;
                if req.jsonrpc != "2.0" {
                    return Err(BodyError::InvalidRequest);
                }
                requests.push(req);
            }
            Ok(IncomingBody::Batch(requests))
        }
        serde_json::Value::Object(_) => {
            let req: JsonRpcRequest =
                serde_json::from_value(value).map_err(|_| BodyError::InvalidRequest)?;
            if req.jsonrpc != "2.0" {
                return Err(BodyError::InvalidRequest);
            }
            Ok(IncomingBody::Single(req))
        }
        _ => Err(BodyError::InvalidRequest),
    }
}

/// Parse a raw byte/string payload into a body, distinguishing parse errors.
pub fn parse_text(text: &str) -> Result<IncomingBody, BodyError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|_| BodyError::Parse)?;
    parse_body(value)
}
