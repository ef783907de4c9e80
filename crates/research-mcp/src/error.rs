//! Error types for the research MCP server.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! Every error that reaches a client is classified into an [`ErrorKind`] that maps to a
//! JSON-RPC error code and a typed `data.kind` field on the wire.

use std::time::Duration;

/// Wire-level error classification surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    /// Body was not valid JSON.
    ParseError,
    /// Not JSON-RPC 2.0 or empty batch.
    InvalidRequest,
    /// Unknown tool or method.
    MethodNotFound,
    /// Input schema violation.
    InvalidParams,
    /// Missing bearer token.
    AuthMissing,
    /// Signature, claims, or decode failure.
    AuthInvalid,
    /// Token expired.
    AuthExpired,
    /// Token lacks a required scope.
    InsufficientScope,
    /// Over rate-limit quota.
    RateLimited,
    /// No or expired session.
    SessionUnknown,
    /// SSRF policy violation.
    UrlRejected,
    /// Tool deadline exceeded.
    UpstreamTimeout,
    /// 5xx or transport error from an external dependency.
    UpstreamFailure,
    /// Dependency temporarily isolated by the circuit breaker.
    CircuitOpen,
    /// Partial results returned from a composite tool.
    Degraded,
    /// Unhandled failure.
    InternalError,
}

impl ErrorKind {
    /// JSON-RPC error code for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::SessionUnknown => -32000,
            Self::AuthMissing | Self::AuthInvalid | Self::AuthExpired => -32001,
            Self::InsufficientScope => -32002,
            Self::RateLimited => -32003,
            Self::UrlRejected => -32004,
            Self::UpstreamTimeout => -32005,
            Self::UpstreamFailure => -32006,
            Self::CircuitOpen => -32007,
            Self::Degraded => -32008,
        }
    }

    /// Whether a client retry can succeed without changing the request.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::UpstreamTimeout
                | Self::UpstreamFailure
                | Self::CircuitOpen
        )
    }

    /// Parse the stable string form back into a kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ParseError" => Some(Self::ParseError),
            "InvalidRequest" => Some(Self::InvalidRequest),
            "MethodNotFound" => Some(Self::MethodNotFound),
            "InvalidParams" => Some(Self::InvalidParams),
            "AuthMissing" => Some(Self::AuthMissing),
            "AuthInvalid" => Some(Self::AuthInvalid),
            "AuthExpired" => Some(Self::AuthExpired),
            "InsufficientScope" => Some(Self::InsufficientScope),
            "RateLimited" => Some(Self::RateLimited),
            "SessionUnknown" => Some(Self::SessionUnknown),
            "UrlRejected" => Some(Self::UrlRejected),
            "UpstreamTimeout" => Some(Self::UpstreamTimeout),
            "UpstreamFailure" => Some(Self::UpstreamFailure),
            "CircuitOpen" => Some(Self::CircuitOpen),
            "Degraded" => Some(Self::Degraded),
            "InternalError" => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Stable string form used in `error.data.kind`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams => "InvalidParams",
            Self::AuthMissing => "AuthMissing",
            Self::AuthInvalid => "AuthInvalid",
            Self::AuthExpired => "AuthExpired",
            Self::InsufficientScope => "InsufficientScope",
            Self::RateLimited => "RateLimited",
            Self::SessionUnknown => "SessionUnknown",
            Self::UrlRejected => "UrlRejected",
            Self::UpstreamTimeout => "UpstreamTimeout",
            Self::UpstreamFailure => "UpstreamFailure",
            Self::CircuitOpen => "CircuitOpen",
            Self::Degraded => "Degraded",
            Self::InternalError => "InternalError",
        }
    }
}

/// YouTube transcript extraction failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptErrorKind {
    TranscriptDisabled,
    VideoUnavailable,
    VideoNotFound,
    NetworkError,
    RateLimited,
    Timeout,
    ParsingError,
    RegionBlocked,
    PrivateVideo,
    Unknown,
}

/// Errors from the outbound fetch layer (search API, page fetches).
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Rate limited by the upstream API (429 response)
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait time before retry
        retry_after: Duration,
    },

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// JSON parsing error
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Server error (5xx response)
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Unexpected HTTP status
    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },
}

impl FetchError {
    /// Create a rate limited error with retry-after duration.
    #[must_use]
    pub fn rate_limited(seconds: u64) -> Self {
        Self::RateLimited { retry_after: Duration::from_secs(seconds) }
    }

    /// Create a server error.
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server { status, message: message.into() }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout(_) | Self::Server { .. })
    }
}

/// Errors from MCP tool execution.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    /// Error from the outbound fetch layer
    #[error("Upstream error: {0}")]
    Fetch(#[from] FetchError),

    /// Input validation failed
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Validation error message
        message: String,
    },

    /// Outbound URL rejected by the SSRF policy
    #[error("URL rejected by policy rule '{rule}': {url}")]
    UrlRejected {
        /// The offending URL
        url: String,
        /// The policy rule that matched
        rule: String,
    },

    /// Tool deadline exceeded
    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),

    /// Dependency isolated by the circuit breaker
    #[error("Circuit open for '{dependency}', retry after {retry_after:?}")]
    CircuitOpen {
        /// Dependency name
        dependency: String,
        /// Remaining cooldown
        retry_after: Duration,
    },

    /// Transcript extraction failed with a typed kind
    #[error("Transcript error ({kind:?}): {message}")]
    Transcript {
        /// Failure classification
        kind: TranscriptErrorKind,
        /// Human-readable detail
        message: String,
    },

    /// Every source of a composite call failed
    #[error("all sources failed: {0}")]
    CompositeFailed(String),

    /// Failure observed by a single-flight awaiter; carries the original classification
    #[error("{message}")]
    Coalesced {
        /// Classification of the original failure
        kind: ErrorKind,
        /// Original error message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal tool logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Create a URL rejection error.
    #[must_use]
    pub fn url_rejected(url: impl Into<String>, rule: impl Into<String>) -> Self {
        Self::UrlRejected { url: url.into(), rule: rule.into() }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classify into the wire-level error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::InvalidParams,
            Self::UrlRejected { .. } => ErrorKind::UrlRejected,
            Self::Timeout(_) => ErrorKind::UpstreamTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Fetch(FetchError::RateLimited { .. }) => ErrorKind::RateLimited,
            Self::Fetch(FetchError::Timeout(_)) => ErrorKind::UpstreamTimeout,
            Self::Fetch(_) | Self::Transcript { .. } | Self::CompositeFailed(_) => {
                ErrorKind::UpstreamFailure
            }
            Self::Coalesced { kind, .. } => *kind,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Convert to a user-friendly error message for the MCP response.
    #[must_use]
    pub fn to_user_message(&self) -> String {
        match self {
            Self::Fetch(FetchError::RateLimited { retry_after }) => {
                format!("Rate limited by upstream service. Please wait {retry_after:?} before retrying.")
            }
            Self::Validation { field, message } => {
                format!("Invalid input for '{field}': {message}")
            }
            Self::UrlRejected { url, rule } => {
                format!("Refusing to fetch '{url}': blocked by policy rule '{rule}'")
            }
            _ => self.to_string(),
        }
    }
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type alias for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;
