//! Error record delivered to user-visible callbacks.
//!
//! Every failed operation resolves to a [`CloudError`]: a numeric code drawn
//! from the HTTP status space (plus library-internal sentinels below zero)
//! and a human-readable description.

use thiserror::Error;

/// Error codes. Positive values are HTTP statuses as reported by the remote;
/// negative values are library sentinels that never came off the wire.
pub mod code {
    /// The operation was cancelled by the user.
    pub const ABORTED: i32 = -1;
    /// Transport breakdown or malformed response body.
    pub const FAILURE: i32 = -2;
    /// A directory removal was refused because it still has children.
    pub const NOT_EMPTY: i32 = -3;

    pub const BAD_REQUEST: i32 = 400;
    pub const UNAUTHORIZED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const NOT_FOUND: i32 = 404;
    pub const RANGE_INVALID: i32 = 416;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

/// Outcome of a failed cloud operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[{code}] {description}")]
pub struct CloudError {
    /// HTTP status or library sentinel (see [`code`]).
    pub code: i32,
    /// Human-readable description; for HTTP failures this carries the error
    /// body returned by the remote.
    pub description: String,
}

/// Result alias used throughout the workspace.
pub type CloudResult<T> = Result<T, CloudError>;

impl CloudError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// The operation was cancelled.
    pub fn aborted() -> Self {
        Self::new(code::ABORTED, "aborted")
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self::new(code::FAILURE, description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(code::NOT_FOUND, description)
    }

    pub fn invalid_range(description: impl Into<String>) -> Self {
        Self::new(code::RANGE_INVALID, description)
    }

    pub fn unauthorized(description: impl Into<String>) -> Self {
        Self::new(code::UNAUTHORIZED, description)
    }

    pub fn service_unavailable(description: impl Into<String>) -> Self {
        Self::new(code::SERVICE_UNAVAILABLE, description)
    }

    pub fn not_empty(description: impl Into<String>) -> Self {
        Self::new(code::NOT_EMPTY, description)
    }

    /// Builds an error from an HTTP status code and the captured error body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self::new(i32::from(status), body)
    }

    pub fn is_aborted(&self) -> bool {
        self.code == code::ABORTED
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::failure(format!("malformed response: {err}"))
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        CloudError::failure(err.to_string())
    }
}
