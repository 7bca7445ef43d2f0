//! Error types for the control plane and JSON error responses for the admin API

use crate::model::ProxyStatus;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures of the storage layer itself
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode a stored value: {0}")]
    Codec(#[from] serde_json::Error),

    /// An optimistic transaction kept conflicting past the retry limit
    #[error("transaction on '{key}' still conflicting after {attempts} attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    #[error("failed to prepare store location: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking task running a store call panicked or was cancelled
    #[error("store task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Error)]
pub enum SeatError {
    #[error("seat '{seat_id}' already exists in pool '{pool_id}'")]
    DuplicateSeat { pool_id: String, seat_id: String },

    #[error("seat '{seat_id}' is not known in pool '{pool_id}'")]
    UnknownSeat { pool_id: String, seat_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegate proxy '{0}' already exists")]
    Duplicate(String),

    #[error("delegate proxy '{0}' is not known")]
    Unknown(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port left in range {from}-{to}")]
    Exhausted { from: u16, to: u16 },

    #[error("invalid port range {from}-{to}")]
    InvalidRange { from: u16, to: u16 },

    #[error("port {port} is already owned by '{owner}'")]
    AlreadyOwned { port: u16, owner: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures reported by a container backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to start proxy '{proxy_id}': {reason}")]
    StartFailed { proxy_id: String, reason: String },

    #[error("failed to stop proxy '{proxy_id}': {reason}")]
    StopFailed { proxy_id: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy '{0}' not found")]
    NotFound(String),

    #[error("proxy '{0}' already exists")]
    Duplicate(String),

    #[error("no spec configured with id '{0}'")]
    UnknownSpec(String),

    #[error("proxy '{proxy_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        proxy_id: String,
        from: ProxyStatus,
        to: ProxyStatus,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("spec '{0}' is not pooled")]
    NotPooled(String),

    /// A seat was claimed that no delegate proxy accounts for
    #[error("seat '{seat_id}' in pool '{pool_id}' has no delegate proxy")]
    OrphanSeat { pool_id: String, seat_id: String },

    #[error(transparent)]
    Seat(#[from] SeatError),

    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error codes returned by the admin API
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No route for the path
    NotFound,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Store or service failure
    InternalError,
}

impl AdminErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminErrorCode::NotFound => StatusCode::NOT_FOUND,
            AdminErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AdminErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Fleetgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AdminErrorCode::Unauthorized => "UNAUTHORIZED",
            AdminErrorCode::NotFound => "NOT_FOUND",
            AdminErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            AdminErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: AdminErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AdminErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a JSON error response carrying the X-Fleetgate-Error header
pub fn json_error_response(code: AdminErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Fleetgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            AdminErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AdminErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AdminErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(AdminErrorCode::NotFound, "no route for /nope");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"no route for /nope\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(AdminErrorCode::Unauthorized, "missing token");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("X-Fleetgate-Error").unwrap(),
            "UNAUTHORIZED"
        );
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ProxyError::InvalidTransition {
            proxy_id: "p1".to_string(),
            from: ProxyStatus::Stopped,
            to: ProxyStatus::Up,
        };
        assert_eq!(err.to_string(), "proxy 'p1' cannot move from stopped to up");
    }
}
