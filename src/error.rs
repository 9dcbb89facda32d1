//! Error types for application lookup and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an application pool while resolving or waiting on an app
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No application is registered under this name
    #[error("unknown application: {0}")]
    UnknownApp(String),
    /// The application stopped or died before becoming ready
    #[error("application '{name}' failed to boot: {reason}")]
    BootFailed { name: String, reason: String },
    /// The application did not become ready in time
    #[error("application '{name}' did not become ready within {}s", .timeout.as_secs())]
    BootTimeout { name: String, timeout: Duration },
    /// Any other pool failure
    #[error("application pool unavailable: {0}")]
    Unavailable(String),
}

impl PoolError {
    /// The proxy error code this failure is reported as
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            PoolError::UnknownApp(_) => ProxyErrorCode::UnknownApplication,
            PoolError::BootFailed { .. } => ProxyErrorCode::BackendStartFailed,
            PoolError::BootTimeout { .. } => ProxyErrorCode::BackendTimeout,
            PoolError::Unavailable(_) => ProxyErrorCode::PoolFailure,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or invalid Host header in request
    MissingHostHeader,
    /// No application matched the host and no default app exists
    UnknownApplication,
    /// Application failed to boot
    BackendStartFailed,
    /// Timed out waiting for the application to boot
    BackendTimeout,
    /// The application pool reported a failure
    PoolFailure,
    /// Failed to connect to or exchange with the backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownApplication => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendStartFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::PoolFailure => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownApplication => "UNKNOWN_APPLICATION",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            ProxyErrorCode::PoolFailure => "POOL_FAILURE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::UnknownApplication.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::BackendTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_pool_error_maps_to_gateway_codes() {
        assert_eq!(
            PoolError::UnknownApp("default".into()).error_code(),
            ProxyErrorCode::UnknownApplication
        );
        assert_eq!(
            PoolError::BootTimeout {
                name: "blog".into(),
                timeout: Duration::from_secs(30)
            }
            .error_code(),
            ProxyErrorCode::BackendTimeout
        );
        assert_eq!(
            PoolError::BootFailed {
                name: "blog".into(),
                reason: "closed".into()
            }
            .error_code(),
            ProxyErrorCode::BackendStartFailed
        );
        assert_eq!(
            PoolError::Unavailable("registry locked".into()).error_code(),
            ProxyErrorCode::PoolFailure
        );
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::BootTimeout {
            name: "blog".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "application 'blog' did not become ready within 30s"
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownApplication, "No app for host");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_APPLICATION\""));
        assert!(json.contains("\"message\":\"No app for host\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::BackendTimeout, "App did not boot");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_TIMEOUT"
        );
    }
}
