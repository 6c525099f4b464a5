//! Error taxonomy and plain-text failure responses for the gateway

use crate::handler::{full_body, GatewayBody};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::io;

/// Setup-time configuration problems
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("multiple registrations for {0}")]
    DuplicateRoute(String),

    #[error("invalid route pattern {0:?}")]
    InvalidPattern(String),

    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid upstream URL {url:?}: {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("key file error: no private key found in {0}")]
    NoPrivateKey(String),

    #[error("key file error: no pass phrase given for encrypted key {0}")]
    MissingPassphrase(String),

    #[error("key file error: pass phrase given for unencrypted key {0}")]
    UnexpectedPassphrase(String),

    #[error("key file error: {0} uses legacy PEM encryption, convert it to encrypted PKCS#8")]
    LegacyEncryptedKey(String),

    #[error("key file error: {path}: {reason}")]
    KeyDecrypt { path: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Per-request backend failures, never fatal to the process
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend {addr} unavailable: {source}")]
    Unavailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("backend pool '{0}' is shut down")]
    PoolClosed(String),

    #[error("malformed FastCGI response: {0}")]
    Protocol(String),

    #[error("backend i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl BackendError {
    /// Failures that are expected under load or shutdown and are not worth logging
    pub fn is_quiet(&self) -> bool {
        match self {
            BackendError::Unavailable { .. } | BackendError::PoolClosed(_) => true,
            BackendError::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Listener lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("listener {0} has already been opened")]
    AlreadyOpened(String),
}

/// Error classes surfaced to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Malformed request target
    BadRequest,
    /// No route matched
    NotFound,
    /// FastCGI backend failed or no backend available
    BackendFailed,
    /// Proxy upstream failed
    UpstreamFailed,
    /// Unexpected fault while handling the request
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BackendFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::BackendFailed => "BACKEND_FAILED",
            GatewayErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Body text such as `500: Internal Server Error`, with `detail` on a second line
pub fn error_body(code: GatewayErrorCode, detail: Option<&str>) -> String {
    let status = code.status_code();
    let mut body = format!(
        "{}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    if let Some(detail) = detail {
        body.push('\n');
        body.push_str(detail);
    }
    body
}

/// Create a plain-text error response with X-Gateway-Error header
pub fn error_response(code: GatewayErrorCode, detail: Option<&str>) -> Response<GatewayBody> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(Bytes::from(error_body(code, detail))))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(GatewayErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayErrorCode::BackendFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayErrorCode::UpstreamFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_body() {
        assert_eq!(
            error_body(GatewayErrorCode::InternalError, None),
            "500: Internal Server Error"
        );
        assert_eq!(
            error_body(GatewayErrorCode::BackendFailed, Some("connection refused")),
            "500: Internal Server Error\nconnection refused"
        );
        assert_eq!(error_body(GatewayErrorCode::NotFound, None), "404: Not Found");
    }

    #[test]
    fn test_error_response_headers() {
        let response = error_response(GatewayErrorCode::UpstreamFailed, None);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "UPSTREAM_FAILED"
        );
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_quiet_backend_errors() {
        let refused = BackendError::Unavailable {
            addr: "127.0.0.1:9000".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_quiet());
        assert!(BackendError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)).is_quiet());
        assert!(!BackendError::Protocol("bad record".to_string()).is_quiet());
    }
}
