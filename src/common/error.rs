//! エラー型定義
//!
//! 統一エラー型（thiserror使用）

use axum::http::StatusCode;
use thiserror::Error;

/// Common layer error type
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Proxy layer error type
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Common layer error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// No available backend in the candidate set
    #[error("No available {0} backend")]
    NoBackendAvailable(&'static str),

    /// Upstream transport failure
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization error
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// TLS listener error
    #[error("TLS error: {0}")]
    Tls(String),
}

impl ProxyError {
    /// Returns a safe error message for external clients.
    ///
    /// The full error details stay in server logs; clients only ever see the
    /// generic phrase for the status class.
    pub fn external_message(&self) -> &'static str {
        match self {
            Self::Common(_) => "Internal Server Error",
            Self::NoBackendAvailable(_) => "Service Unavailable",
            Self::Upstream(_) => "Bad Gateway",
            Self::Authentication(_) => "Unauthorized",
            Self::Authorization(_) => "Forbidden",
            Self::Tls(_) => "Internal Server Error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Common(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias (Common)
pub type CommonResult<T> = Result<T, CommonError>;

/// Result type alias (Proxy)
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_error_display() {
        let error = CommonError::Config("test config error".to_string());
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_no_backend_available_maps_to_503() {
        let error = ProxyError::NoBackendAvailable("ollama");
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.to_string(), "No available ollama backend");
    }

    #[test]
    fn test_upstream_maps_to_502() {
        let error = ProxyError::Upstream("connection refused".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(error.external_message(), "Bad Gateway");
    }

    #[test]
    fn test_auth_errors_map_to_401_and_403() {
        assert_eq!(
            ProxyError::Authentication("missing header".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::Authorization("no group".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_external_message_hides_details() {
        let error = ProxyError::Upstream("10.0.0.5:11434 refused".to_string());
        assert!(!error.external_message().contains("10.0.0.5"));
    }
}
