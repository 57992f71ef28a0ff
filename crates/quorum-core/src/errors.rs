use std::time::Duration;

use crate::retry::{self, RetryVerdict};

/// Typed error hierarchy for calls to the model provider and other remote
/// dependencies.
///
/// Retry decisions never match on the variant: they go through
/// [`GatewayError::is_rate_limited`], which inspects the rendered message,
/// so errors that arrive as plain strings from other layers classify the
/// same way.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited (429): {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Rate-limit class, judged from the error text.
    pub fn is_rate_limited(&self) -> bool {
        retry::is_rate_limit_error(&self.to_string())
    }

    /// Server-suggested wait, from the structured hint or the error text.
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited {
            retry_after: Some(d),
            ..
        } = self
        {
            return Some(*d);
        }
        retry::suggested_retry_after(&self.to_string())
    }

    /// Retry decision for this error. Only rate-limit class errors retry.
    pub fn retry_verdict(&self) -> RetryVerdict {
        if self.is_rate_limited() {
            RetryVerdict::Retry {
                suggested: self.suggested_delay(),
            }
        } else {
            RetryVerdict::GiveUp
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    ///
    /// `retry_after` is the parsed `Retry-After` header, when present.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => {
                let retry_after = retry_after.or_else(|| retry::suggested_retry_after(&body));
                Self::RateLimited {
                    message: body,
                    retry_after,
                }
            }
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_variant_classifies_as_rate_limit() {
        let err = GatewayError::RateLimited {
            message: "slow down".into(),
            retry_after: None,
        };
        assert!(err.is_rate_limited());
    }

    #[test]
    fn throttling_text_inside_server_error_is_rate_limit() {
        let err = GatewayError::ServerError {
            status: 503,
            body: "Requests to this deployment are being throttled".into(),
        };
        assert!(err.is_rate_limited());
    }

    #[test]
    fn auth_and_invalid_are_not_rate_limits() {
        assert!(!GatewayError::AuthenticationFailed("bad key".into()).is_rate_limited());
        assert!(!GatewayError::InvalidRequest("bad".into()).is_rate_limited());
        assert!(!GatewayError::NetworkError("connection reset".into()).is_rate_limited());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            GatewayError::from_status(401, "unauthorized".into(), None),
            GatewayError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            GatewayError::from_status(400, "bad".into(), None),
            GatewayError::InvalidRequest(_)
        ));
        assert!(GatewayError::from_status(429, "slow down".into(), None).is_rate_limited());
        assert!(matches!(
            GatewayError::from_status(502, "bad gateway".into(), None),
            GatewayError::ServerError { status: 502, .. }
        ));
    }

    #[test]
    fn suggested_delay_prefers_header_then_body() {
        let header = GatewayError::from_status(
            429,
            "try again in 20 seconds".into(),
            Some(Duration::from_secs(3)),
        );
        assert_eq!(header.suggested_delay(), Some(Duration::from_secs(3)));

        let body = GatewayError::from_status(429, "Please retry after 20 seconds".into(), None);
        assert_eq!(body.suggested_delay(), Some(Duration::from_secs(20)));

        let none = GatewayError::ServerError {
            status: 500,
            body: "err".into(),
        };
        assert_eq!(none.suggested_delay(), None);
    }

    #[test]
    fn retry_verdict_carries_header_hint() {
        let err = GatewayError::from_status(429, "slow down".into(), Some(Duration::from_secs(4)));
        assert_eq!(
            err.retry_verdict(),
            RetryVerdict::Retry {
                suggested: Some(Duration::from_secs(4))
            }
        );
        assert_eq!(
            GatewayError::AuthenticationFailed("nope".into()).retry_verdict(),
            RetryVerdict::GiveUp
        );
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GatewayError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            GatewayError::RateLimited {
                message: String::new(),
                retry_after: None
            }
            .error_kind(),
            "rate_limited"
        );
    }
}
