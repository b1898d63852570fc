use bytes::Bytes;
use http::StatusCode;

use modelgate_translate::Dialect;

/// Canonical error kinds with stable string codes. The dispatcher is the
/// only place these become HTTP-visible shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKey,
    TokenDisabled,
    TokenExpired,
    TokenExhausted,
    IpNotAllowed,
    ModelNotPermitted,
    QuotaInsufficient,
    UnsupportedRequestFeature,
    BadRequest,
    NoProviderAvailable,
    RateLimited,
    UpstreamTimeout,
    Upstream5xx,
    UpstreamAuthFailed,
    ClientCancelled,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::TokenDisabled => "token_disabled",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenExhausted => "token_exhausted",
            ErrorKind::IpNotAllowed => "ip_not_allowed",
            ErrorKind::ModelNotPermitted => "model_not_permitted",
            ErrorKind::QuotaInsufficient => "quota_insufficient",
            ErrorKind::UnsupportedRequestFeature => "unsupported_request_feature",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NoProviderAvailable => "no_provider_available",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::UpstreamAuthFailed => "upstream_auth_failed",
            ErrorKind::ClientCancelled => "client_cancelled",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidKey => StatusCode::UNAUTHORIZED,
            ErrorKind::TokenDisabled
            | ErrorKind::TokenExpired
            | ErrorKind::TokenExhausted
            | ErrorKind::IpNotAllowed
            | ErrorKind::ModelNotPermitted
            | ErrorKind::QuotaInsufficient => StatusCode::FORBIDDEN,
            ErrorKind::UnsupportedRequestFeature | ErrorKind::BadRequest => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NoProviderAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamTimeout
            | ErrorKind::Upstream5xx
            | ErrorKind::UpstreamAuthFailed => StatusCode::BAD_GATEWAY,
            // Not client-visible; the log row uses nginx's convention.
            ErrorKind::ClientCancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }

    fn openai_type(&self) -> &'static str {
        match self.status().as_u16() {
            401 | 403 => "authentication_error",
            400 => "invalid_request_error",
            429 => "rate_limit_error",
            _ => "api_error",
        }
    }

    fn claude_type(&self) -> &'static str {
        match self.status().as_u16() {
            401 => "authentication_error",
            403 => "permission_error",
            400 => "invalid_request_error",
            429 => "rate_limit_error",
            503 | 502 => "api_error",
            _ => "api_error",
        }
    }

    fn gemini_status(&self) -> &'static str {
        match self.status().as_u16() {
            401 => "UNAUTHENTICATED",
            403 => "PERMISSION_DENIED",
            400 => "INVALID_ARGUMENT",
            429 => "RESOURCE_EXHAUSTED",
            503 => "UNAVAILABLE",
            _ => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.code().replace('_', " "),
        }
    }

    /// Serialize into the caller dialect's native error envelope.
    pub fn render(&self, dialect: Dialect) -> (StatusCode, Bytes) {
        let status = self.kind.status();
        let body = match dialect {
            Dialect::OpenAi => serde_json::to_vec(
                &modelgate_protocol::openai::error::ErrorEnvelope::new(
                    &self.message,
                    self.kind.openai_type(),
                    Some(self.kind.code().to_string()),
                ),
            ),
            Dialect::Claude => serde_json::to_vec(
                &modelgate_protocol::claude::error::ErrorEnvelope::new(
                    self.kind.claude_type(),
                    &self.message,
                ),
            ),
            Dialect::Gemini => serde_json::to_vec(
                &modelgate_protocol::gemini::error::ErrorEnvelope::new(
                    status.as_u16(),
                    self.kind.gemini_status(),
                    &self.message,
                ),
            ),
        };
        (status, Bytes::from(body.unwrap_or_default()))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Request outcome as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    AuthFailed,
    Upstream5xx,
    Timeout,
    ClientError,
}

impl Outcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success => None,
            Outcome::RateLimited => Some(ErrorKind::RateLimited),
            Outcome::AuthFailed => Some(ErrorKind::UpstreamAuthFailed),
            Outcome::Upstream5xx => Some(ErrorKind::Upstream5xx),
            Outcome::Timeout => Some(ErrorKind::UpstreamTimeout),
            Outcome::ClientError => Some(ErrorKind::BadRequest),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Outcome::RateLimited | Outcome::AuthFailed | Outcome::Upstream5xx | Outcome::Timeout
        )
    }
}
