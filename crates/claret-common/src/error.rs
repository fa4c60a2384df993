use serde::Serialize;

/// Request-level failure taxonomy.
///
/// Every variant maps to a stable machine code and an HTTP status. Errors
/// raised before any stream byte reaches the client become a JSON response
/// of [`ErrorBody`]; errors raised mid-stream become an SSE `error` event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("no account available for model {0}")]
    NoAccountAvailable(String),
    #[error("conversation is already serving a request")]
    SessionBusy,
    #[error("account has no free conversation slots")]
    SessionExhausted { retry_after: u64 },
    #[error("upstream quota exhausted")]
    UpstreamQuota { retry_after: Option<u64> },
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream failure: {0}")]
    UpstreamFatal(String),
    #[error("oauth exchange failed: {0}")]
    OAuthExchangeFailed(String),
    #[error("oauth refresh failed: {0}")]
    OAuthRefreshFailed(String),
    #[error("stream interrupted: {0}")]
    StreamCut(String),
    #[error("unknown or expired tool_use id: {0}")]
    UnknownToolCall(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "request_invalid",
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::NoAccountAvailable(_) => "no_account_available",
            ProxyError::SessionBusy => "session_busy",
            ProxyError::SessionExhausted { .. } => "session_exhausted",
            ProxyError::UpstreamQuota { .. } => "upstream_quota",
            ProxyError::UpstreamTransient(_) => "upstream_transient",
            ProxyError::UpstreamFatal(_) => "upstream_fatal",
            ProxyError::OAuthExchangeFailed(_) => "oauth_exchange_failed",
            ProxyError::OAuthRefreshFailed(_) => "oauth_refresh_failed",
            ProxyError::StreamCut(_) => "stream_cut",
            ProxyError::UnknownToolCall(_) => "unknown_tool_call",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::UnknownToolCall(_) => 400,
            ProxyError::Unauthorized => 401,
            ProxyError::SessionBusy => 409,
            ProxyError::SessionExhausted { .. } | ProxyError::UpstreamQuota { .. } => 429,
            ProxyError::NoAccountAvailable(_) => 503,
            ProxyError::UpstreamTransient(_)
            | ProxyError::UpstreamFatal(_)
            | ProxyError::OAuthExchangeFailed(_)
            | ProxyError::OAuthRefreshFailed(_)
            | ProxyError::StreamCut(_) => 502,
            ProxyError::Internal(_) => 500,
        }
    }

    /// Retry-After seconds for 429 responses, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProxyError::SessionExhausted { retry_after } => Some(*retry_after),
            ProxyError::UpstreamQuota { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            detail: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub detail: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ProxyError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(ProxyError::Unauthorized.status(), 401);
        assert_eq!(ProxyError::SessionBusy.status(), 409);
        assert_eq!(
            ProxyError::SessionExhausted { retry_after: 5 }.status(),
            429
        );
        assert_eq!(ProxyError::NoAccountAvailable("m".into()).status(), 503);
        assert_eq!(ProxyError::UpstreamTransient("x".into()).status(), 502);
        assert_eq!(ProxyError::UnknownToolCall("toolu_x".into()).status(), 400);
    }

    #[test]
    fn body_carries_code_and_message() {
        let err = ProxyError::UnknownToolCall("toolu_abc".into());
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["detail"]["code"], "unknown_tool_call");
        assert!(
            body["detail"]["message"]
                .as_str()
                .unwrap()
                .contains("toolu_abc")
        );
    }
}
