use http::StatusCode;

/// Failure modes of one proxied request or relay session.
///
/// `BlockedIp` deliberately shares its client-visible status and body with
/// `UpstreamUnreachable`: a caller probing for internal hosts must not be
/// able to tell a blocked address from a dead one. Server-side logs keep
/// the distinction.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no target url supplied")]
    MissingTarget,
    #[error("invalid target url")]
    InvalidUrl,
    #[error("scheme not allowed")]
    BlockedScheme,
    #[error("target resolves only to non-routable addresses")]
    BlockedIp,
    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(usize),
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("websocket policy violation")]
    WebSocketPolicyViolation,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingTarget | ProxyError::InvalidUrl | ProxyError::BlockedScheme => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BlockedIp
            | ProxyError::TooManyRedirects(_)
            | ProxyError::UpstreamUnreachable(_)
            | ProxyError::WebSocketPolicyViolation => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short plain-text body sent to the client. Never includes upstream
    /// error detail or anything that would distinguish a blocked address
    /// from an unreachable one.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::MissingTarget => "no target url supplied",
            ProxyError::InvalidUrl => "invalid target url",
            ProxyError::BlockedScheme => "scheme not allowed",
            ProxyError::BlockedIp
            | ProxyError::TooManyRedirects(_)
            | ProxyError::UpstreamUnreachable(_) => "upstream fetch failed",
            ProxyError::UpstreamTimeout => "upstream timed out",
            ProxyError::WebSocketPolicyViolation => "websocket target not allowed",
        }
    }
}
