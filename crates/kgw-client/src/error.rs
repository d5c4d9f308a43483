use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown runtime '{0}'")]
    UnknownRuntime(String),
    #[error("kernel '{0}' not found")]
    NotFound(String),
    #[error("gateway returned {status}: {message}")]
    Status {
        status: u16,
        reason: Option<String>,
        message: String,
    },
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid gateway response: {0}")]
    Decode(String),
    #[error("invalid gateway configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Failures that come from talking to the gateway rather than from the
    /// request itself. The culler treats these as a reason to reconnect.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Status { .. }
                | GatewayError::Transport(_)
                | GatewayError::Timeout(_)
                | GatewayError::Decode(_)
        )
    }
}
