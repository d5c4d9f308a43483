use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::GatewayError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUNTIMES: &[&str] = &["python3", "tfenv"];

/// Connection settings for a gateway. Validated on construction, so a
/// `GatewayConfig` always names an http(s) endpoint and a non-empty token.
#[derive(Clone)]
pub struct GatewayConfig {
    base_url: Url,
    token: String,
    pub timeout: Duration,
    /// Runtime names `start_kernel` accepts.
    pub known_runtimes: Vec<String>,
}

impl GatewayConfig {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, GatewayError> {
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return Err(GatewayError::Config("gateway url must not be empty".into()));
        }
        let token = token.into();
        if token.trim().is_empty() {
            return Err(GatewayError::Config("gateway token must not be empty".into()));
        }
        let base_url = Url::parse(base_url)
            .map_err(|e| GatewayError::Config(format!("invalid gateway url '{base_url}': {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(GatewayError::Config(format!(
                "gateway url scheme must be http or https, got '{}'",
                base_url.scheme()
            )));
        }
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Config(format!(
                "gateway url '{base_url}' cannot be a base"
            )));
        }
        Ok(Self {
            base_url,
            token,
            timeout: DEFAULT_TIMEOUT,
            known_runtimes: DEFAULT_RUNTIMES.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_known_runtimes<I, S>(mut self, runtimes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_runtimes = runtimes.into_iter().map(Into::into).collect();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_known_runtime(&self, runtime: &str) -> bool {
        self.known_runtimes.iter().any(|known| known == runtime)
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("known_runtimes", &self.known_runtimes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_parts() {
        assert!(matches!(
            GatewayConfig::new("", "tok"),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::new("http://localhost:8888", "  "),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::new("ftp://localhost:8888", "tok"),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::new("not a url", "tok"),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn defaults_and_debug_redaction() {
        let config = GatewayConfig::new("https://gw.example:8888/base/", "secret").unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.is_known_runtime("python3"));
        assert!(config.is_known_runtime("tfenv"));
        assert!(!config.is_known_runtime("ruby"));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
    }
}
