use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kgw_protocol::{ApiInfo, ErrorResponse, Kernel, StartKernelRequest};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// Handle on a gateway's control plane. Cloning is cheap; every call is
/// bounded by the configured timeout and never retried.
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    config: Arc<GatewayConfig>,
}

impl GatewayClient {
    /// Builds a client without contacting the gateway.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {}", config.token()))
            .map_err(|e| GatewayError::Config(format!("invalid gateway token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let http = Client::builder().default_headers(headers).build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// Builds a client and probes `GET /api` before handing it out.
    pub async fn connect(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Self::new(config)?;
        let info = client.check_api().await?;
        tracing::info!(
            gateway = %client.config.base_url(),
            version = %info.version,
            "connected to kernel gateway"
        );
        Ok(client)
    }

    /// Same gateway, different per-call deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let config = (*self.config).clone().with_timeout(timeout);
        Self {
            http: self.http.clone(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn check_api(&self) -> Result<ApiInfo, GatewayError> {
        let url = self.endpoint(&["api"])?;
        self.bounded(async {
            let response = self.http.get(url).send().await?;
            let response = check_status(response, None).await?;
            decode(response).await
        })
        .await
    }

    pub async fn start_kernel(&self, runtime: &str) -> Result<Kernel, GatewayError> {
        if !self.config.is_known_runtime(runtime) {
            return Err(GatewayError::UnknownRuntime(runtime.to_string()));
        }
        let url = self.endpoint(&["api", "kernels"])?;
        let body = StartKernelRequest {
            name: runtime.to_string(),
        };
        let kernel: Kernel = self
            .bounded(async {
                let response = self.http.post(url).json(&body).send().await?;
                if response.status() != StatusCode::CREATED {
                    return Err(status_error(response).await);
                }
                decode(response).await
            })
            .await?;
        tracing::info!(kernel_id = %kernel.id, runtime, "kernel started");
        Ok(kernel)
    }

    pub async fn list_kernels(&self) -> Result<Vec<Kernel>, GatewayError> {
        let url = self.endpoint(&["api", "kernels"])?;
        self.bounded(async {
            let response = self.http.get(url).send().await?;
            let response = check_status(response, None).await?;
            decode(response).await
        })
        .await
    }

    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Kernel, GatewayError> {
        let url = self.endpoint(&["api", "kernels", kernel_id])?;
        self.bounded(async {
            let response = self.http.get(url).send().await?;
            let response = check_status(response, Some(kernel_id)).await?;
            decode(response).await
        })
        .await
    }

    pub async fn delete_kernel(&self, kernel_id: &str) -> Result<(), GatewayError> {
        let url = self.endpoint(&["api", "kernels", kernel_id])?;
        self.bounded(async {
            let response = self.http.delete(url).send().await?;
            check_status(response, Some(kernel_id)).await?;
            Ok::<_, GatewayError>(())
        })
        .await?;
        tracing::info!(kernel_id, "kernel deleted");
        Ok(())
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), GatewayError> {
        let url = self.endpoint(&["api", "kernels", kernel_id, "interrupt"])?;
        self.bounded(async {
            let response = self.http.post(url).send().await?;
            check_status(response, Some(kernel_id)).await?;
            Ok::<_, GatewayError>(())
        })
        .await
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<Kernel, GatewayError> {
        let url = self.endpoint(&["api", "kernels", kernel_id, "restart"])?;
        self.bounded(async {
            let response = self.http.post(url).send().await?;
            let response = check_status(response, Some(kernel_id)).await?;
            decode(response).await
        })
        .await
    }

    /// WebSocket endpoint for a kernel's message channels.
    pub fn channels_url(&self, kernel_id: &str) -> Result<Url, GatewayError> {
        let mut url = self.endpoint(&["api", "kernels", kernel_id, "channels"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| GatewayError::Config(format!("cannot derive websocket url from {url}")))?;
        Ok(url)
    }

    /// Value for the `Authorization` header on channel connections.
    pub fn authorization(&self) -> String {
        format!("token {}", self.config.token())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let base = self.config.base_url();
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Config(format!("gateway url '{base}' cannot be a base")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let limit = self.config.timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| GatewayError::Timeout(limit))?
    }
}

impl fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayClient")
            .field("config", &self.config)
            .finish()
    }
}

async fn check_status(
    response: Response,
    kernel_id: Option<&str>,
) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = kernel_id {
            return Err(GatewayError::NotFound(id.to_string()));
        }
    }
    Err(status_error(response).await)
}

async fn status_error(response: Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    build_status_error(status, &body)
}

fn build_status_error(status: u16, body_text: &str) -> GatewayError {
    let parsed = serde_json::from_str::<ErrorResponse>(body_text).ok();
    let reason = parsed
        .as_ref()
        .and_then(|body| body.reason.clone())
        .filter(|reason| !reason.is_empty());
    let message = parsed
        .and_then(|body| body.message)
        .filter(|message| !message.is_empty())
        .or_else(|| reason.clone())
        .unwrap_or_else(|| body_text.trim().to_string());
    let message = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    };
    GatewayError::Status {
        status,
        reason,
        message,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}
