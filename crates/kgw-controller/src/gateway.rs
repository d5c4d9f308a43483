use std::sync::{Arc, PoisonError, RwLock};

use kgw_client::{GatewayClient, GatewayConfig, GatewayError};

/// Process-wide handle on the current gateway client.
///
/// Readers take a snapshot with [`SharedGateway::client`] once per operation.
/// [`SharedGateway::reconnect`] is the only way the handle changes; it swaps
/// in a freshly probed client and leaves in-flight operations on the old one.
#[derive(Debug)]
pub struct SharedGateway {
    current: RwLock<Arc<GatewayClient>>,
    config: GatewayConfig,
}

impl SharedGateway {
    pub fn new(client: GatewayClient) -> Self {
        let config = client.config().clone();
        Self {
            current: RwLock::new(Arc::new(client)),
            config,
        }
    }

    pub fn client(&self) -> Arc<GatewayClient> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn reconnect(&self) -> Result<Arc<GatewayClient>, GatewayError> {
        let fresh = Arc::new(GatewayClient::connect(self.config.clone()).await?);
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        tracing::info!(gateway = %self.config.base_url(), "gateway client replaced");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgw_client::testing::MockGateway;

    #[tokio::test]
    async fn reconnect_swaps_the_handle() {
        let gateway = MockGateway::start().await.unwrap();
        let shared = SharedGateway::new(gateway.client().unwrap());
        let before = shared.client();

        let after = shared.reconnect().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &shared.client()));
        assert_eq!(gateway.calls_to("GET /api"), 1);
    }

    #[tokio::test]
    async fn failed_reconnect_keeps_the_old_handle() {
        let gateway = MockGateway::start().await.unwrap();
        let config = gateway.config();
        drop(gateway);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let shared = SharedGateway::new(GatewayClient::new(config).unwrap());
        let before = shared.client();
        assert!(shared.reconnect().await.is_err());
        assert!(Arc::ptr_eq(&before, &shared.client()));
    }
}
