#![cfg(feature = "test-support")]

use std::time::Duration;

use chrono::Utc;
use kgw_client::testing::MockGateway;
use kgw_client::{GatewayClient, GatewayConfig, GatewayError};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

async fn loopback_available() -> bool {
    TcpListener::bind("127.0.0.1:0").await.is_ok()
}

#[tokio::test]
async fn connect_probes_api() {
    if !loopback_available().await {
        eprintln!("skipping: loopback unavailable");
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    let client = GatewayClient::connect(gateway.config()).await.unwrap();
    assert_eq!(gateway.calls(), vec!["GET /api".to_string()]);
    assert_eq!(client.check_api().await.unwrap().version, "2.14.0");
}

#[tokio::test]
async fn connect_rejects_bad_token() {
    if !loopback_available().await {
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    let config = GatewayConfig::new(&gateway.url(), "wrong").unwrap();
    let err = GatewayClient::connect(config).await.unwrap_err();
    assert!(matches!(err, GatewayError::Status { status: 403, .. }));
    assert!(err.is_transport_failure());
}

#[tokio::test]
async fn allow_listed_runtime_makes_exactly_one_call() {
    if !loopback_available().await {
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    let client = gateway.client().unwrap();

    let kernel = client.start_kernel("python3").await.unwrap();
    assert_eq!(kernel.name, "python3");
    assert_eq!(gateway.calls(), vec!["POST /api/kernels".to_string()]);

    let err = client.start_kernel("julia").await.unwrap_err();
    assert!(matches!(err, GatewayError::UnknownRuntime(ref name) if name == "julia"));
    assert!(!err.is_transport_failure());
    assert_eq!(gateway.call_count(), 1);
}

#[tokio::test]
async fn start_list_delete_lifecycle() {
    if !loopback_available().await {
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    let client = gateway.client().unwrap();

    let kernel = client.start_kernel("tfenv").await.unwrap();
    let listed = client.list_kernels().await.unwrap();
    assert!(listed.iter().any(|k| k.id == kernel.id));

    let fetched = client.get_kernel(&kernel.id).await.unwrap();
    assert_eq!(fetched.name, "tfenv");

    client.interrupt_kernel(&kernel.id).await.unwrap();
    client.restart_kernel(&kernel.id).await.unwrap();

    client.delete_kernel(&kernel.id).await.unwrap();
    let listed = client.list_kernels().await.unwrap();
    assert!(listed.iter().all(|k| k.id != kernel.id));
}

#[tokio::test]
async fn missing_kernel_is_not_found() {
    if !loopback_available().await {
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    let client = gateway.client().unwrap();

    assert!(matches!(
        client.get_kernel("nope").await,
        Err(GatewayError::NotFound(id)) if id == "nope"
    ));
    assert!(matches!(
        client.delete_kernel("nope").await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(matches!(
        client.restart_kernel("nope").await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_failure_surfaces_structured_body() {
    if !loopback_available().await {
        return;
    }
    let gateway = MockGateway::start().await.unwrap();
    gateway.insert_kernel("k1", Utc::now());
    let client = gateway.client().unwrap();

    gateway.set_list_failure(true);
    match client.list_kernels().await {
        Err(GatewayError::Status {
            status,
            reason,
            message,
        }) => {
            assert_eq!(status, 500);
            assert_eq!(reason.as_deref(), Some("Internal Server Error"));
            assert_eq!(message, "listing is unavailable");
        }
        other => panic!("expected status error, got {other:?}"),
    }

    gateway.set_list_failure(false);
    assert_eq!(client.list_kernels().await.unwrap().len(), 1);
}

#[tokio::test]
async fn calls_are_bounded_by_timeout() {
    if !loopback_available().await {
        return;
    }
    // Accepts the connection and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    let config = GatewayConfig::new(&format!("http://{addr}"), "tok").unwrap();
    let client = GatewayClient::new(config)
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let err = client.list_kernels().await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)));
    assert!(err.is_transport_failure());
}
