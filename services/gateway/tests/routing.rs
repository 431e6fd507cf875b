
use std::collections::HashMap;
use std::sync::Arc;

use harness::{get, gateway_config, send, svc, GatewayHandle, HttpBackend, SERVICE_HEADER};
use http::StatusCode;
use switchyard_gateway::Route;
use switchyard_registry::MemoryRegistry;

#[tokio::test]
async fn concurrent_requests_spread_round_robin() {
    let b1 = HttpBackend::spawn("b1").await.unwrap();
    let b2 = HttpBackend::spawn("b2").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![b1.instance(), b2.instance()]);

    let routes = vec![Route::service("users", "users", svc("users"))];
    let gw = GatewayHandle::start(gateway_config(routes), registry).await;

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let addr = gw.addr;
        tasks.push(tokio::spawn(async move {
            send(addr, get("/profile", &[(SERVICE_HEADER, "users")])).await
        }));
    }

    let mut by_backend: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let backend = response.header("x-backend").unwrap().to_string();
        *by_backend.entry(backend).or_default() += 1;
    }

    assert_eq!(by_backend.get("b1"), Some(&50));
    assert_eq!(by_backend.get("b2"), Some(&50));
    assert_eq!(b1.request_count() + b2.request_count(), 100);

    gw.shutdown().await;
}

#[tokio::test]
async fn routes_by_header_then_host_then_path() {
    let header_backend = HttpBackend::spawn("by-header").await.unwrap();
    let host_backend = HttpBackend::spawn("by-host").await.unwrap();
    let path_backend = HttpBackend::spawn("by-path").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("svc-header"), vec![header_backend.instance()]);
    registry.set_instances(&svc("svc-host"), vec![host_backend.instance()]);
    registry.set_instances(&svc("svc-path"), vec![path_backend.instance()]);

    let routes = vec![
        Route::path_prefix("api", "/api/v3/*", svc("svc-path")),
        Route::host("shop", "shop.example.com", svc("svc-host")),
        Route::service("orders", "orders", svc("svc-header")),
    ];
    let gw = GatewayHandle::start(gateway_config(routes), registry).await;

    let response = send(
        gw.addr,
        get(
            "/api/v3/items",
            &[(SERVICE_HEADER, "orders"), ("host", "shop.example.com")],
        ),
    )
    .await
    .unwrap();
    assert_eq!(response.header("x-backend"), Some("by-header"));

    let response = send(gw.addr, get("/api/v3/items", &[("host", "Shop.Example.com:8080")]))
        .await
        .unwrap();
    assert_eq!(response.header("x-backend"), Some("by-host"));

    let response = send(gw.addr, get("/api/v3/items?page=2", &[])).await.unwrap();
    assert_eq!(response.header("x-backend"), Some("by-path"));
    assert_eq!(response.header("x-seen-path"), Some("/api/v3/items?page=2"));

    let response = send(gw.addr, get("/api/v30", &[])).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    gw.shutdown().await;
}

#[tokio::test]
async fn unknown_route_is_404_with_problem_body() {
    let registry = Arc::new(MemoryRegistry::new());
    let routes = vec![Route::service("orders", "orders", svc("svc-orders"))];
    let gw = GatewayHandle::start(gateway_config(routes), registry).await;

    let response = send(gw.addr, get("/", &[(SERVICE_HEADER, "billing")]))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.header("x-switchyard-error"), Some("no_route"));
    let body = response.json();
    assert_eq!(body["code"], "no_route");
    assert_eq!(body["status"], 404);
    assert!(body["request_id"].as_str().is_some_and(|id| !id.is_empty()));

    gw.shutdown().await;
}

#[tokio::test]
async fn empty_service_is_503_without_pool_acquisition() {
    let registry = Arc::new(MemoryRegistry::new());
    let routes = vec![Route::service("orders", "orders", svc("svc-orders"))];
    let gw = GatewayHandle::start(gateway_config(routes), registry).await;

    let response = send(gw.addr, get("/", &[(SERVICE_HEADER, "orders")]))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.header("x-switchyard-error"), Some("service_unavailable"));
    assert_eq!(gw.gateway.pools().stats().acquisitions, 0);

    gw.shutdown().await;
}

#[tokio::test]
async fn forwarded_headers_are_rewritten() {
    let backend = HttpBackend::spawn("b1").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let routes = vec![Route::service("users", "users", svc("users"))];
    let gw = GatewayHandle::start(gateway_config(routes), registry).await;

    let response = send(
        gw.addr,
        get(
            "/",
            &[
                (SERVICE_HEADER, "users"),
                ("x-switchyard-identity", "admin"),
                ("x-request-id", "req-123"),
                ("x-forwarded-for", "192.0.2.7"),
            ],
        ),
    )
    .await
    .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    // Anonymous callers never reach the backend with an identity.
    assert_eq!(response.header("x-seen-identity"), None);
    assert_eq!(response.header("x-seen-request-id"), Some("req-123"));
    assert_eq!(response.header("x-seen-forwarded-for"), Some("192.0.2.7, 127.0.0.1"));
    assert_eq!(response.header("x-seen-host"), Some("gateway.test"));

    gw.shutdown().await;
}
