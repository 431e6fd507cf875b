
use std::sync::Arc;

use harness::{
    closed_port, get, gateway_config, send, svc, GatewayHandle, HttpBackend, SERVICE_HEADER,
};
use http::StatusCode;
use switchyard_gateway::security::hash_token;
use switchyard_gateway::{Route, SecurityMode};
use switchyard_registry::MemoryRegistry;

const TOKEN: &str = "s3cret-ingest-token";

async fn token_gateway(dir: &std::path::Path, backend: &HttpBackend) -> GatewayHandle {
    let token_file = dir.join("tokens.toml");
    std::fs::write(
        &token_file,
        format!(
            "[[tokens]]\nprincipal = \"svc-ingest\"\nsha256 = \"{}\"\n",
            hash_token(TOKEN)
        ),
    )
    .unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let mut config = gateway_config(vec![Route::service("users", "users", svc("users"))]);
    config.security.mode = SecurityMode::Token;
    config.security.token_file = Some(token_file);
    GatewayHandle::start(config, registry).await
}

#[tokio::test]
async fn invalid_token_rejected_before_any_pool_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let backend = HttpBackend::spawn("b1").await.unwrap();
    let gw = token_gateway(dir.path(), &backend).await;

    for authorization in [None, Some("Bearer wrong-token"), Some("Basic dXNlcjpwYXNz")] {
        let mut headers = vec![(SERVICE_HEADER, "users")];
        if let Some(value) = authorization {
            headers.push(("authorization", value));
        }
        let response = send(gw.addr, get("/", &headers)).await.unwrap();
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.header("x-switchyard-error"), Some("authentication_failed"));
        assert!(!String::from_utf8_lossy(&response.body).contains("wrong-token"));
    }

    assert_eq!(gw.gateway.pools().stats().acquisitions, 0);
    assert_eq!(backend.request_count(), 0);
    assert_eq!(gw.gateway.stats().requests.rejected_auth, 3);

    gw.shutdown().await;
}

#[tokio::test]
async fn valid_token_forwards_identity() {
    let dir = tempfile::tempdir().unwrap();
    let backend = HttpBackend::spawn("b1").await.unwrap();
    let gw = token_gateway(dir.path(), &backend).await;

    let bearer = format!("Bearer {TOKEN}");
    let response = send(
        gw.addr,
        get(
            "/",
            &[
                (SERVICE_HEADER, "users"),
                ("authorization", &bearer),
                ("x-switchyard-identity", "root"),
            ],
        ),
    )
    .await
    .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("x-seen-identity"), Some("svc-ingest"));
    assert_eq!(backend.request_count(), 1);

    gw.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_request_for_unknown_route_is_still_401() {
    let dir = tempfile::tempdir().unwrap();
    let backend = HttpBackend::spawn("b1").await.unwrap();
    let gw = token_gateway(dir.path(), &backend).await;

    let response = send(gw.addr, get("/", &[(SERVICE_HEADER, "billing")]))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    gw.shutdown().await;
}

#[tokio::test]
async fn unreachable_verifier_answers_503_not_401() {
    let dir = tempfile::tempdir().unwrap();
    let keytab = dir.path().join("gateway.keytab");
    std::fs::write(&keytab, b"keytab").unwrap();
    let backend = HttpBackend::spawn("b1").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let mut config = gateway_config(vec![Route::service("users", "users", svc("users"))]);
    config.security.mode = SecurityMode::Kerberos;
    config.security.principal = Some("gateway/host@EXAMPLE.COM".to_string());
    config.security.keytab = Some(keytab);
    config.security.verify_url = Some(format!("http://127.0.0.1:{}/verify", closed_port()));
    let gw = GatewayHandle::start(config, registry).await;

    let response = send(
        gw.addr,
        get("/", &[(SERVICE_HEADER, "users"), ("authorization", "Negotiate YIIC")]),
    )
    .await
    .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.header("x-switchyard-error"), Some("security_unavailable"));
    assert_eq!(backend.request_count(), 0);

    let stats = gw.gateway.stats().requests;
    assert_eq!(stats.auth_unavailable, 1);
    assert_eq!(stats.rejected_auth, 0);

    gw.shutdown().await;
}
