
use std::sync::Arc;

use bytes::Bytes;
use harness::{
    chunked_body, full_body, gateway_config, post, send, svc, GatewayHandle, HttpBackend,
};
use http::StatusCode;
use rstest::rstest;
use switchyard_gateway::{Endpoint, Route};
use switchyard_registry::MemoryRegistry;

fn routes() -> Vec<Route> {
    vec![Route::service("upload", "upload", svc("upload"))]
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[rstest]
#[case::empty(0, 1)]
#[case::small(17, 1)]
#[case::one_megabyte(1024 * 1024, 16)]
#[tokio::test]
async fn request_body_round_trips_byte_exact(#[case] len: usize, #[case] chunks: usize) {
    let backend = HttpBackend::spawn("echo").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("upload"), vec![backend.instance()]);
    let gw = GatewayHandle::start(gateway_config(routes()), registry).await;

    let data = payload(len);
    let chunk_len = len.div_ceil(chunks).max(1);
    let frames: Vec<Bytes> = data
        .chunks(chunk_len)
        .map(Bytes::copy_from_slice)
        .collect();

    let response = send(gw.addr, post("/blobs", "upload", chunked_body(frames)))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.len(), len);
    assert_eq!(&response.body[..], &data[..]);

    gw.shutdown().await;
}

#[tokio::test]
async fn sequential_requests_reuse_backend_connection() {
    let backend = HttpBackend::spawn("echo").await.unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("upload"), vec![backend.instance()]);
    let gw = GatewayHandle::start(gateway_config(routes()), registry).await;

    for i in 0..5 {
        let body = format!("request {i}");
        let response = send(gw.addr, post("/blobs", "upload", full_body(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from(body));
    }

    assert_eq!(backend.request_count(), 5);
    assert_eq!(backend.connection_count(), 1);

    let endpoint = Endpoint::new("127.0.0.1", backend.addr.port());
    let stats = gw.gateway.pools().stats();
    let endpoint_stats = stats.endpoint(&endpoint).unwrap();
    assert_eq!(endpoint_stats.opened, 1);
    assert_eq!(endpoint_stats.reused, 4);
    assert_eq!(endpoint_stats.in_use, 0);

    gw.shutdown().await;
}
