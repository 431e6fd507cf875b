
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{get, gateway_config, send, svc, GatewayHandle, HttpBackend, SERVICE_HEADER};
use http::StatusCode;
use switchyard_gateway::config::ListenerSettings;
use switchyard_gateway::{Endpoint, Route};
use switchyard_registry::MemoryRegistry;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn routes() -> Vec<Route> {
    vec![Route::service("users", "users", svc("users"))]
}

async fn wait_for_requests(backend: &HttpBackend, count: u64) {
    for _ in 0..200 {
        if backend.request_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("backend never saw {count} requests");
}

async fn readyz(admin: SocketAddr) -> u16 {
    reqwest::get(format!("http://{admin}/readyz"))
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn in_flight_requests_complete_during_drain() {
    let backend = HttpBackend::spawn_with_delay("slow", Duration::from_millis(500))
        .await
        .unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let mut config = gateway_config(routes());
    config.admin_addr = Some("127.0.0.1:0".parse().unwrap());
    let gw = GatewayHandle::start(config, registry).await;
    let admin = gw.gateway.admin_addr().unwrap();
    assert_eq!(readyz(admin).await, 200);

    let in_flight: Vec<_> = (0..3)
        .map(|_| {
            let addr = gw.addr;
            tokio::spawn(async move { send(addr, get("/", &[(SERVICE_HEADER, "users")])).await })
        })
        .collect();
    wait_for_requests(&backend, 3).await;

    let addr = gw.addr;
    let probe = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let refused = TcpStream::connect(addr).await.is_err();
        (refused, readyz(admin).await)
    };
    let ((), (refused, ready_status)) = tokio::join!(gw.gateway.stop(), probe);

    assert!(refused, "new connections must be refused once stop begins");
    assert_eq!(ready_status, 503);
    for task in in_flight {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    gw.shutdown().await;
}

#[tokio::test]
async fn drain_timeout_cancels_stuck_requests() {
    let backend = HttpBackend::spawn_with_delay("stuck", Duration::from_secs(10))
        .await
        .unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let mut config = gateway_config(routes());
    config.drain_timeout = Duration::from_millis(200);
    let gw = GatewayHandle::start(config, registry).await;

    let addr = gw.addr;
    let request =
        tokio::spawn(async move { send(addr, get("/", &[(SERVICE_HEADER, "users")])).await });
    wait_for_requests(&backend, 1).await;

    let started = Instant::now();
    gw.gateway.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.header("x-switchyard-error"), Some("cancelled"));
    assert!(response.body.is_empty());
    assert_eq!(gw.gateway.stats().requests.cancelled, 1);

    gw.shutdown().await;
}

#[tokio::test]
async fn destroy_removes_working_directory() {
    let registry = Arc::new(MemoryRegistry::new());
    let gw = GatewayHandle::start(gateway_config(routes()), registry).await;
    let workdir = gw.gateway.workdir().unwrap();
    assert!(workdir.exists());

    gw.gateway.stop().await;
    gw.gateway.destroy();
    assert!(!workdir.exists());
    assert!(gw.gateway.workdir().is_none());

    gw.shutdown().await;
}

#[tokio::test]
async fn every_listener_refuses_before_any_drains() {
    let backend = HttpBackend::spawn_with_delay("slow", Duration::from_millis(500))
        .await
        .unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);

    let mut config = gateway_config(routes());
    config.listeners = vec![
        ListenerSettings::plain("127.0.0.1:0".parse().unwrap()),
        ListenerSettings::plain("127.0.0.1:0".parse().unwrap()),
    ];
    let gw = GatewayHandle::start(config, registry).await;
    let addrs = gw.gateway.listen_addrs();
    assert_eq!(addrs.len(), 2);

    let second = addrs[1];
    let in_flight =
        tokio::spawn(async move { send(second, get("/", &[(SERVICE_HEADER, "users")])).await });
    wait_for_requests(&backend, 1).await;

    let check = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        (
            TcpStream::connect(addrs[0]).await.is_err(),
            TcpStream::connect(addrs[1]).await.is_err(),
        )
    };
    let ((), (first_refused, second_refused)) = tokio::join!(gw.gateway.stop(), check);

    assert!(first_refused, "first listener still accepting while the second drains");
    assert!(second_refused);
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);

    gw.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_cancels_request() {
    let backend = HttpBackend::spawn_with_delay("slow", Duration::from_millis(300))
        .await
        .unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_instances(&svc("users"), vec![backend.instance()]);
    let gw = GatewayHandle::start(gateway_config(routes()), registry).await;

    let mut client = TcpStream::connect(gw.addr).await.unwrap();
    client
        .write_all(
            format!("GET / HTTP/1.1\r\nhost: gateway.test\r\n{SERVICE_HEADER}: users\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    wait_for_requests(&backend, 1).await;
    drop(client);

    let endpoint = Endpoint::new("127.0.0.1", backend.addr.port());
    for _ in 0..200 {
        if gw.gateway.stats().requests.cancelled == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(gw.gateway.stats().requests.cancelled, 1);
    let stats = gw.gateway.pools().stats();
    let endpoint_stats = stats.endpoint(&endpoint).unwrap();
    assert_eq!((endpoint_stats.in_use, endpoint_stats.idle), (0, 0));

    // The abandoned backend connection is never handed out again.
    let response = send(gw.addr, get("/", &[(SERVICE_HEADER, "users")]))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let stats = gw.gateway.pools().stats();
    let endpoint_stats = stats.endpoint(&endpoint).unwrap();
    assert_eq!((endpoint_stats.opened, endpoint_stats.reused), (2, 0));
    assert_eq!(gw.gateway.stats().requests.forwarded, 1);

    gw.shutdown().await;
}
