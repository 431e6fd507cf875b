//! Long-poll client for an HTTP discovery registry.
//!
//! The registry exposes one blocking query per service:
//!
//! ```text
//! GET {base}/v1/services/{name}?index={after_index}&wait={ms}ms
//! GET {base}/v1/services/{name}                (initial sync, no blocking)
//! 200 {"index": 42, "instances": [{"id": "...", "host": "...", "port": 8080, "secure": false}]}
//! 404 (service has never registered an instance)
//! ```
//!
//! The server holds the request open until the service index moves past
//! `index` or the wait elapses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::{Membership, Registry, RegistryError, ServiceName};

/// Header carrying the registry index on responses without a body.
pub const INDEX_HEADER: &str = "x-registry-index";

/// Slack added to the client-side timeout on top of the server-side wait.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// HTTP long-poll registry client.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    /// Create a client for the registry at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RegistryError::Unreachable(format!(
                "registry URL must be http(s): {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("switchyard-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn watch(
        &self,
        service: &ServiceName,
        after_index: Option<u64>,
        wait: Duration,
    ) -> Result<Membership, RegistryError> {
        let url = format!("{}/v1/services/{}", self.base_url, service);

        let mut request = self.client.get(url).timeout(wait + REQUEST_SLACK);
        if let Some(index) = after_index {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ]);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let index = resp
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(after_index.unwrap_or(0));
            debug!(service = %service, index, "service not registered");
            return Ok(Membership {
                index,
                instances: Vec::new(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let membership = resp.json::<Membership>().await?;
        debug!(
            service = %service,
            index = membership.index,
            instance_count = membership.instances.len(),
            "registry watch returned"
        );
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Instance;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn svc(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_watch_decodes_membership() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/services/svc-a"))
            .and(query_param("index", "3"))
            .and(query_param("wait", "250ms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "index": 4,
                "instances": [
                    {"id": "i-1", "host": "10.0.0.1", "port": 8080},
                    {"id": "i-2", "host": "10.0.0.2", "port": 8443, "secure": true}
                ]
            })))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri()).unwrap();
        let membership = registry
            .watch(&svc("svc-a"), Some(3), Duration::from_millis(250))
            .await
            .unwrap();

        assert_eq!(membership.index, 4);
        assert_eq!(
            membership.instances,
            vec![
                Instance::new("i-1", "10.0.0.1", 8080),
                Instance::new("i-2", "10.0.0.2", 8443).secure(),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_not_found_is_empty_membership() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/services/ghost"))
            .respond_with(ResponseTemplate::new(404).insert_header(INDEX_HEADER, "9"))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(format!("{}/", server.uri())).unwrap();
        let membership = registry
            .watch(&svc("ghost"), None, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(membership.index, 9);
        assert!(membership.is_empty());
    }

    #[tokio::test]
    async fn test_watch_server_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("leader election"))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri()).unwrap();
        let err = registry
            .watch(&svc("svc-a"), None, Duration::from_millis(10))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::Status {
                status: 503,
                body: "leader election".to_string()
            }
        );
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_watch_connection_refused_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = HttpRegistry::new(format!("http://{addr}")).unwrap();
        let err = registry
            .watch(&svc("svc-a"), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(HttpRegistry::new("zk://quorum:2181").is_err());
    }
}
