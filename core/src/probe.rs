//! HTTP probing of backend URLs
//!
//! The prober state machine talks to backends through the [`ProbeTransport`]
//! trait so tests can script outcomes; [`HttpProbe`] is the production
//! implementation.

use crate::config::CheckerConfig;
use crate::{CheckerError, Result};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::http::uri::PathAndQuery;
use hyper::{header, Body, Client, Method, Request, Uri};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Outcome of one probe round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Alive,
    /// Dead, with the reason that goes into the transition log
    Dead(String),
}

impl ProbeStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeStatus::Alive)
    }
}

/// One probe round against a backend URL
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, backend_url: &str) -> ProbeStatus;
}

/// Whether an HTTP status code counts as alive
///
/// Server errors in `[500, 600)` mean dead, except 503: the proxy emits 503
/// for "service busy", which is not an outage and must not flap the backend.
pub fn status_is_alive(code: u16) -> bool {
    !(500..600).contains(&code) || code == 503
}

/// HTTP prober issuing one short-lived request per round
///
/// Connections are never reused: keep-alives are disabled and every request
/// carries `Connection: close`, so each round exercises the full TCP path
/// the proxy's clients would take.
pub struct HttpProbe {
    client: Client<HttpConnector>,
    method: Method,
    uri_override: Option<PathAndQuery>,
    host_header: Option<String>,
    user_agent: String,
    /// Covers the dial plus all socket I/O of one request
    deadline: Duration,
}

impl HttpProbe {
    pub fn new(config: &CheckerConfig) -> Result<Self> {
        let method = Method::from_bytes(config.http_method.as_bytes())
            .map_err(|e| CheckerError::Configuration(e.to_string()))?;
        let uri_override = if config.probe_uri.is_empty() {
            None
        } else {
            Some(
                config
                    .probe_uri
                    .parse::<PathAndQuery>()
                    .map_err(|e| CheckerError::Configuration(e.to_string()))?,
            )
        };
        let host_header = if config.probe_host.is_empty() {
            None
        } else {
            Some(config.probe_host.clone())
        };

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build(connector);

        Ok(Self {
            client,
            method,
            uri_override,
            host_header,
            user_agent: config.user_agent.clone(),
            deadline: config.connect_timeout + config.io_timeout,
        })
    }

    fn request_uri(&self, backend_url: &str) -> std::result::Result<Uri, String> {
        let base: Uri = backend_url
            .parse()
            .map_err(|e| format!("invalid backend URL {:?}: {}", backend_url, e))?;
        match &self.uri_override {
            None => Ok(base),
            Some(path) => {
                let mut parts = base.into_parts();
                parts.path_and_query = Some(path.clone());
                Uri::from_parts(parts)
                    .map_err(|e| format!("invalid backend URL {:?}: {}", backend_url, e))
            }
        }
    }
}

#[async_trait]
impl ProbeTransport for HttpProbe {
    async fn probe(&self, backend_url: &str) -> ProbeStatus {
        let uri = match self.request_uri(backend_url) {
            Ok(uri) => uri,
            Err(reason) => return ProbeStatus::Dead(reason),
        };
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .header(header::USER_AGENT, &self.user_agent)
            .header(header::CONNECTION, "close");
        if let Some(host) = &self.host_header {
            builder = builder.header(header::HOST, host);
        }
        let request = match builder.body(Body::empty()) {
            Ok(request) => request,
            Err(e) => {
                return ProbeStatus::Dead(format!(
                    "cannot build probe request for {}: {}",
                    backend_url, e
                ))
            }
        };

        match timeout(self.deadline, self.client.request(request)).await {
            Err(_) => ProbeStatus::Dead(format!(
                "timeout after {:?} on {}",
                self.deadline, backend_url
            )),
            Ok(Err(e)) => ProbeStatus::Dead(format!("TCP error on {}: {}", backend_url, e)),
            Ok(Ok(response)) => {
                let code = response.status().as_u16();
                debug!("Probe of {} returned {}", backend_url, code);
                if status_is_alive(code) {
                    ProbeStatus::Alive
                } else {
                    ProbeStatus::Dead(format!("HTTP error on {}: {}", backend_url, code))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server, StatusCode};
    use std::convert::Infallible;

    #[test]
    fn test_status_classification() {
        assert!(status_is_alive(200));
        assert!(status_is_alive(204));
        assert!(status_is_alive(301));
        assert!(status_is_alive(404));
        assert!(status_is_alive(499));
        assert!(!status_is_alive(500));
        assert!(!status_is_alive(502));
        assert!(status_is_alive(503));
        assert!(!status_is_alive(504));
        assert!(!status_is_alive(599));
        assert!(status_is_alive(600));
    }

    #[test]
    fn test_request_uri_override() {
        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        let uri = probe.request_uri("http://10.0.0.1:8080/app").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/CloudHealthCheck");

        let mut config = CheckerConfig::default();
        config.probe_uri = String::new();
        let probe = HttpProbe::new(&config).unwrap();
        let uri = probe.request_uri("http://10.0.0.1:8080/app").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/app");
    }

    // Serves a fixed status code on an ephemeral port
    async fn start_status_server(code: u16) -> String {
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                let response = Response::builder()
                    .status(StatusCode::from_u16(code).unwrap())
                    .body(Body::empty())
                    .unwrap();
                Ok::<_, Infallible>(response)
            }))
        });
        let addr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&addr).serve(make_svc);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(async move {
            let _ = server.await;
        });
        url
    }

    #[tokio::test]
    async fn test_probe_alive_on_2xx() {
        let url = start_status_server(200).await;
        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        assert_eq!(probe.probe(&url).await, ProbeStatus::Alive);
    }

    #[tokio::test]
    async fn test_probe_dead_on_500() {
        let url = start_status_server(500).await;
        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        match probe.probe(&url).await {
            ProbeStatus::Dead(reason) => assert!(reason.contains("500"), "{}", reason),
            other => panic!("Expected dead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_alive_on_503() {
        let url = start_status_server(503).await;
        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        assert_eq!(probe.probe(&url).await, ProbeStatus::Alive);
    }

    #[tokio::test]
    async fn test_probe_dead_on_connection_refused() {
        // Bind-then-drop guarantees nothing is listening on the port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        match probe.probe(&url).await {
            ProbeStatus::Dead(reason) => assert!(reason.contains("TCP error"), "{}", reason),
            other => panic!("Expected dead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_dead_on_invalid_url() {
        let probe = HttpProbe::new(&CheckerConfig::default()).unwrap();
        match probe.probe("not a url").await {
            ProbeStatus::Dead(reason) => assert!(reason.contains("invalid"), "{}", reason),
            other => panic!("Expected dead, got {:?}", other),
        }
    }
}
