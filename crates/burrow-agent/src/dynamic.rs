//! Dynamic forward handler (HTTP mode)
//!
//! An in-process capture server on an ephemeral local port. Requests whose
//! path starts with a rule's prefix are reverse-proxied to that rule's
//! upstream; everything else goes to the default upstream. Rules match in
//! declared order, so overlapping prefixes resolve deterministically.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DynamicForwardError {
    #[error("parse forward address {address:?}: {source}")]
    InvalidUpstream {
        address: String,
        source: axum::http::uri::InvalidUri,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A `prefix → upstream` pair.
#[derive(Debug, Clone)]
pub struct ForwardRule {
    pub prefix: String,
    pub upstream: Uri,
}

/// Parse newline-separated `"<prefix> <url>"` rules. Blank lines and lines
/// with other than two fields are skipped; an unparsable URL is an error.
pub fn parse_rules(raw: &str) -> Result<Vec<ForwardRule>, DynamicForwardError> {
    let mut rules = Vec::new();
    for rule in raw.lines() {
        if rule.is_empty() {
            continue;
        }
        let fields: Vec<&str> = rule.split_whitespace().collect();
        if fields.len() != 2 {
            debug!(rule, "skipped invalid dynamic forward rule");
            continue;
        }
        let upstream =
            fields[1]
                .parse::<Uri>()
                .map_err(|source| DynamicForwardError::InvalidUpstream {
                    address: fields[1].to_string(),
                    source,
                })?;
        debug!(prefix = fields[0], %upstream, "dynamic forward rule added");
        rules.push(ForwardRule {
            prefix: fields[0].to_string(),
            upstream,
        });
    }
    Ok(rules)
}

/// Prefix-dispatching reverse proxy backing the capture server.
pub struct Dispatcher {
    rules: Vec<ForwardRule>,
    default_upstream: Uri,
    client: Client<HttpConnector, Body>,
}

impl Dispatcher {
    pub fn new(
        default_forward_addr: &str,
        rules: Vec<ForwardRule>,
    ) -> Result<Self, DynamicForwardError> {
        let default_upstream = default_forward_addr.parse::<Uri>().map_err(|source| {
            DynamicForwardError::InvalidUpstream {
                address: default_forward_addr.to_string(),
                source,
            }
        })?;
        Ok(Self {
            rules,
            default_upstream,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// Upstream for the given request path: first matching rule, else the
    /// default.
    fn upstream_for(&self, path: &str) -> &Uri {
        self.rules
            .iter()
            .find(|rule| path.starts_with(&rule.prefix))
            .map(|rule| &rule.upstream)
            .unwrap_or(&self.default_upstream)
    }

    async fn forward(&self, upstream: &Uri, mut req: Request) -> Response {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = match upstream.authority() {
            Some(authority) => authority.as_str(),
            None => return (StatusCode::BAD_GATEWAY, "upstream has no authority").into_response(),
        };
        let target = match Uri::try_from(format!("http://{authority}{path_and_query}")) {
            Ok(target) => target,
            Err(err) => return (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
        };
        *req.uri_mut() = target;

        match self.client.request(req).await {
            Ok(response) => response.map(Body::new),
            Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
        }
    }

    /// Bind the capture server on an ephemeral local port and serve it in
    /// the background; returns the bound address.
    pub async fn spawn(self) -> Result<SocketAddr, DynamicForwardError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;

        let app = Router::new().fallback(dispatch).with_state(Arc::new(self));
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "capture server terminated");
            }
        });
        debug!(%addr, "capture server is running");
        Ok(addr)
    }
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, req: Request) -> Response {
    let started = Instant::now();
    let path = req.uri().path().to_string();
    let upstream = dispatcher.upstream_for(&path).clone();
    let response = dispatcher.forward(&upstream, req).await;
    info!(
        %path,
        status = response.status().as_u16(),
        elapsed = ?started.elapsed(),
        "forwarded request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_parse_rules_skips_invalid_lines() {
        let raw = "/api http://localhost:8080\n\nbroken\n/ws http://localhost:9000 extra\n/app http://localhost:3000\n";
        let rules = parse_rules(raw).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].prefix, "/api");
        assert_eq!(rules[1].prefix, "/app");
    }

    #[test]
    fn test_parse_rules_rejects_bad_upstream() {
        let err = parse_rules("/api ::not a url::").unwrap_err();
        assert!(matches!(err, DynamicForwardError::InvalidUpstream { .. }));
    }

    #[test]
    fn test_rules_match_in_declared_order() {
        let rules = parse_rules("/api/v2 http://localhost:1\n/api http://localhost:2\n").unwrap();
        let dispatcher = Dispatcher::new("http://localhost:9", rules).unwrap();

        assert_eq!(
            dispatcher.upstream_for("/api/v2/users").authority().unwrap(),
            "localhost:1"
        );
        assert_eq!(
            dispatcher.upstream_for("/api/other").authority().unwrap(),
            "localhost:2"
        );
        assert_eq!(
            dispatcher.upstream_for("/landing").authority().unwrap(),
            "localhost:9"
        );
    }

    #[test]
    fn test_overlapping_prefixes_prefer_first_declared() {
        // Declared order wins even when a later rule is more specific.
        let rules = parse_rules("/api http://localhost:2\n/api/v2 http://localhost:1\n").unwrap();
        let dispatcher = Dispatcher::new("http://localhost:9", rules).unwrap();

        assert_eq!(
            dispatcher.upstream_for("/api/v2/users").authority().unwrap(),
            "localhost:2"
        );
    }

    async fn start_upstream(tag: &'static str) -> SocketAddr {
        let app = Router::new().fallback(move || async move { tag });
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_capture_server_dispatches_by_prefix() {
        let api = start_upstream("from-api").await;
        let fallback = start_upstream("from-default").await;

        let rules = parse_rules(&format!("/api http://{api}\n")).unwrap();
        let dispatcher = Dispatcher::new(&format!("http://{fallback}"), rules).unwrap();
        let addr = dispatcher.spawn().await.unwrap();

        let response = raw_get(addr, "/api/echo?q=x").await;
        assert!(response.contains("from-api"), "response: {response}");

        let response = raw_get(addr, "/other").await;
        assert!(response.contains("from-default"), "response: {response}");
    }
}
