//! Public HTTP proxy
//!
//! Every request's `Host` header is looked up in the routing cluster; on a
//! hit the request streams through to `http://<upstream>` with its original
//! path and query. Misses and upstream failures surface as 502.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use burrow_router::Cluster;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream url: {0}")]
    Uri(#[from] axum::http::uri::InvalidUri),

    #[error("{0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ProxyState {
    cluster: Arc<Cluster>,
    client: Client<HttpConnector, Body>,
}

/// Serve the public proxy on the given port. Runs until failure.
pub async fn serve(port: u16, cluster: Arc<Cluster>) -> Result<(), ProxyError> {
    let state = Arc::new(ProxyState {
        cluster,
        client: Client::builder(TokioExecutor::new()).build_http(),
    });

    // A panicking upstream exchange must not take the server down.
    let app = Router::new()
        .fallback(proxy_request)
        .layer(CatchPanicLayer::new())
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(address = %listener.local_addr()?, "proxy server started");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn proxy_request(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let host = request_host(&req);
    let Some(upstream) = state.cluster.get(&host) else {
        return (
            StatusCode::BAD_GATEWAY,
            format!("No reverse proxy is available for the host: {host}"),
        )
            .into_response();
    };
    debug!(%host, %upstream, path = req.uri().path(), "proxying request");

    match forward(&state.client, &upstream, req).await {
        Ok(response) => response,
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

fn request_host(req: &Request) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

async fn forward(
    client: &Client<HttpConnector, Body>,
    upstream: &str,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::try_from(format!("http://{upstream}{path_and_query}"))?;
    *req.uri_mut() = uri;

    let response = client.request(req).await?;
    Ok(response.map(Body::new))
}
