//! End-to-end tunnel tests over loopback
//!
//! Boots a real hub (sshd + public proxy) against an in-memory identity
//! store, runs real agent sessions against it, and drives traffic through
//! the public side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::Router;
use burrow_agent::{Tunnel, TunnelOptions};
use burrow_db::{Store, UpsertPrincipal};
use burrow_hub::{
    proxy, DatabaseConfig, HubConfig, HubServer, ProxyConfig, SshdConfig, TcpConfig, WebConfig,
};
use burrow_proto::Protocol;
use burrow_router::Cluster;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

struct TestHub {
    store: Store,
    sshd_port: u16,
    proxy_port: u16,
    domain: String,
}

impl TestHub {
    async fn start(tcp_range: (u16, u16)) -> Self {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();

        let sshd_port = free_port().await;
        let proxy_port = free_port().await;
        let domain = format!("localhost:{proxy_port}");

        let config = Arc::new(HubConfig {
            external_url: String::new(),
            web: WebConfig { port: 0 },
            proxy: ProxyConfig {
                port: proxy_port,
                scheme: "http".to_string(),
                domain: domain.clone(),
            },
            tcp: TcpConfig {
                domain: String::new(),
                port_start: tcp_range.0,
                port_end: tcp_range.1,
            },
            sshd: SshdConfig {
                port: sshd_port,
                // RSA generation is far too slow for a test loop.
                host_key_algorithms: vec!["ed25519".to_string()],
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
            },
        });

        let cluster = Arc::new(Cluster::new());
        tokio::spawn(HubServer::new(config, store.clone(), cluster.clone()).run());
        tokio::spawn(proxy::serve(proxy_port, cluster));

        wait_for_port(sshd_port).await;
        wait_for_port(proxy_port).await;

        Self {
            store,
            sshd_port,
            proxy_port,
            domain,
        }
    }

    async fn seed_tenant(&self, token: &str, subdomain: &str) {
        self.store
            .upsert_principal(UpsertPrincipal {
                identifier: format!("{subdomain}@example.com"),
                display_name: subdomain.to_string(),
                token: token.to_string(),
                subdomain: subdomain.to_string(),
            })
            .await
            .unwrap();
    }

    fn tunnel_options(&self, forward: SocketAddr, token: &str, protocol: Protocol) -> TunnelOptions {
        TunnelOptions {
            remote_addr: format!("127.0.0.1:{}", self.sshd_port),
            forward_addr: forward.to_string(),
            token: token.to_string(),
            protocol,
        }
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_port(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("port {port} never came up");
}

/// Local service under test: echoes the `q` query parameter.
async fn start_echo_server() -> SocketAddr {
    let app = Router::new().route(
        "/echo",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            params.get("q").cloned().unwrap_or_default()
        }),
    );
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn http_get(port: u16, host: &str, path_and_query: &str) -> (u16, String) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let req = hyper::Request::builder()
        .uri(format!("http://127.0.0.1:{port}{path_and_query}"))
        .header(hyper::header::HOST, host)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn test_http_tunnel_end_to_end() {
    let hub = TestHub::start((23000, 23100)).await;
    hub.seed_tenant("test-token", "unknwon").await;
    let echo = start_echo_server().await;

    let tunnel = Tunnel::establish(&hub.tunnel_options(echo, "test-token", Protocol::Http))
        .await
        .unwrap();

    // server-info never reports a host before the route exists, so the very
    // first public request must already route.
    let host = format!("unknwon.{}", hub.domain);
    assert_eq!(tunnel.host_url(), format!("http://{host}"));

    let (status, body) = http_get(hub.proxy_port, &host, "/echo?q=chickendinner").await;
    assert_eq!(status, 200);
    assert!(body.contains("chickendinner"), "body: {body}");

    tunnel.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_host_is_bad_gateway() {
    let hub = TestHub::start((23100, 23200)).await;

    let (status, body) = http_get(hub.proxy_port, "ghost.localhost", "/").await;
    assert_eq!(status, 502);
    assert_eq!(body, "No reverse proxy is available for the host: ghost.localhost");
}

#[tokio::test]
async fn test_subdomain_collision_and_release() {
    let hub = TestHub::start((23200, 23300)).await;
    hub.seed_tenant("test-token", "unknwon").await;
    let echo = start_echo_server().await;
    let opts = hub.tunnel_options(echo, "test-token", Protocol::Http);

    let first = Tunnel::establish(&opts).await.unwrap();
    let second = Tunnel::establish(&opts).await.unwrap();

    let base_host = format!("unknwon.{}", hub.domain);
    assert_eq!(first.host_url(), format!("http://{base_host}"));

    // The second forward for the same principal gets a collision suffix:
    // <8 hex digits>-unknwon.<domain>.
    let suffixed_host = second.host_url().strip_prefix("http://").unwrap().to_string();
    let (prefix, rest) = suffixed_host.split_once('-').unwrap();
    assert_eq!(prefix.len(), 8);
    assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(rest, base_host);

    // Both hosts are live in the cluster.
    let (status, body) = http_get(hub.proxy_port, &suffixed_host, "/echo?q=second").await;
    assert_eq!(status, 200);
    assert!(body.contains("second"));
    let (status, _) = http_get(hub.proxy_port, &base_host, "/echo?q=first").await;
    assert_eq!(status, 200);

    // Releasing the first tunnel frees the base host...
    first.close().await.unwrap();
    let mut released = false;
    for _ in 0..50 {
        let (status, _) = http_get(hub.proxy_port, &base_host, "/echo?q=x").await;
        if status == 502 {
            released = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(released, "base host was never released");

    // ...so a later agent re-acquires it.
    let third = Tunnel::establish(&opts).await.unwrap();
    assert_eq!(third.host_url(), format!("http://{base_host}"));
}

#[tokio::test]
async fn test_tcp_tunnel_round_trip_and_sticky_port() {
    let hub = TestHub::start((24000, 24100)).await;
    hub.seed_tenant("tcp-token", "tcpuser").await;
    let echo = start_echo_server().await;
    let opts = hub.tunnel_options(echo, "tcp-token", Protocol::Tcp);

    let tunnel = Tunnel::establish(&opts).await.unwrap();

    // tcp://<proxy host without port>:<port in range>
    let url = tunnel.host_url().to_string();
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    assert_eq!(url, format!("tcp://localhost:{port}"));
    assert!((24000..24100).contains(&port), "port {port} out of range");

    // Raw bytes flow both ways through the ingress port.
    let (status, body) = http_get(port, "ignored", "/echo?q=tcp-dinner").await;
    assert_eq!(status, 200);
    assert!(body.contains("tcp-dinner"));

    // The sticky hint lands in the store...
    let mut stored = 0;
    for _ in 0..50 {
        let principal = hub
            .store
            .principal_by_token("tcp-token")
            .await
            .unwrap()
            .unwrap();
        stored = principal.last_tcp_port;
        if stored == i32::from(port) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(stored, i32::from(port));

    // ...and a reconnect re-acquires the same port.
    tunnel.close().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    let again = Tunnel::establish(&opts).await.unwrap();
    assert_eq!(again.host_url(), url);
}

#[tokio::test]
async fn test_bad_token_is_fatal_auth_error() {
    let hub = TestHub::start((24100, 24200)).await;
    let echo = start_echo_server().await;

    let err = Tunnel::establish(&hub.tunnel_options(echo, "bogus", Protocol::Http))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("no supported methods remain"),
        "unexpected error: {err}"
    );
}
