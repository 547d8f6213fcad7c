//! Hub web server
//!
//! Only the health endpoint lives here; sign-in and the dashboard are
//! external collaborators.

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

/// Serve the web endpoints on the given port. Runs until failure.
pub async fn serve(port: u16) -> Result<(), std::io::Error> {
    let app = Router::new().route("/-/healthcheck", get(healthcheck));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(address = %listener.local_addr()?, "web server started");
    axum::serve(listener, app).await
}

async fn healthcheck() -> &'static str {
    "OK"
}
