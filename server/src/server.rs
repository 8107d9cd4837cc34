//! Proxy server: router assembly and connection serving
//!
//! Connections are served manually instead of through `axum::serve` because
//! the timeout chaos needs connection-level control: an axum handler cannot
//! withhold its response, so teardown happens here. Each accepted socket
//! gets a [`ConnectionKill`] token that rides in request extensions; when
//! the forwarder's hang path cancels it, the `select!` below drops the
//! connection and its socket without a single HTTP byte having been
//! written. If the client disconnects first the serve future finishes and
//! the in-flight handler (including its timer) is dropped instead.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use engine::ChaosEngine;

use crate::error::{ServerError, ServerResult};
use crate::services::upstream::{HttpUpstreamClient, UpstreamClient};
use crate::web::handlers::{api, proxy, websocket};

/// Per-connection kill switch for the timeout-hang path.
#[derive(Debug, Clone)]
pub struct ConnectionKill(CancellationToken);

impl ConnectionKill {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Shared application state for the router.
pub struct AppState<U> {
    pub engine: Arc<ChaosEngine>,
    pub upstream: Arc<U>,
}

// Manual Clone so U itself does not need to be Clone.
impl<U> Clone for AppState<U> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

/// The chaos proxy server, generic over the upstream transport.
pub struct ProxyServer<U> {
    engine: Arc<ChaosEngine>,
    upstream: Arc<U>,
    bind_address: SocketAddr,
}

impl ProxyServer<HttpUpstreamClient> {
    pub fn new(engine: Arc<ChaosEngine>, bind_address: SocketAddr) -> Self {
        Self::with_upstream(engine, HttpUpstreamClient::new(), bind_address)
    }
}

impl<U> ProxyServer<U>
where
    U: UpstreamClient + 'static,
{
    pub fn with_upstream(engine: Arc<ChaosEngine>, upstream: U, bind_address: SocketAddr) -> Self {
        Self {
            engine,
            upstream: Arc::new(upstream),
            bind_address,
        }
    }

    /// Build the axum router with all routes.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            upstream: self.upstream.clone(),
        };

        Router::new()
            // Management surface
            .route("/config", get(api::get_config).put(api::update_config))
            .route("/rules", get(api::list_rules).post(api::create_rule))
            .route(
                "/rules/:id",
                get(api::get_rule)
                    .put(api::update_rule)
                    .delete(api::delete_rule),
            )
            .route("/logs", get(api::read_logs).delete(api::clear_logs))
            .route("/health", get(api::health))
            // Real-time surface
            .route("/ws", get(websocket::websocket_handler))
            // Proxy surface: any method, any subpath
            .route("/proxy", any(proxy::proxy_handler))
            .route("/proxy/", any(proxy::proxy_handler))
            .route("/proxy/*path", any(proxy::proxy_handler))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.bind_address).await.map_err(|e| {
            ServerError::Startup(format!("failed to bind {}: {e}", self.bind_address))
        })?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> ServerResult<()> {
        let router = self.build_router();
        info!("🌐 Chaos proxy listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let router = router.clone();
                            tokio::spawn(serve_connection(stream, peer, router));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, router: Router) {
    let kill = CancellationToken::new();

    let service = {
        let kill = kill.clone();
        hyper::service::service_fn(move |mut request: hyper::Request<hyper::body::Incoming>| {
            request.extensions_mut().insert(ConnectionKill(kill.clone()));
            let router = router.clone();
            async move { router.oneshot(request).await }
        })
    };

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!("connection from {peer} ended: {e}");
            }
        }
        _ = kill.cancelled() => {
            // Timeout chaos fired: drop the socket, no HTTP bytes written.
            debug!("connection from {peer} destroyed by timeout chaos");
        }
    }
}
