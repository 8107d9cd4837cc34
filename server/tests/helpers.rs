//! Shared helpers for proxy integration tests
//!
//! Spawns a real proxy and a real in-process upstream on ephemeral ports so
//! the tests exercise actual sockets end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;

use engine::{ChaosEngine, ConfigPatch, RuleDraft};
use server::ProxyServer;

/// A running fake upstream plus its request counter.
pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn upstream_handler(State(hits): State<Arc<AtomicUsize>>, request: Request) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let echo_header = request.headers().get("x-echo-me").cloned();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    match path.as_str() {
        "/json" => (
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"a":1,"b":2}"#,
        )
            .into_response(),
        "/ax" => (
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"k":1}"#,
        )
            .into_response(),
        "/echo" => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert("x-upstream", HeaderValue::from_static("yes"));
            if let Some(query) = query {
                if let Ok(value) = HeaderValue::from_str(&query) {
                    response.headers_mut().insert("x-query", value);
                }
            }
            if let Some(value) = echo_header {
                response.headers_mut().insert("x-echo-me", value);
            }
            response
        }
        "/missing" => StatusCode::NOT_FOUND.into_response(),
        _ => "upstream ok".into_response(),
    }
}

/// Start a fake upstream on an ephemeral port.
pub async fn spawn_upstream() -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/", any(upstream_handler))
        .route("/*path", any(upstream_handler))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Upstream { addr, hits }
}

/// Start a proxy serving the given engine on an ephemeral port.
pub async fn spawn_proxy(engine: Arc<ChaosEngine>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = ProxyServer::new(engine, addr);
    tokio::spawn(async move {
        proxy.serve(listener).await.unwrap();
    });
    addr
}

/// Upstream + engine pointed at it + proxy, wired together.
pub async fn spawn_proxy_with_upstream() -> (SocketAddr, Arc<ChaosEngine>, Upstream) {
    let upstream = spawn_upstream().await;
    let engine = Arc::new(ChaosEngine::new());
    engine
        .update_config(ConfigPatch {
            target_url: Some(upstream.url()),
            enabled: None,
        })
        .await;
    let proxy_addr = spawn_proxy(engine.clone()).await;
    (proxy_addr, engine, upstream)
}

/// A minimal rule draft; tests override the fields they care about.
pub fn rule_draft(name: &str, pattern: &str, chaos_type: &str) -> RuleDraft {
    RuleDraft {
        name: Some(name.to_string()),
        path_pattern: Some(pattern.to_string()),
        chaos_type: Some(chaos_type.to_string()),
        ..RuleDraft::default()
    }
}
