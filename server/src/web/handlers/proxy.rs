//! The proxy forwarder
//!
//! Handles every request under `/proxy`: buffers the inbound body, runs the
//! chaos pipeline, forwards to the configured upstream, applies post
//! effects, and writes the response. Every outcome appends a log entry to
//! the engine, which broadcasts it to WebSocket subscribers.
//!
//! The timeout-hang path never produces an HTTP response: it appends the
//! log immediately, sleeps for the computed duration, and then cancels the
//! per-connection token planted by the connection loop in `server.rs`,
//! which drops the connection without a single byte having been written.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use engine::pipeline::{self, PreOutcome};
use engine::{LogStatus, RequestLog, Rule};

use crate::server::{AppState, ConnectionKill};
use crate::services::upstream::{UpstreamClient, UpstreamRequest};

/// Cap on the buffered inbound request body.
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers never forwarded to the upstream (RFC 7230 §6.1 hop-by-hop set,
/// plus host and content-length which the client rewrites itself).
const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Headers stripped from the upstream response before egress.
const RESPONSE_STRIP_HEADERS: [&str; 3] = ["transfer-encoding", "connection", "keep-alive"];

pub async fn proxy_handler<U>(State(state): State<AppState<U>>, request: Request) -> Response
where
    U: UpstreamClient + 'static,
{
    let started = Instant::now();
    let method = request.method().clone();
    let kill = request.extensions().get::<ConnectionKill>().cloned();
    let inbound_headers = request.headers().clone();
    let uri = request.uri().clone();

    let full_path = uri.path();
    let forward_path = match full_path.strip_prefix("/proxy") {
        Some("") => "/",
        Some(rest) => rest,
        None => full_path,
    }
    .to_string();
    let raw_query = uri.query().map(str::to_string);

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({
                    "error": true,
                    "message": "Request body too large",
                }),
            );
        }
    };

    let ctx = LogContext {
        method: method.to_string(),
        path: match &raw_query {
            Some(query) => format!("{forward_path}?{query}"),
            None => forward_path.clone(),
        },
        headers: snapshot_headers(&inbound_headers),
        started,
    };

    let engine = state.engine.clone();
    let config = engine.config().await;

    // Preconditions: proxying is impossible without a target.
    if config.target_url.is_empty() {
        let body = json!({
            "error": true,
            "message": "No target URL configured",
            "details": "Set a target URL via the management interface before using the proxy.",
        });
        engine
            .append_log(ctx.entry(LogStatus::Code(503), Vec::new(), None, false, None))
            .await;
        return json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
    }

    let target_url = match build_target_url(&config.target_url, &forward_path, raw_query.as_deref())
    {
        Ok(url) => url,
        Err(err) => {
            let body = json!({
                "error": true,
                "message": "Invalid target URL",
                "details": err.to_string(),
            });
            engine
                .append_log(ctx.entry(LogStatus::Code(502), Vec::new(), None, false, None))
                .await;
            return json_response(StatusCode::BAD_GATEWAY, &body);
        }
    };

    let outbound_headers = filter_request_headers(&inbound_headers);

    let mut actions: Vec<String> = Vec::new();
    let mut matched: Option<Rule> = None;

    if config.enabled {
        let decision = pipeline::evaluate_pre(&engine, &forward_path, method.as_str()).await;
        actions.extend(decision.actions);
        matched = decision.matched;

        match decision.outcome {
            PreOutcome::Respond(immediate) => {
                let status = StatusCode::from_u16(immediate.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let elapsed = started.elapsed().as_millis() as u64;
                engine
                    .append_log(ctx.entry(
                        LogStatus::Code(status.as_u16()),
                        actions,
                        matched.as_ref(),
                        true,
                        None,
                    ))
                    .await;

                let mut response = json_response(status, &immediate.body);
                if let Some(retry_after) = immediate.retry_after_secs {
                    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                debug!("terminal chaos response {status} after {elapsed}ms");
                return response;
            }
            PreOutcome::Hang { duration_ms } => {
                // Observers see the event at the moment of entry, not at
                // teardown.
                engine
                    .append_log(ctx.entry(
                        LogStatus::Timeout,
                        actions,
                        matched.as_ref(),
                        true,
                        None,
                    ))
                    .await;

                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                match kill {
                    Some(kill) => {
                        kill.cancel();
                        // The connection task drops the socket; this future
                        // is dropped with it and never yields a response.
                        futures_util::future::pending::<()>().await;
                        unreachable!("connection torn down while hanging")
                    }
                    None => {
                        warn!("timeout hang without a connection handle; responding 408");
                        return StatusCode::REQUEST_TIMEOUT.into_response();
                    }
                }
            }
            PreOutcome::Proceed => {}
        }
    } else {
        actions.push("chaos:disabled".to_string());
    }

    // Upstream call.
    actions.push("upstream:request".to_string());
    let send_body = (!body_bytes.is_empty() && method != Method::GET && method != Method::HEAD)
        .then(|| body_bytes.clone());

    let upstream_request = UpstreamRequest {
        method,
        url: target_url,
        headers: outbound_headers,
        body: send_body,
    };

    let mut upstream = match state.upstream.forward(upstream_request).await {
        Ok(upstream) => upstream,
        Err(failure) => {
            actions.push(format!("upstream:error:{}", failure.code));
            let details = format!("Proxy error: {}", failure.message);
            engine
                .append_log(ctx.entry(
                    LogStatus::Code(502),
                    actions,
                    matched.as_ref(),
                    matched.is_some(),
                    Some(details),
                ))
                .await;
            return json_response(
                StatusCode::BAD_GATEWAY,
                &json!({
                    "error": true,
                    "message": failure.message,
                    "details": failure.details,
                }),
            );
        }
    };
    actions.push(format!("upstream:{}", upstream.status.as_u16()));

    // Post effects on the rule matched pre-upstream. Never re-match here:
    // the probabilistic stages are not idempotent.
    let effects = pipeline::evaluate_post(matched.as_ref());
    actions.extend(effects.actions.iter().cloned());
    if effects.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(effects.delay_ms)).await;
    }

    let mut response_headers = filter_response_headers(&upstream.headers);
    let upstream_is_json = upstream
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    let status = upstream.status;
    let body = if effects.corrupt && upstream_is_json {
        match upstream.collect_body().await {
            Ok(bytes) => {
                let (mutated, action) = pipeline::corrupt_json_body(&bytes);
                actions.push(action);
                // The body length changed; let hyper recompute framing.
                response_headers.remove(header::CONTENT_LENGTH);
                Body::from(mutated)
            }
            Err(err) => {
                actions.push("upstream:error:ECONNRESET".to_string());
                engine
                    .append_log(ctx.entry(
                        LogStatus::Code(502),
                        actions,
                        matched.as_ref(),
                        true,
                        Some("Proxy error: Connection reset by upstream server".to_string()),
                    ))
                    .await;
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    &json!({
                        "error": true,
                        "message": "Connection reset by upstream server",
                        "details": err.to_string(),
                    }),
                );
            }
        }
    } else {
        // Fast path: stream the upstream body straight through.
        Body::from_stream(upstream.body)
    };

    engine
        .append_log(ctx.entry(
            LogStatus::Code(status.as_u16()),
            actions,
            matched.as_ref(),
            matched.is_some(),
            None,
        ))
        .await;

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Per-request log assembly state.
struct LogContext {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    started: Instant,
}

impl LogContext {
    fn entry(
        &self,
        status: LogStatus,
        actions: Vec<String>,
        matched: Option<&Rule>,
        chaos_applied: bool,
        details: Option<String>,
    ) -> RequestLog {
        let response_time = match status {
            // A hang's response time is the planned hold duration, which the
            // caller encodes in the actions; fall back to elapsed.
            LogStatus::Timeout => hang_duration_from_actions(&actions)
                .unwrap_or_else(|| self.started.elapsed().as_millis() as u64),
            _ => self.started.elapsed().as_millis() as u64,
        };

        let chaos_details = details.or_else(|| {
            let visible: Vec<&str> = actions
                .iter()
                .filter(|a| !a.starts_with("upstream:"))
                .map(String::as_str)
                .collect();
            if visible.is_empty() {
                None
            } else {
                Some(visible.join(" → "))
            }
        });

        RequestLog {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            status_code: status,
            response_time,
            chaos_applied,
            chaos_type: matched.map(|r| r.chaos.tag().to_string()),
            chaos_rule_id: matched.map(|r| r.id.clone()),
            chaos_rule_name: matched.map(|r| r.name.clone()),
            chaos_details,
            actions_applied: actions,
        }
    }
}

/// Pull the planned duration back out of a `timeout:triggered(ms=N)` action.
fn hang_duration_from_actions(actions: &[String]) -> Option<u64> {
    actions.iter().find_map(|action| {
        action
            .strip_prefix("timeout:triggered(ms=")?
            .strip_suffix(')')?
            .parse()
            .ok()
    })
}

/// Join the request path to the target base as a relative reference, then
/// overwrite the query with the original raw query (preserving ordering and
/// duplicate keys).
fn build_target_url(
    base: &str,
    path: &str,
    raw_query: Option<&str>,
) -> Result<Url, url::ParseError> {
    let base = Url::parse(base)?;
    let mut target = base.join(path)?;
    target.set_query(raw_query);
    Ok(target)
}

/// Drop hop-by-hop headers plus everything named in the inbound
/// `Connection` header; join remaining multi-value headers with `", "`.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: HashSet<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut filtered = HeaderMap::new();
    for name in headers.keys() {
        let lowered = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lowered) || connection_listed.contains(lowered) {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            filtered.insert(name.clone(), value);
        }
    }
    filtered
}

fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in headers.keys() {
        if RESPONSE_STRIP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        for value in headers.get_all(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn snapshot_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut snapshot = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        snapshot.insert(name.as_str().to_string(), joined);
    }
    snapshot
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(Bytes::from(bytes)))
        .unwrap_or_default()
}
