//! Upstream HTTP client
//!
//! The forwarder talks to the upstream through the [`UpstreamClient`] trait
//! so tests can substitute their own transport. The real implementation
//! wraps a shared `reqwest::Client` built without a total-request timeout:
//! an engine-imposed deadline would short-circuit the chaos timeout
//! mechanism, whose whole point is to look like a dead upstream.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use axum::http::{HeaderMap, Method, StatusCode};
use tracing::debug;
use url::Url;

/// Request handed to the upstream transport: already filtered headers, the
/// original method, and the buffered body (when one should be forwarded).
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Upstream response with a streaming body, so the no-chaos path never has
/// to buffer.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl UpstreamResponse {
    /// Drain the body into one buffer (corruption needs the whole thing).
    pub async fn collect_body(&mut self) -> io::Result<Bytes> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(collected))
    }
}

/// A classified transport failure, ready to be rendered as a 502.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    /// Short tag used in the `upstream:error:<code>` action.
    pub code: &'static str,
    pub message: String,
    pub details: String,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure>;
}

/// Real upstream client over reqwest.
#[derive(Clone)]
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new() -> Self {
        // No .timeout(): the platform default applies, see module docs.
        // Redirects pass through untouched; following them here would
        // rewrite the upstream status the client is supposed to see.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure> {
        let host = request
            .url
            .host_str()
            .unwrap_or("upstream")
            .to_string();

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = response
                    .bytes_stream()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                    .boxed();
                Ok(UpstreamResponse {
                    status,
                    headers,
                    body,
                })
            }
            Err(err) => {
                debug!("upstream request failed: {err}");
                Err(classify_error(&err, &host))
            }
        }
    }
}

/// The failure category of an upstream transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamCause {
    Refused,
    Dns,
    TimedOut,
    Reset,
    Tls,
    Other,
}

/// Map a reqwest error to the user-facing 502 message/details pair.
fn classify_error(err: &reqwest::Error, host: &str) -> UpstreamFailure {
    let (cause, deepest) = diagnose(err);
    let cause = if cause == UpstreamCause::Other && err.is_timeout() {
        UpstreamCause::TimedOut
    } else {
        cause
    };

    match cause {
        UpstreamCause::Refused => UpstreamFailure {
            code: "ECONNREFUSED",
            message: "Connection refused by upstream server".to_string(),
            details: format!("{host} is not accepting connections"),
        },
        UpstreamCause::Dns => UpstreamFailure {
            code: "ENOTFOUND",
            message: "DNS resolution failed".to_string(),
            details: format!("Could not resolve hostname: {host}"),
        },
        UpstreamCause::TimedOut => UpstreamFailure {
            code: "ETIMEDOUT",
            message: "Upstream request timed out".to_string(),
            details: format!("No response from {host}"),
        },
        UpstreamCause::Reset => UpstreamFailure {
            code: "ECONNRESET",
            message: "Connection reset by upstream server".to_string(),
            details: deepest,
        },
        UpstreamCause::Tls => UpstreamFailure {
            code: "CERT",
            message: "SSL/TLS certificate error".to_string(),
            details: deepest,
        },
        UpstreamCause::Other => UpstreamFailure {
            code: "UNKNOWN",
            message: "Failed to reach upstream server".to_string(),
            details: deepest,
        },
    }
}

/// Walk the source chain looking for the underlying socket/DNS/TLS failure.
/// Returns the cause and the deepest error text (the most specific detail).
fn diagnose(err: &(dyn std::error::Error + 'static)) -> (UpstreamCause, String) {
    let mut cause = UpstreamCause::Other;
    let mut deepest = err.to_string();

    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(error) = current {
        let text = error.to_string();
        let lowered = text.to_lowercase();

        if lowered.contains("dns error") || lowered.contains("failed to lookup address") {
            cause = UpstreamCause::Dns;
        } else if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl")
        {
            cause = UpstreamCause::Tls;
        }

        if let Some(io_err) = error.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => cause = UpstreamCause::Refused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    cause = UpstreamCause::Reset
                }
                io::ErrorKind::TimedOut => cause = UpstreamCause::TimedOut,
                _ => {}
            }
        }

        deepest = text;
        current = error.source();
    }

    (cause, deepest)
}
