//! End-to-end proxy scenarios
//!
//! Each test runs a real proxy against a real in-process upstream and
//! drives it over actual sockets.

mod helpers;

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use engine::{ConfigPatch, LogStatus, RuleDraft};
use helpers::*;

#[tokio::test]
async fn test_plain_passthrough_preserves_bytes_headers_and_query() {
    let (proxy, engine, upstream) = spawn_proxy_with_upstream().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{proxy}/proxy/echo?a=1&a=2&b=x"))
        .header("x-echo-me", "roundtrip")
        .body("hello upstream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(response.headers().get("x-query").unwrap(), "a=1&a=2&b=x");
    assert_eq!(response.headers().get("x-echo-me").unwrap(), "roundtrip");
    assert_eq!(response.text().await.unwrap(), "hello upstream");
    assert_eq!(upstream.hit_count(), 1);

    let logs = engine.read_logs(Some(1)).await;
    assert_eq!(logs[0].status_code, LogStatus::Code(200));
    assert!(!logs[0].chaos_applied);
    assert_eq!(
        logs[0].actions_applied,
        vec![
            "match:no_rule".to_string(),
            "upstream:request".to_string(),
            "upstream:200".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_chaos_disabled_bypasses_matching() {
    let (proxy, engine, upstream) = spawn_proxy_with_upstream().await;
    engine
        .update_config(ConfigPatch {
            target_url: None,
            enabled: Some(false),
        })
        .await;
    // This rule would 500 every request if the pipeline ran.
    engine
        .create_rule(RuleDraft {
            error_status_code: Some(500),
            ..rule_draft("kill all", ".*", "error")
        })
        .await
        .unwrap();

    let response = reqwest::get(format!("http://{proxy}/proxy/anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.hit_count(), 1);

    let logs = engine.read_logs(Some(1)).await;
    assert_eq!(
        logs[0].actions_applied,
        vec![
            "chaos:disabled".to_string(),
            "upstream:request".to_string(),
            "upstream:200".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_latency_rule_delays_and_audits() {
    let (proxy, engine, _upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            latency_ms: Some(200),
            ..rule_draft("slow", "/a.*", "latency")
        })
        .await
        .unwrap();

    let started = Instant::now();
    let response = reqwest::get(format!("http://{proxy}/proxy/ax"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"k":1}"#);
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");

    let logs = engine.read_logs(Some(1)).await;
    assert!(logs[0].chaos_applied);
    assert_eq!(logs[0].chaos_type.as_deref(), Some("latency"));
    assert_eq!(
        logs[0].actions_applied,
        vec![
            "match:slow".to_string(),
            "upstream:request".to_string(),
            "upstream:200".to_string(),
            "latency:200ms".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_error_rule_responds_without_touching_upstream() {
    let (proxy, engine, upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            error_status_code: Some(503),
            error_message: Some("nope".to_string()),
            ..rule_draft("forced error", ".*", "error")
        })
        .await
        .unwrap();

    let response = reqwest::get(format!("http://{proxy}/proxy/whatever"))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], true);
    assert_eq!(body["message"], "nope");
    assert_eq!(body["chaosMonkey"], true);
    assert_eq!(upstream.hit_count(), 0);
}

#[tokio::test]
async fn test_token_bucket_allows_burst_then_blocks() {
    let (proxy, engine, _upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            rps: Some(2.0),
            burst: Some(2.0),
            ..rule_draft("bucket", ".*", "token-bucket")
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let mut statuses = Vec::new();
    let mut third_retry_after = None;
    for i in 0..4 {
        let response = client
            .get(format!("http://{proxy}/proxy/thing"))
            .send()
            .await
            .unwrap();
        if i == 2 {
            third_retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
        }
        statuses.push(response.status().as_u16());
    }

    assert_eq!(statuses, vec![200, 200, 429, 429]);
    assert_eq!(third_retry_after.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_timeout_rule_destroys_socket_without_response() {
    let (proxy, engine, _upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            timeout_ms: Some(300),
            jitter_ms: Some(0),
            ..rule_draft("hang", "/slow", "timeout")
        })
        .await
        .unwrap();

    let started = Instant::now();
    let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET /proxy/slow HTTP/1.1\r\nhost: proxy\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();

    // The socket must close without a single HTTP byte.
    let mut received = Vec::new();
    // Ok(0) on a FIN, Err on a hard reset; both mean no response arrived.
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        stream.read_to_end(&mut received),
    )
    .await
    .expect("socket should close well before five seconds");
    assert!(
        received.is_empty(),
        "expected no HTTP bytes, got {:?}",
        String::from_utf8_lossy(&received)
    );

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(280), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "elapsed {elapsed:?}");

    // The log entry was visible at the moment of entry, stamped "timeout"
    // with the planned duration.
    let logs = engine.read_logs(Some(1)).await;
    assert_eq!(logs[0].status_code, LogStatus::Timeout);
    assert_eq!(logs[0].response_time, 300);
    assert!(logs[0]
        .actions_applied
        .contains(&"timeout:triggered(ms=300)".to_string()));
}

#[tokio::test]
async fn test_corrupt_rule_mutates_one_top_level_element() {
    let (proxy, engine, _upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(rule_draft("corrupter", "/json", "corrupt"))
        .await
        .unwrap();

    let response = reqwest::get(format!("http://{proxy}/proxy/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    let object = body.as_object().unwrap();
    let nulls = object.values().filter(|v| v.is_null()).count();
    // Either one key was removed, or one value was nulled.
    assert!(
        (object.len() == 1 && nulls == 0) || (object.len() == 2 && nulls == 1),
        "unexpected corrupted body: {body}"
    );

    let logs = engine.read_logs(Some(1)).await;
    let corrupt_actions: Vec<&String> = logs[0]
        .actions_applied
        .iter()
        .filter(|a| a.starts_with("corrupt_json:"))
        .collect();
    assert_eq!(corrupt_actions.len(), 1);
}

#[tokio::test]
async fn test_drop_rate_zero_never_drops() {
    let (proxy, engine, upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            fail_rate: Some(0.0),
            ..rule_draft("never drop", ".*", "rate-limit")
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    for _ in 0..100 {
        let response = client
            .get(format!("http://{proxy}/proxy/thing"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(upstream.hit_count(), 100);
}

#[tokio::test]
async fn test_drop_rate_hundred_always_drops() {
    let (proxy, engine, upstream) = spawn_proxy_with_upstream().await;
    engine
        .create_rule(RuleDraft {
            fail_rate: Some(100.0),
            ..rule_draft("always drop", ".*", "rate-limit")
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    for _ in 0..20 {
        let response = client
            .get(format!("http://{proxy}/proxy/thing"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 429);
    }
    assert_eq!(upstream.hit_count(), 0);
}

#[tokio::test]
async fn test_missing_target_url_responds_503() {
    let engine = std::sync::Arc::new(engine::ChaosEngine::new());
    let proxy = spawn_proxy(engine.clone()).await;

    let response = reqwest::get(format!("http://{proxy}/proxy/x"))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "No target URL configured");

    let logs = engine.read_logs(Some(1)).await;
    assert!(!logs[0].chaos_applied);
    assert_eq!(logs[0].status_code, LogStatus::Code(503));
}

#[tokio::test]
async fn test_unreachable_upstream_responds_classified_502() {
    // Grab a port that nothing listens on.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = parked.local_addr().unwrap();
    drop(parked);

    let engine = std::sync::Arc::new(engine::ChaosEngine::new());
    engine
        .update_config(ConfigPatch {
            target_url: Some(format!("http://{dead_addr}")),
            enabled: None,
        })
        .await;
    let proxy = spawn_proxy(engine.clone()).await;

    let response = reqwest::get(format!("http://{proxy}/proxy/x"))
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Connection refused by upstream server");

    let logs = engine.read_logs(Some(1)).await;
    assert_eq!(logs[0].status_code, LogStatus::Code(502));
    assert!(logs[0]
        .actions_applied
        .contains(&"upstream:error:ECONNREFUSED".to_string()));
    assert_eq!(
        logs[0].chaos_details.as_deref(),
        Some("Proxy error: Connection refused by upstream server")
    );
}

#[tokio::test]
async fn test_upstream_status_is_preserved() {
    let (proxy, _engine, _upstream) = spawn_proxy_with_upstream().await;
    let response = reqwest::get(format!("http://{proxy}/proxy/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_appended_logs_reach_subscribers() {
    let (proxy, engine, _upstream) = spawn_proxy_with_upstream().await;
    let mut rx = engine.subscribe();

    reqwest::get(format!("http://{proxy}/proxy/thing"))
        .await
        .unwrap();

    let log = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status_code, LogStatus::Code(200));
    assert_eq!(log.method, "GET");
}
