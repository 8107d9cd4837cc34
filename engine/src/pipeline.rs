//! The chaos pipeline: pre-upstream decisions and post-upstream effects
//!
//! The pipeline never re-matches between the pre and post stages. The
//! matched rule is carried on the [`PreDecision`] because the probabilistic
//! stages (drop rate, token bucket) are not idempotent.

use rand::Rng;
use serde_json::{json, Value};

use crate::bucket::BucketDecision;
use crate::state::ChaosEngine;
use crate::types::{ChaosKind, Rule, MAX_HANG_MS};

/// Terminal response produced by the pre-upstream stage.
#[derive(Debug, Clone)]
pub struct ImmediateResponse {
    pub status: u16,
    pub body: Value,
    pub retry_after_secs: Option<u64>,
}

/// What the forwarder should do after the pre-upstream stage.
#[derive(Debug, Clone)]
pub enum PreOutcome {
    /// Forward to upstream; the matched rule (if any) rides along on the
    /// decision for the post stage.
    Proceed,
    /// Write this response and stop; the upstream is never contacted.
    Respond(ImmediateResponse),
    /// Hold the TCP socket for `duration_ms`, then destroy it without ever
    /// writing an HTTP response.
    Hang { duration_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct PreDecision {
    pub outcome: PreOutcome,
    pub matched: Option<Rule>,
    pub actions: Vec<String>,
}

/// Effects the forwarder applies after the upstream response arrives.
#[derive(Debug, Clone, Default)]
pub struct PostEffects {
    pub delay_ms: u64,
    pub corrupt: bool,
    pub actions: Vec<String>,
}

/// Evaluate the pre-upstream stage for a request.
pub async fn evaluate_pre(engine: &ChaosEngine, path: &str, method: &str) -> PreDecision {
    let mut actions = Vec::new();

    let Some(rule) = engine.find_matching_rule(path, method).await else {
        actions.push("match:no_rule".to_string());
        return PreDecision {
            outcome: PreOutcome::Proceed,
            matched: None,
            actions,
        };
    };
    actions.push(format!("match:{}", rule.name));

    let outcome = match &rule.chaos {
        ChaosKind::DropRate { fail_rate } => {
            let sample: f64 = rand::thread_rng().gen_range(0.0..100.0);
            if sample < *fail_rate {
                actions.push(format!("drop_rate:triggered:{fail_rate}%"));
                PreOutcome::Respond(ImmediateResponse {
                    status: 429,
                    body: json!({
                        "error": true,
                        "message": "Too Many Requests (drop rate triggered)",
                        "chaosMonkey": true,
                    }),
                    retry_after_secs: None,
                })
            } else {
                actions.push(format!("drop_rate:passed:{fail_rate}%"));
                PreOutcome::Proceed
            }
        }
        ChaosKind::TokenBucket { rps, burst } => {
            let key = format!("{}:{}", method.to_ascii_uppercase(), rule.id);
            match engine.buckets().try_consume(&key, *rps, *burst) {
                BucketDecision::Allowed => {
                    actions.push("token_bucket:passed".to_string());
                    PreOutcome::Proceed
                }
                BucketDecision::Blocked { retry_after_secs } => {
                    actions.push(format!("token_bucket:blocked(retry_after={retry_after_secs})"));
                    PreOutcome::Respond(ImmediateResponse {
                        status: 429,
                        body: json!({
                            "error": true,
                            "message": "Too Many Requests (rate limited)",
                            "retryAfter": retry_after_secs,
                            "chaosMonkey": true,
                        }),
                        retry_after_secs: Some(retry_after_secs),
                    })
                }
            }
        }
        ChaosKind::Timeout {
            timeout_ms,
            jitter_ms,
        } => {
            let duration_ms = hang_duration(*timeout_ms, *jitter_ms);
            actions.push(format!("timeout:triggered(ms={duration_ms})"));
            PreOutcome::Hang { duration_ms }
        }
        ChaosKind::Error { status, message } => {
            actions.push(format!("error:{status}"));
            PreOutcome::Respond(ImmediateResponse {
                status: *status,
                body: json!({
                    "error": true,
                    "message": message,
                    "chaosMonkey": true,
                }),
                retry_after_secs: None,
            })
        }
        // Latency and corruption act after the upstream call.
        ChaosKind::Latency { .. } | ChaosKind::Corrupt => PreOutcome::Proceed,
    };

    PreDecision {
        outcome,
        matched: Some(rule),
        actions,
    }
}

/// Compute the post-upstream effects for the rule matched pre-upstream.
pub fn evaluate_post(matched: Option<&Rule>) -> PostEffects {
    let mut effects = PostEffects::default();
    match matched.map(|rule| &rule.chaos) {
        Some(ChaosKind::Latency {
            fixed_ms,
            min_ms,
            max_ms,
        }) => {
            let delay_ms = fixed_ms.unwrap_or_else(|| {
                if min_ms >= max_ms {
                    *min_ms
                } else {
                    rand::thread_rng().gen_range(*min_ms..=*max_ms)
                }
            });
            effects.delay_ms = delay_ms;
            effects.actions.push(format!("latency:{delay_ms}ms"));
        }
        Some(ChaosKind::Corrupt) => {
            // The corruption action tag depends on the actual body; it is
            // emitted by corrupt_json_body.
            effects.corrupt = true;
        }
        _ => {}
    }
    effects
}

/// `timeout_ms` plus uniform jitter in `[-jitter_ms, +jitter_ms]`, floored
/// at zero and capped at five minutes.
fn hang_duration(timeout_ms: u64, jitter_ms: u64) -> u64 {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-(jitter_ms as i64)..=jitter_ms as i64)
    };
    let duration = (timeout_ms as i64).saturating_add(jitter).max(0) as u64;
    duration.min(MAX_HANG_MS)
}

/// Mutate a JSON body by removing or nullifying one top-level element.
///
/// Never fails: anything that cannot be corrupted safely (non-JSON, empty
/// containers, primitives) is returned unchanged with a `corrupt_json:skipped`
/// action explaining why.
pub fn corrupt_json_body(body: &[u8]) -> (Vec<u8>, String) {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            return (
                body.to_vec(),
                "corrupt_json:skipped(reason=parse_error)".to_string(),
            )
        }
    };

    let mut rng = rand::thread_rng();
    let remove = rng.gen_bool(0.5);

    let action = match &mut value {
        Value::Array(items) => {
            if items.is_empty() {
                return (
                    body.to_vec(),
                    "corrupt_json:skipped(reason=empty_array)".to_string(),
                );
            }
            let index = rng.gen_range(0..items.len());
            if remove {
                items.remove(index);
                format!("corrupt_json:removed_index:{index}")
            } else {
                items[index] = Value::Null;
                format!("corrupt_json:null_index:{index}")
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                return (
                    body.to_vec(),
                    "corrupt_json:skipped(reason=empty_object)".to_string(),
                );
            }
            let pick = rng.gen_range(0..map.len());
            let key = match map.keys().nth(pick) {
                Some(key) => key.clone(),
                None => {
                    return (
                        body.to_vec(),
                        "corrupt_json:skipped(reason=empty_object)".to_string(),
                    )
                }
            };
            if remove {
                map.remove(&key);
                format!("corrupt_json:removed_key:{key}")
            } else {
                map.insert(key.clone(), Value::Null);
                format!("corrupt_json:null_value:{key}")
            }
        }
        _ => {
            return (
                body.to_vec(),
                "corrupt_json:skipped(reason=primitive_value)".to_string(),
            )
        }
    };

    let bytes = serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec());
    (bytes, action)
}
