//! Per-rule token buckets with lazy refill
//!
//! Buckets are keyed by `"<METHOD>:<ruleId>"` so each method sees its own
//! allowance. A bucket is created full on first use and refilled lazily on
//! every consume attempt; `rps`/`burst` are refreshed from the rule on each
//! call so live rule edits take effect immediately.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDecision {
    Allowed,
    Blocked { retry_after_secs: u64 },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Registry of all token buckets.
#[derive(Debug, Default)]
pub struct TokenBucketRegistry {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill the bucket for `key` and try to take one token.
    ///
    /// The critical section is pure arithmetic and never held across await.
    pub fn try_consume(&self, key: &str, rps: f64, burst: f64) -> BucketDecision {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("token bucket registry mutex recovered after panic");
                poisoned.into_inner()
            }
        };

        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rps).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            BucketDecision::Allowed
        } else {
            let retry_after = if rps > 0.0 {
                let secs = ((1.0 - bucket.tokens) / rps).ceil();
                if secs.is_finite() {
                    (secs as u64).max(1)
                } else {
                    1
                }
            } else {
                1
            };
            BucketDecision::Blocked {
                retry_after_secs: retry_after,
            }
        }
    }

    /// Drop every bucket belonging to `rule_id`.
    pub fn remove_rule(&self, rule_id: &str) {
        let suffix = format!(":{rule_id}");
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.retain(|key, _| !key.ends_with(&suffix));
        }
    }

    /// Reset the registry. Test-only escape hatch.
    pub fn clear_all(&self) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
