//! Process-wide engine state
//!
//! [`ChaosEngine`] owns the proxy configuration, the ordered rule
//! collection, the bounded request-log ring and its broadcast fan-out, and
//! the token-bucket registry. It is shared behind an `Arc` between the
//! forwarder and the management handlers; every read hands out an owned
//! clone so callers cannot mutate stored state.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::bucket::TokenBucketRegistry;
use crate::error::{EngineError, EngineResult};
use crate::matcher;
use crate::types::{ConfigPatch, ProxyConfig, RequestLog, Rule, RuleDraft, LOG_RING_CAPACITY};

/// Capacity of the log broadcast channel. Slow subscribers lag and skip
/// messages; producers never block on them.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct ChaosEngine {
    config: RwLock<ProxyConfig>,
    rules: RwLock<Vec<Rule>>,
    logs: RwLock<VecDeque<RequestLog>>,
    log_tx: broadcast::Sender<RequestLog>,
    buckets: TokenBucketRegistry,
    started_at: Instant,
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self::with_config(ProxyConfig::default())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        let (log_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config: RwLock::new(config),
            rules: RwLock::new(Vec::new()),
            logs: RwLock::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            log_tx,
            buckets: TokenBucketRegistry::new(),
            started_at: Instant::now(),
        }
    }

    // Config

    pub async fn config(&self) -> ProxyConfig {
        self.config.read().await.clone()
    }

    /// Merge a patch into the config and return the result.
    pub async fn update_config(&self, patch: ConfigPatch) -> ProxyConfig {
        let mut config = self.config.write().await;
        if let Some(target_url) = patch.target_url {
            config.target_url = target_url;
        }
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        config.clone()
    }

    // Rules

    pub async fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    pub async fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// Create a rule from a draft, assigning an id when the draft carries
    /// none. Rules are appended: creation order is evaluation order.
    pub async fn create_rule(&self, draft: RuleDraft) -> EngineResult<Rule> {
        let rule = Rule::from_draft(draft)?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(EngineError::DuplicateRuleId { id: rule.id });
        }
        debug!("created rule {} ({})", rule.name, rule.id);
        rules.push(rule.clone());
        Ok(rule)
    }

    /// Merge a patch into an existing rule. The id is immutable.
    pub async fn update_rule(&self, id: &str, patch: RuleDraft) -> EngineResult<Rule> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::RuleNotFound { id: id.to_string() })?;
        rule.apply_patch(patch)?;
        Ok(rule.clone())
    }

    /// Delete a rule and its token buckets.
    pub async fn delete_rule(&self, id: &str) -> EngineResult<()> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(EngineError::RuleNotFound { id: id.to_string() });
        }
        self.buckets.remove_rule(id);
        debug!("deleted rule {id}");
        Ok(())
    }

    /// First enabled rule matching `path` and `method`, cloned out of the
    /// collection so no lock is held by the caller.
    pub async fn find_matching_rule(&self, path: &str, method: &str) -> Option<Rule> {
        let rules = self.rules.read().await;
        matcher::find_matching_rule(&rules, path, method).cloned()
    }

    // Logs

    /// Append a log entry, evicting the oldest once the ring is full, and
    /// broadcast it to subscribers.
    pub async fn append_log(&self, entry: RequestLog) {
        {
            let mut logs = self.logs.write().await;
            if logs.len() >= LOG_RING_CAPACITY {
                logs.pop_front();
            }
            logs.push_back(entry.clone());
        }
        // No receivers is fine; send only fails when nobody is listening.
        let _ = self.log_tx.send(entry);
    }

    /// Newest-first snapshot, optionally limited.
    pub async fn read_logs(&self, limit: Option<usize>) -> Vec<RequestLog> {
        let logs = self.logs.read().await;
        let take = limit.unwrap_or(logs.len()).min(logs.len());
        logs.iter().rev().take(take).cloned().collect()
    }

    pub async fn clear_logs(&self) -> usize {
        let mut logs = self.logs.write().await;
        let cleared = logs.len();
        logs.clear();
        cleared
    }

    /// Subscribe to the log feed. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestLog> {
        self.log_tx.subscribe()
    }

    // Buckets and misc

    pub fn buckets(&self) -> &TokenBucketRegistry {
        &self.buckets
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
