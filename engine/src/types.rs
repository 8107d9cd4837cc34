//! Core data types for the chaos proxy engine
//!
//! The wire shapes (rule drafts, config patches, log entries, WebSocket
//! frames) are camelCase JSON. Internally a rule's chaos behaviour is the
//! tagged [`ChaosKind`] variant; the flat [`RuleDraft`] form only exists at
//! the management boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, EngineResult};
use crate::matcher::PathMatcher;

/// Maximum number of log entries retained in the ring.
pub const LOG_RING_CAPACITY: usize = 1000;

/// Upper bound on a timeout hang, regardless of configured value.
pub const MAX_HANG_MS: u64 = 5 * 60 * 1000;

pub const DEFAULT_LATENCY_MIN_MS: u64 = 100;
pub const DEFAULT_LATENCY_MAX_MS: u64 = 1000;
pub const DEFAULT_ERROR_STATUS: u16 = 500;
pub const DEFAULT_ERROR_MESSAGE: &str = "Internal Server Error";
pub const DEFAULT_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_FAIL_RATE: f64 = 50.0;
pub const DEFAULT_RPS: f64 = 10.0;

/// Proxy-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub target_url: String,
    pub enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            enabled: true,
        }
    }
}

/// Partial config update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// The failure mode a rule injects, with its per-variant parameters.
#[derive(Debug, Clone)]
pub enum ChaosKind {
    Latency {
        fixed_ms: Option<u64>,
        min_ms: u64,
        max_ms: u64,
    },
    Error {
        status: u16,
        message: String,
    },
    Timeout {
        timeout_ms: u64,
        jitter_ms: u64,
    },
    Corrupt,
    DropRate {
        fail_rate: f64,
    },
    TokenBucket {
        rps: f64,
        burst: f64,
    },
}

impl ChaosKind {
    /// The wire tag for this variant (`chaosType` in JSON).
    pub fn tag(&self) -> &'static str {
        match self {
            ChaosKind::Latency { .. } => "latency",
            ChaosKind::Error { .. } => "error",
            ChaosKind::Timeout { .. } => "timeout",
            ChaosKind::Corrupt => "corrupt",
            ChaosKind::DropRate { .. } => "rate-limit",
            ChaosKind::TokenBucket { .. } => "token-bucket",
        }
    }
}

/// A chaos rule: path/method filter plus a failure mode.
///
/// Insertion order of rules is their evaluation order.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub path_pattern: String,
    pub matcher: PathMatcher,
    pub methods: Vec<String>,
    pub chaos: ChaosKind,
}

impl Rule {
    /// Build a rule from the flat wire form. `name`, `pathPattern` and
    /// `chaosType` are required; everything else falls back to the
    /// per-variant defaults. An id is assigned when the draft carries none.
    pub fn from_draft(draft: RuleDraft) -> EngineResult<Self> {
        let name = draft
            .name
            .clone()
            .ok_or(EngineError::MissingField { field: "name" })?;
        let path_pattern = draft
            .path_pattern
            .clone()
            .ok_or(EngineError::MissingField { field: "pathPattern" })?;
        let chaos = draft.parse_chaos()?;

        let id = draft
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let matcher = PathMatcher::compile(&path_pattern);

        Ok(Self {
            id,
            name,
            enabled: draft.enabled.unwrap_or(true),
            path_pattern,
            matcher,
            methods: normalize_methods(draft.methods),
            chaos,
        })
    }

    /// Merge a flat patch into this rule. The id is immutable; a patched
    /// `pathPattern` is recompiled, and chaos parameters are merged over the
    /// current flat representation so partial updates behave like the wire
    /// shape suggests.
    pub fn apply_patch(&mut self, patch: RuleDraft) -> EngineResult<()> {
        let mut wire = self.to_wire();
        wire.merge(patch);
        wire.id = Some(self.id.clone());
        *self = Rule::from_draft(wire)?;
        Ok(())
    }

    /// The flat wire representation served by the management API.
    pub fn to_wire(&self) -> RuleDraft {
        let mut wire = RuleDraft {
            id: Some(self.id.clone()),
            name: Some(self.name.clone()),
            enabled: Some(self.enabled),
            path_pattern: Some(self.path_pattern.clone()),
            methods: Some(self.methods.clone()),
            chaos_type: Some(self.chaos.tag().to_string()),
            ..RuleDraft::default()
        };
        match &self.chaos {
            ChaosKind::Latency {
                fixed_ms,
                min_ms,
                max_ms,
            } => {
                wire.latency_ms = *fixed_ms;
                wire.latency_min_ms = Some(*min_ms);
                wire.latency_max_ms = Some(*max_ms);
            }
            ChaosKind::Error { status, message } => {
                wire.error_status_code = Some(*status);
                wire.error_message = Some(message.clone());
            }
            ChaosKind::Timeout {
                timeout_ms,
                jitter_ms,
            } => {
                wire.timeout_ms = Some(*timeout_ms);
                wire.jitter_ms = Some(*jitter_ms);
            }
            ChaosKind::Corrupt => {}
            ChaosKind::DropRate { fail_rate } => {
                wire.fail_rate = Some(*fail_rate);
            }
            ChaosKind::TokenBucket { rps, burst } => {
                wire.rps = Some(*rps);
                wire.burst = Some(*burst);
            }
        }
        wire
    }
}

/// Normalize a method filter: uppercase tokens, default to the wildcard,
/// and collapse to just `*` when the wildcard is present (it is absorbing).
fn normalize_methods(methods: Option<Vec<String>>) -> Vec<String> {
    let methods: Vec<String> = methods
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect();
    if methods.is_empty() || methods.iter().any(|m| m == "*") {
        vec!["*".to_string()]
    } else {
        methods
    }
}

/// Flat rule shape used on the wire, both for creation and patching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chaos_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_min_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<f64>,
}

impl RuleDraft {
    /// Overlay `other` onto `self`, field by field.
    fn merge(&mut self, other: RuleDraft) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(name);
        take!(enabled);
        take!(path_pattern);
        take!(methods);
        take!(chaos_type);
        take!(latency_ms);
        take!(latency_min_ms);
        take!(latency_max_ms);
        take!(error_status_code);
        take!(error_message);
        take!(timeout_ms);
        take!(jitter_ms);
        take!(fail_rate);
        take!(rps);
        take!(burst);
    }

    fn parse_chaos(&self) -> EngineResult<ChaosKind> {
        let tag = self
            .chaos_type
            .as_deref()
            .ok_or(EngineError::MissingField { field: "chaosType" })?;
        match tag {
            "latency" => {
                let min_ms = self.latency_min_ms.unwrap_or(DEFAULT_LATENCY_MIN_MS);
                let max_ms = self
                    .latency_max_ms
                    .unwrap_or(DEFAULT_LATENCY_MAX_MS)
                    .max(min_ms);
                Ok(ChaosKind::Latency {
                    fixed_ms: self.latency_ms,
                    min_ms,
                    max_ms,
                })
            }
            "error" => Ok(ChaosKind::Error {
                status: self.error_status_code.unwrap_or(DEFAULT_ERROR_STATUS),
                message: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            }),
            "timeout" => Ok(ChaosKind::Timeout {
                timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                jitter_ms: self.jitter_ms.unwrap_or(0),
            }),
            "corrupt" => Ok(ChaosKind::Corrupt),
            "rate-limit" => Ok(ChaosKind::DropRate {
                fail_rate: self.fail_rate.unwrap_or(DEFAULT_FAIL_RATE).clamp(0.0, 100.0),
            }),
            "token-bucket" => {
                let rps = self.rps.unwrap_or(DEFAULT_RPS).max(0.0);
                Ok(ChaosKind::TokenBucket {
                    rps,
                    burst: self.burst.unwrap_or(rps).max(0.0),
                })
            }
            other => Err(EngineError::UnknownChaosType {
                value: other.to_string(),
            }),
        }
    }
}

/// Response status recorded on a log entry: a real status code, or the
/// literal `"timeout"` for a hang that never produced an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStatus {
    Code(u16),
    Timeout,
}

impl Serialize for LogStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LogStatus::Code(code) => serializer.serialize_u16(*code),
            LogStatus::Timeout => serializer.serialize_str("timeout"),
        }
    }
}

impl<'de> Deserialize<'de> for LogStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(LogStatus::Code)
                .ok_or_else(|| serde::de::Error::custom("status code out of range")),
            serde_json::Value::String(s) if s == "timeout" => Ok(LogStatus::Timeout),
            other => Err(serde::de::Error::custom(format!(
                "invalid log status: {other}"
            ))),
        }
    }
}

/// One completed (or torn-down) proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub status_code: LogStatus,
    /// Total elapsed milliseconds; for a hang, the planned hold duration.
    pub response_time: u64,
    pub chaos_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chaos_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chaos_rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chaos_rule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chaos_details: Option<String>,
    pub actions_applied: Vec<String>,
}

/// Frames pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "new-log")]
    NewLog { log: RequestLog },
}
