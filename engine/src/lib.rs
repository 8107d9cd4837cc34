//! Chaos proxy engine
//!
//! The request-side core of the chaos reverse proxy: shared state (config,
//! rules, bounded log ring with broadcast fan-out), first-match rule lookup,
//! per-rule token buckets, and the pre/post chaos pipeline. The HTTP
//! surfaces live in the `server` crate; this crate is pure logic.

pub mod bucket;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use bucket::{BucketDecision, TokenBucketRegistry};
pub use error::{EngineError, EngineResult};
pub use matcher::PathMatcher;
pub use pipeline::{ImmediateResponse, PostEffects, PreDecision, PreOutcome};
pub use state::ChaosEngine;
pub use types::{
    ChaosKind, ConfigPatch, LogStatus, ProxyConfig, RequestLog, Rule, RuleDraft, ServerMessage,
};
