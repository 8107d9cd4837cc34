//! Engine-specific error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("A rule with id {id} already exists")]
    DuplicateRuleId { id: String },

    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Unknown chaos type: {value}")]
    UnknownChaosType { value: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
