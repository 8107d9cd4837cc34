//! Server-specific error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server startup error: {0}")]
    Startup(String),

    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
