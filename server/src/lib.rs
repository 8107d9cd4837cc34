//! Chaos proxy server
//!
//! HTTP surfaces around the `engine` crate: the forwarding proxy under
//! `/proxy`, the management REST API, and the `/ws` real-time log feed.

pub mod error;
pub mod server;
pub mod services;
pub mod web;

// Re-export commonly used types
pub use error::{ServerError, ServerResult};
pub use server::{AppState, ConnectionKill, ProxyServer};
pub use services::upstream::{HttpUpstreamClient, UpstreamClient};
