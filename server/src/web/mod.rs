//! Web layer: HTTP handlers for the proxy, management, and real-time
//! surfaces

pub mod handlers;
