//! Service implementations for the proxy server

pub mod upstream;

pub use upstream::{
    HttpUpstreamClient, UpstreamClient, UpstreamFailure, UpstreamRequest, UpstreamResponse,
};
