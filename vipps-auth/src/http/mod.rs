//! HTTP transport construction.
//!
//! The flow engine never builds its own client: one is constructed at startup and
//! handed to [`crate::oidc::FlowEngine::new`].

mod client;

pub use client::{HttpClientBuilder, HttpClientConfig};
