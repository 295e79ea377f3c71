//! # vipps-auth
//!
//! Login with Vipps for web applications:
//! - Authorization URL construction with signed state and optional PKCE
//! - Authorization code exchange and lazily fetched user claims
//! - OpenID discovery with a time-bounded cache
//! - The account linkage decision for the login flow
//! - Login button markup and return URL helpers
//!
//! ## Architecture
//!
//! The crate is framework agnostic. The `web` crate drives it from axum handlers:
//! `FlowEngine` produces a `Session`, and `AccountLinker` decides what that session
//! means for the local user database (reached through the `UserStore` trait).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vipps_auth::{
//!     cache::MemoryStore,
//!     http::HttpClientBuilder,
//!     oidc::FlowEngine,
//!     settings::Flow,
//! };
//!
//! let engine = FlowEngine::new(settings, HttpClientBuilder::new().build()?, Arc::new(MemoryStore::new()));
//! let request = engine.build_authorization_url(Flow::Login, None).await?;
//! ```

pub mod button;
pub mod cache;
pub mod error;
pub mod http;
pub mod linkage;
pub mod oidc;
pub mod redirect;
pub mod session;
pub mod settings;

// Re-export commonly used types
pub use error::{Error, ErrorKind};
pub use linkage::{AccountLinker, LinkageOutcome, LocalUser, PasswordConfirmation, UserStore};
pub use oidc::FlowEngine;
pub use session::{Claims, Session, UserInfoSource};
pub use settings::{Environment, Flow, Settings};
