//! OpenID Connect flow against Vipps.
//!
//! Provides the authorization code flow with signed state and optional PKCE for the
//! "automatic return from app" variant.

pub mod discovery;
mod flow;
mod pkce;
mod state;

pub use discovery::DiscoveryResolver;
pub use flow::{AuthorizationRequest, FlowEngine};
pub use pkce::{verify_challenge, PkceChallenge, PkceGenerator, PkceVerifier};
pub use state::{FlowState, StateCodec};
