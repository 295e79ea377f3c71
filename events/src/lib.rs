//! Login notifications for the Vipps login workspace.
//!
//! The flow engine emits typed events at the points where a site integration usually
//! wants to hook in (audit logging, welcome mails, analytics). The crate has no
//! dependencies on the other workspace crates, so both `vipps-auth` and the web layer
//! can use it without cycles.
//!
//! # Architecture
//!
//! - **LoginEvent**: Enum of everything that can happen at the end of a flow
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a local user account.
pub type Id = Uuid;

/// Events emitted by the login and continue flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    /// An existing local account was linked to a Vipps identity after the user
    /// confirmed their password.
    Connected {
        user_id: Id,
        /// The provider's `sub` claim.
        external_subject: String,
    },
    /// A new local account was created from Vipps claims.
    Registered { user_id: Id, external_subject: String },
    /// A local user was logged in through Vipps.
    LoggedIn { user_id: Id, external_subject: String },
    /// A Vipps-only session was established through the continue flow.
    Continued { external_subject: String },
}

impl LoginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoginEvent::Connected { .. } => "connected",
            LoginEvent::Registered { .. } => "registered",
            LoginEvent::LoggedIn { .. } => "logged_in",
            LoginEvent::Continued { .. } => "continued",
        }
    }
}

/// Trait for handling login events.
/// Implementations can perform side effects like sending mails, writing audit
/// records, updating caches, etc.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &LoginEvent);
}

/// Publishes login events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish an event to all registered handlers, in order.
    pub async fn publish(&self, event: LoginEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
