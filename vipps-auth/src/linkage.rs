//! Linking Vipps identities to local user accounts.
//!
//! After the login flow has produced claims, [`AccountLinker`] decides what happens to
//! the browser: log in the linked account, ask for the password of an account with the
//! same email, register a new account, or refuse. Persistent storage is reached through
//! the [`UserStore`] trait only.

use std::sync::Arc;

use async_trait::async_trait;
use events::{EventPublisher, Id, LoginEvent};
use log::*;
use rand::RngCore;
use secrecy::SecretString;

use crate::error::{response_error, Error, ErrorKind};
use crate::session::Claims;

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// A local account as seen by the linkage logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: Id,
    pub email: String,
    pub username: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub active: bool,
}

impl LocalUser {
    /// Name to greet the user with.
    pub fn friendly_name(&self) -> &str {
        self.given_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }
}

/// Account to create for a first-time Vipps user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    /// Random password the user never sees. They log in through Vipps.
    pub password: SecretString,
    pub active: bool,
}

impl NewUser {
    /// New active account using the email as username and a random 32 character password.
    pub fn from_email(email: &str) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            email: email.to_string(),
            username: email.to_string(),
            password: SecretString::new(hex::encode(bytes)),
            active: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

impl ProfileUpdate {
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            given_name: claims.given_name().map(str::to_string),
            family_name: claims.family_name().map(str::to_string),
        }
    }
}

/// One-to-one binding between a provider subject and a local account. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLink {
    pub external_subject: String,
    pub user_id: Id,
}

/// Consumer-provided user management.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: Id) -> Result<Option<LocalUser>, StoreError>;

    /// The account linked to `external_subject`, if the link and the account exist.
    async fn find_by_external_subject(
        &self,
        external_subject: &str,
    ) -> Result<Option<LocalUser>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<LocalUser>, StoreError>;

    async fn create_user(&self, user: NewUser) -> Result<LocalUser, StoreError>;

    /// Remove an account created by [`UserStore::create_user`] that could not be linked.
    async fn delete_user(&self, user_id: Id) -> Result<(), StoreError>;

    async fn update_profile(
        &self,
        user_id: Id,
        update: ProfileUpdate,
    ) -> Result<LocalUser, StoreError>;

    async fn create_link(&self, link: ExternalLink) -> Result<(), StoreError>;

    async fn verify_password(&self, user_id: Id, password: &str) -> Result<bool, StoreError>;
}

/// Whether unknown Vipps users may get a new account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    Open,
    Closed,
}

impl From<bool> for RegistrationPolicy {
    fn from(allowed: bool) -> Self {
        if allowed {
            RegistrationPolicy::Open
        } else {
            RegistrationPolicy::Closed
        }
    }
}

/// Result of [`AccountLinker::link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkageOutcome {
    /// An already linked account was logged in.
    LoggedIn(LocalUser),
    /// An unlinked account uses the same email; the user must confirm its password.
    ConfirmationRequired { user: LocalUser },
    /// A new account was created, linked and logged in.
    Registered(LocalUser),
}

/// Error attached to a single form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Result of [`AccountLinker::confirm_password`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordConfirmation {
    Linked(LocalUser),
    Rejected(FieldError),
}

fn storage(err: StoreError) -> Error {
    warn!("User store failed: {}", err);
    Error {
        source: Some(err),
        error_kind: ErrorKind::Storage,
    }
}

/// Verified email and subject of a claim set.
fn verified_identity(claims: &Claims) -> Result<(&str, &str), Error> {
    if claims.email_verified() != Some(true) {
        return Err(Error::new(ErrorKind::VerifiedEmailRequired));
    }
    let subject = claims
        .sub()
        .ok_or_else(|| response_error("Userinfo has no sub claim"))?;
    let email = claims
        .email()
        .filter(|email| !email.is_empty())
        .ok_or_else(|| response_error("Userinfo has no email claim"))?;
    Ok((subject, email))
}

#[derive(Clone)]
pub struct AccountLinker {
    store: Arc<dyn UserStore>,
    publisher: EventPublisher,
    policy: RegistrationPolicy,
}

impl AccountLinker {
    pub fn new(
        store: Arc<dyn UserStore>,
        publisher: EventPublisher,
        policy: RegistrationPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Decide the outcome of a completed login flow.
    pub async fn link(&self, claims: &Claims) -> Result<LinkageOutcome, Error> {
        let (subject, email) = verified_identity(claims)?;

        if let Some(user) = self
            .store
            .find_by_external_subject(subject)
            .await
            .map_err(storage)?
        {
            let user = self
                .store
                .update_profile(user.id, ProfileUpdate::from_claims(claims))
                .await
                .map_err(storage)?;
            self.logged_in(&user, subject).await;
            return Ok(LinkageOutcome::LoggedIn(user));
        }

        if let Some(user) = self.store.find_by_email(email).await.map_err(storage)? {
            debug!("Vipps email matches unlinked user {}", user.id);
            return Ok(LinkageOutcome::ConfirmationRequired { user });
        }

        if self.policy == RegistrationPolicy::Closed {
            info!("Refusing to register unknown Vipps user, registration is closed");
            return Err(Error::new(ErrorKind::RegistrationClosed));
        }

        let user = self
            .store
            .create_user(NewUser::from_email(email))
            .await
            .map_err(storage)?;
        if let Err(err) = self
            .store
            .create_link(ExternalLink {
                external_subject: subject.to_string(),
                user_id: user.id,
            })
            .await
        {
            if let Err(delete_err) = self.store.delete_user(user.id).await {
                error!(
                    "Could not remove unlinked user {} after failed registration: {}",
                    user.id, delete_err
                );
            }
            return Err(storage(err));
        }
        info!("Registered user {} from Vipps", user.id);
        self.publisher
            .publish(LoginEvent::Registered {
                user_id: user.id,
                external_subject: subject.to_string(),
            })
            .await;

        let user = self
            .store
            .update_profile(user.id, ProfileUpdate::from_claims(claims))
            .await
            .map_err(storage)?;
        self.logged_in(&user, subject).await;
        Ok(LinkageOutcome::Registered(user))
    }

    /// Link the account matching the Vipps email once the user proves they own it.
    pub async fn confirm_password(
        &self,
        claims: &Claims,
        password: &str,
    ) -> Result<PasswordConfirmation, Error> {
        let (subject, email) = verified_identity(claims)?;

        let Some(user) = self.store.find_by_email(email).await.map_err(storage)? else {
            return Ok(PasswordConfirmation::Rejected(FieldError {
                field: "email",
                message: "No account uses this email".to_string(),
            }));
        };

        if !self
            .store
            .verify_password(user.id, password)
            .await
            .map_err(storage)?
        {
            debug!("Password confirmation failed for user {}", user.id);
            return Ok(PasswordConfirmation::Rejected(FieldError {
                field: "password",
                message: "Invalid password".to_string(),
            }));
        }

        self.store
            .create_link(ExternalLink {
                external_subject: subject.to_string(),
                user_id: user.id,
            })
            .await
            .map_err(storage)?;
        info!("Connected user {} to Vipps", user.id);
        self.publisher
            .publish(LoginEvent::Connected {
                user_id: user.id,
                external_subject: subject.to_string(),
            })
            .await;
        self.logged_in(&user, subject).await;

        Ok(PasswordConfirmation::Linked(user))
    }

    /// Accept a completed continue flow. No account is touched.
    pub async fn continue_session(&self, claims: &Claims) -> Result<(), Error> {
        let (subject, _) = verified_identity(claims)?;
        self.publisher
            .publish(LoginEvent::Continued {
                external_subject: subject.to_string(),
            })
            .await;
        Ok(())
    }

    async fn logged_in(&self, user: &LocalUser, subject: &str) {
        self.publisher
            .publish(LoginEvent::LoggedIn {
                user_id: user.id,
                external_subject: subject.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::EventHandler;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Calls {
        created_users: usize,
        created_links: usize,
        profile_updates: usize,
    }

    #[derive(Default)]
    struct MockStore {
        users: Mutex<Vec<LocalUser>>,
        passwords: Mutex<HashMap<Id, String>>,
        links: Mutex<Vec<ExternalLink>>,
        calls: Mutex<Calls>,
        links_unavailable: bool,
    }

    impl MockStore {
        async fn with_user(self, email: &str, password: &str) -> (Self, LocalUser) {
            let user = LocalUser {
                id: Uuid::new_v4(),
                email: email.to_string(),
                username: email.to_string(),
                given_name: None,
                family_name: None,
                active: true,
            };
            self.users.lock().await.push(user.clone());
            self.passwords
                .lock()
                .await
                .insert(user.id, password.to_string());
            (self, user)
        }

        fn without_links(self) -> Self {
            Self {
                links_unavailable: true,
                ..self
            }
        }

        async fn with_link(self, subject: &str, user_id: Id) -> Self {
            self.links.lock().await.push(ExternalLink {
                external_subject: subject.to_string(),
                user_id,
            });
            self
        }
    }

    #[async_trait]
    impl UserStore for MockStore {
        async fn find_by_id(&self, user_id: Id) -> Result<Option<LocalUser>, StoreError> {
            let users = self.users.lock().await;
            Ok(users.iter().find(|u| u.id == user_id).cloned())
        }

        async fn find_by_external_subject(
            &self,
            external_subject: &str,
        ) -> Result<Option<LocalUser>, StoreError> {
            let links = self.links.lock().await;
            let Some(link) = links
                .iter()
                .find(|l| l.external_subject == external_subject)
            else {
                return Ok(None);
            };
            let users = self.users.lock().await;
            Ok(users.iter().find(|u| u.id == link.user_id).cloned())
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<LocalUser>, StoreError> {
            let users = self.users.lock().await;
            Ok(users.iter().find(|u| u.email == email).cloned())
        }

        async fn create_user(&self, user: NewUser) -> Result<LocalUser, StoreError> {
            self.calls.lock().await.created_users += 1;
            let created = LocalUser {
                id: Uuid::new_v4(),
                email: user.email,
                username: user.username,
                given_name: None,
                family_name: None,
                active: user.active,
            };
            self.users.lock().await.push(created.clone());
            Ok(created)
        }

        async fn delete_user(&self, user_id: Id) -> Result<(), StoreError> {
            self.users.lock().await.retain(|u| u.id != user_id);
            Ok(())
        }

        async fn update_profile(
            &self,
            user_id: Id,
            update: ProfileUpdate,
        ) -> Result<LocalUser, StoreError> {
            self.calls.lock().await.profile_updates += 1;
            let mut users = self.users.lock().await;
            let user = users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or("no such user")?;
            user.given_name = update.given_name;
            user.family_name = update.family_name;
            Ok(user.clone())
        }

        async fn create_link(&self, link: ExternalLink) -> Result<(), StoreError> {
            self.calls.lock().await.created_links += 1;
            if self.links_unavailable {
                return Err("link table unavailable".into());
            }
            self.links.lock().await.push(link);
            Ok(())
        }

        async fn verify_password(&self, user_id: Id, password: &str) -> Result<bool, StoreError> {
            let passwords = self.passwords.lock().await;
            Ok(passwords.get(&user_id).map(String::as_str) == Some(password))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<LoginEvent>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &LoginEvent) {
            self.events.lock().await.push(event.clone());
        }
    }

    impl RecordingHandler {
        async fn names(&self) -> Vec<&'static str> {
            self.events.lock().await.iter().map(LoginEvent::name).collect()
        }
    }

    fn linker(
        store: Arc<MockStore>,
        policy: RegistrationPolicy,
    ) -> (AccountLinker, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let publisher = EventPublisher::new().with_handler(handler.clone());
        (AccountLinker::new(store, publisher, policy), handler)
    }

    fn verified_claims() -> Claims {
        serde_json::from_value(json!({
            "sub": "vipps-sub-1",
            "email": "kari@example.no",
            "email_verified": true,
            "given_name": "Kari",
            "family_name": "Nordmann"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_linked_subject_logs_in_and_updates_profile() {
        let (store, user) = MockStore::default()
            .with_user("old@example.no", "secret")
            .await;
        let store = Arc::new(store.with_link("vipps-sub-1", user.id).await);
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Closed);

        let outcome = linker.link(&verified_claims()).await.unwrap();

        let LinkageOutcome::LoggedIn(logged_in) = outcome else {
            panic!("expected LoggedIn, got {:?}", outcome);
        };
        assert_eq!(logged_in.id, user.id);
        assert_eq!(logged_in.given_name.as_deref(), Some("Kari"));
        assert_eq!(logged_in.family_name.as_deref(), Some("Nordmann"));
        assert_eq!(handler.names().await, vec!["logged_in"]);
        assert_eq!(store.calls.lock().await.created_users, 0);
    }

    #[tokio::test]
    async fn test_email_match_requires_confirmation_without_side_effects() {
        let (store, user) = MockStore::default()
            .with_user("kari@example.no", "secret")
            .await;
        let store = Arc::new(store);
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Open);

        let outcome = linker.link(&verified_claims()).await.unwrap();

        assert_eq!(outcome, LinkageOutcome::ConfirmationRequired { user });
        let calls = store.calls.lock().await;
        assert_eq!(calls.created_users, 0);
        assert_eq!(calls.created_links, 0);
        assert_eq!(calls.profile_updates, 0);
        assert!(handler.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_is_registered_when_open() {
        let store = Arc::new(MockStore::default());
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Open);

        let outcome = linker.link(&verified_claims()).await.unwrap();

        let LinkageOutcome::Registered(user) = outcome else {
            panic!("expected Registered, got {:?}", outcome);
        };
        assert_eq!(user.email, "kari@example.no");
        assert_eq!(user.username, "kari@example.no");
        assert!(user.active);
        assert_eq!(user.given_name.as_deref(), Some("Kari"));

        let links = store.links.lock().await;
        assert_eq!(
            *links,
            vec![ExternalLink {
                external_subject: "vipps-sub-1".to_string(),
                user_id: user.id,
            }]
        );
        assert_eq!(store.calls.lock().await.created_users, 1);
        assert_eq!(handler.names().await, vec!["registered", "logged_in"]);
    }

    #[tokio::test]
    async fn test_failed_link_removes_registered_user() {
        let store = Arc::new(MockStore::default().without_links());
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Open);

        let err = linker.link(&verified_claims()).await.unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::Storage);
        assert_eq!(store.calls.lock().await.created_users, 1);
        assert!(store
            .find_by_email("kari@example.no")
            .await
            .unwrap()
            .is_none());
        assert!(handler.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected_when_closed() {
        let store = Arc::new(MockStore::default());
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Closed);

        let err = linker.link(&verified_claims()).await.unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::RegistrationClosed);
        let calls = store.calls.lock().await;
        assert_eq!(calls.created_users, 0);
        assert_eq!(calls.created_links, 0);
        assert_eq!(calls.profile_updates, 0);
        assert!(handler.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unverified_email_is_rejected_before_lookup() {
        let (store, user) = MockStore::default()
            .with_user("kari@example.no", "secret")
            .await;
        let store = Arc::new(store.with_link("vipps-sub-1", user.id).await);
        let (linker, handler) = linker(store, RegistrationPolicy::Open);

        for verified in [json!(false), json!(null), json!("true")] {
            let claims: Claims = serde_json::from_value(json!({
                "sub": "vipps-sub-1",
                "email": "kari@example.no",
                "email_verified": verified
            }))
            .unwrap();
            let err = linker.link(&claims).await.unwrap_err();
            assert_eq!(err.error_kind, ErrorKind::VerifiedEmailRequired);
        }
        assert!(handler.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_correct_password_links_account() {
        let (store, user) = MockStore::default()
            .with_user("kari@example.no", "secret")
            .await;
        let store = Arc::new(store);
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Closed);

        let result = linker
            .confirm_password(&verified_claims(), "secret")
            .await
            .unwrap();

        assert_eq!(result, PasswordConfirmation::Linked(user.clone()));
        assert_eq!(
            store
                .find_by_external_subject("vipps-sub-1")
                .await
                .unwrap()
                .map(|u| u.id),
            Some(user.id)
        );
        assert_eq!(handler.names().await, vec!["connected", "logged_in"]);
    }

    #[tokio::test]
    async fn test_wrong_password_is_field_error() {
        let (store, _) = MockStore::default()
            .with_user("kari@example.no", "secret")
            .await;
        let store = Arc::new(store);
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Closed);

        let result = linker
            .confirm_password(&verified_claims(), "guess")
            .await
            .unwrap();

        assert_eq!(
            result,
            PasswordConfirmation::Rejected(FieldError {
                field: "password",
                message: "Invalid password".to_string(),
            })
        );
        assert_eq!(store.calls.lock().await.created_links, 0);
        assert!(handler.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_continue_session_emits_continued_only() {
        let store = Arc::new(MockStore::default());
        let (linker, handler) = linker(store.clone(), RegistrationPolicy::Open);

        linker.continue_session(&verified_claims()).await.unwrap();

        assert_eq!(
            *handler.events.lock().await,
            vec![LoginEvent::Continued {
                external_subject: "vipps-sub-1".to_string()
            }]
        );
        assert_eq!(store.calls.lock().await.created_users, 0);
    }

    #[tokio::test]
    async fn test_continue_session_requires_verified_email() {
        let (linker, _) = linker(Arc::new(MockStore::default()), RegistrationPolicy::Open);
        let claims: Claims = serde_json::from_value(json!({"sub": "vipps-sub-1"})).unwrap();

        let err = linker.continue_session(&claims).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::VerifiedEmailRequired);
    }

    #[test]
    fn test_new_user_password_is_random() {
        use secrecy::ExposeSecret;

        let first = NewUser::from_email("a@example.no");
        let second = NewUser::from_email("a@example.no");
        assert_eq!(first.password.expose_secret().len(), 32);
        assert_ne!(
            first.password.expose_secret(),
            second.password.expose_secret()
        );
    }

    #[test]
    fn test_friendly_name_falls_back_to_username() {
        let mut user = LocalUser {
            id: Uuid::new_v4(),
            email: "kari@example.no".to_string(),
            username: "kari@example.no".to_string(),
            given_name: None,
            family_name: None,
            active: true,
        };
        assert_eq!(user.friendly_name(), "kari@example.no");
        user.given_name = Some("Kari".to_string());
        assert_eq!(user.friendly_name(), "Kari");
    }
}
