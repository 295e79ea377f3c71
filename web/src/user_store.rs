//! In-memory [`UserStore`] used by the server binary and the router tests.
//!
//! Passwords are stored as `password-auth` hashes. Sites with a real user database
//! implement [`UserStore`] against it instead.

use std::collections::HashMap;

use async_trait::async_trait;
use events::Id;
use log::*;
use password_auth::{generate_hash, verify_password};
use secrecy::ExposeSecret;
use tokio::sync::RwLock;
use uuid::Uuid;
use vipps_auth::linkage::{ExternalLink, LocalUser, NewUser, ProfileUpdate, StoreError, UserStore};

struct StoredUser {
    user: LocalUser,
    password_hash: String,
}

#[derive(Default)]
struct Users {
    by_id: HashMap<Id, StoredUser>,
    // external subject -> user id
    links: HashMap<String, Id>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<Users>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active local account that is not linked to Vipps.
    pub async fn add_user(&self, email: &str, password: &str) -> LocalUser {
        let user = LocalUser {
            id: Uuid::new_v4(),
            email: email.to_string(),
            username: email.to_string(),
            given_name: None,
            family_name: None,
            active: true,
        };
        self.users.write().await.by_id.insert(
            user.id,
            StoredUser {
                user: user.clone(),
                password_hash: generate_hash(password),
            },
        );
        user
    }

    /// The account linked to `external_subject`, if any.
    pub async fn linked_user_id(&self, external_subject: &str) -> Option<Id> {
        self.users.read().await.links.get(external_subject).copied()
    }
}

fn find_email<'a>(users: &'a Users, email: &str) -> Option<&'a StoredUser> {
    users
        .by_id
        .values()
        .find(|stored| stored.user.email.eq_ignore_ascii_case(email))
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, user_id: Id) -> Result<Option<LocalUser>, StoreError> {
        let users = self.users.read().await;
        Ok(users.by_id.get(&user_id).map(|stored| stored.user.clone()))
    }

    async fn find_by_external_subject(
        &self,
        external_subject: &str,
    ) -> Result<Option<LocalUser>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .links
            .get(external_subject)
            .and_then(|id| users.by_id.get(id))
            .map(|stored| stored.user.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<LocalUser>, StoreError> {
        let users = self.users.read().await;
        Ok(find_email(&users, email).map(|stored| stored.user.clone()))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<LocalUser, StoreError> {
        let mut users = self.users.write().await;
        if find_email(&users, &new_user.email).is_some() {
            return Err(format!("A user with email {} already exists", new_user.email).into());
        }

        let user = LocalUser {
            id: Uuid::new_v4(),
            email: new_user.email,
            username: new_user.username,
            given_name: None,
            family_name: None,
            active: new_user.active,
        };
        debug!("Creating user {}", user.id);
        users.by_id.insert(
            user.id,
            StoredUser {
                user: user.clone(),
                password_hash: generate_hash(new_user.password.expose_secret()),
            },
        );
        Ok(user)
    }

    async fn delete_user(&self, user_id: Id) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        debug!("Deleting user {}", user_id);
        users.by_id.remove(&user_id);
        users.links.retain(|_, linked| *linked != user_id);
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: Id,
        update: ProfileUpdate,
    ) -> Result<LocalUser, StoreError> {
        let mut users = self.users.write().await;
        let stored = users
            .by_id
            .get_mut(&user_id)
            .ok_or_else(|| format!("No user with id {}", user_id))?;
        if update.given_name.is_some() {
            stored.user.given_name = update.given_name;
        }
        if update.family_name.is_some() {
            stored.user.family_name = update.family_name;
        }
        Ok(stored.user.clone())
    }

    async fn create_link(&self, link: ExternalLink) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if !users.by_id.contains_key(&link.user_id) {
            return Err(format!("No user with id {}", link.user_id).into());
        }
        if users.links.contains_key(&link.external_subject) {
            return Err("Vipps identity is already linked".into());
        }
        if users.links.values().any(|id| *id == link.user_id) {
            return Err(format!("User {} is already linked to Vipps", link.user_id).into());
        }
        users.links.insert(link.external_subject, link.user_id);
        Ok(())
    }

    async fn verify_password(&self, user_id: Id, password: &str) -> Result<bool, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .by_id
            .get(&user_id)
            .is_some_and(|stored| verify_password(password, &stored.password_hash).is_ok()))
    }
}
