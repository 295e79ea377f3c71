//! Local login sessions through `axum-login`, backed by the site's [`UserStore`].

use std::sync::Arc;

use async_trait::async_trait;
use axum_login::{AuthUser, AuthnBackend, UserId};
use events::Id;
use log::*;
use serde::Deserialize;
use vipps_auth::error::Error;
use vipps_auth::linkage::{LocalUser, StoreError, UserStore};
use vipps_auth::ErrorKind;

/// A local account logged in to this site.
#[derive(Debug, Clone)]
pub struct SiteUser(pub LocalUser);

impl AuthUser for SiteUser {
    type Id = Id;

    fn id(&self) -> Self::Id {
        self.0.id
    }

    // Accounts are only ever logged in through Vipps, so the id is a stable hash.
    fn session_auth_hash(&self) -> &[u8] {
        self.0.id.as_bytes()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Clone)]
pub struct Backend {
    store: Arc<dyn UserStore>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

fn storage(err: StoreError) -> Error {
    warn!("User store failed: {}", err);
    Error {
        source: Some(err),
        error_kind: ErrorKind::Storage,
    }
}

#[async_trait]
impl AuthnBackend for Backend {
    type User = SiteUser;
    type Credentials = Credentials;
    type Error = Error;

    async fn authenticate(
        &self,
        creds: Self::Credentials,
    ) -> Result<Option<Self::User>, Self::Error> {
        let Some(user) = self
            .store
            .find_by_email(&creds.email)
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };

        let valid = self
            .store
            .verify_password(user.id, &creds.password)
            .await
            .map_err(storage)?;
        Ok((valid && user.active).then_some(SiteUser(user)))
    }

    async fn get_user(&self, user_id: &UserId<Self>) -> Result<Option<Self::User>, Self::Error> {
        let user = self.store.find_by_id(*user_id).await.map_err(storage)?;
        Ok(user.filter(|user| user.active).map(SiteUser))
    }
}

pub type AuthSession = axum_login::AuthSession<Backend>;
