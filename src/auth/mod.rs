pub mod gotrue;
pub mod keyring;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};

pub use gotrue::GoTrueAuth;
pub use memory::MemoryAuth;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let email = email.into().trim().to_string();
        let password = password.into();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Auth("Please enter a valid email address".into()));
        }
        if password.is_empty() {
            return Err(Error::Auth("Password is required".into()));
        }
        Ok(Self { email, password })
    }

    /// Sign-up form: the password has to be typed twice.
    pub fn for_sign_up(
        email: impl Into<String>,
        password: impl Into<String>,
        confirm: &str,
    ) -> Result<Self> {
        let creds = Self::new(email, password)?;
        if creds.password != confirm {
            return Err(Error::Auth("Passwords do not match".into()));
        }
        Ok(creds)
    }
}

/// Shared, observable slot holding the current session.
#[derive(Clone)]
pub struct SessionCell {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionCell {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl SessionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// Replace the session and notify subscribers if it changed.
    pub fn set(&self, session: Option<Session>) {
        self.tx.send_if_modified(|current| {
            if *current == session {
                false
            } else {
                *current = session;
                true
            }
        });
    }

    pub fn subscribe(&self) -> AuthEvents {
        AuthEvents { rx: self.tx.subscribe() }
    }
}

/// Subscription to session changes. Dropping it unsubscribes.
#[derive(Clone)]
pub struct AuthEvents {
    rx: watch::Receiver<Option<Session>>,
}

impl AuthEvents {
    pub fn current(&self) -> Option<Session> {
        self.rx.borrow().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.rx.borrow().as_ref().map(|s| s.user.clone())
    }

    /// Wait for the next sign-in, sign-out or refresh. Returns `None` once the
    /// provider has shut down.
    pub async fn changed(&mut self) -> Option<Option<User>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().as_ref().map(|s| s.user.clone()))
    }
}

/// The hosted auth capability.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<User>;

    async fn sign_in(&self, credentials: &Credentials) -> Result<User>;

    /// Returns `None` when the account still needs email confirmation.
    async fn sign_up(&self, credentials: &Credentials) -> Result<Option<User>>;

    /// Always clears the local session, even when the server call fails.
    async fn sign_out(&self) -> Result<()>;

    fn subscribe(&self) -> AuthEvents;
}

/// The signed-in user, or `NotAuthenticated` without touching the network.
pub async fn require_user(auth: &dyn AuthProvider) -> Result<User> {
    auth.current_user().await.ok_or(Error::NotAuthenticated)
}
