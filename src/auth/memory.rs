use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{AuthEvents, AuthProvider, Credentials, Session, SessionCell, User};
use crate::error::{Error, Result};

/// In-process auth provider: accounts live in a map, sessions never expire.
#[derive(Default)]
pub struct MemoryAuth {
    accounts: Mutex<HashMap<String, (String, Uuid)>>,
    session: SessionCell,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider with one account already signed in.
    pub fn signed_in(email: &str) -> Self {
        let auth = Self::new();
        let id = Uuid::new_v4();
        auth.lock().insert(email.to_string(), (String::new(), id));
        auth.session.set(Some(fake_session(id, email)));
        auth
    }

    pub fn sessions(&self) -> SessionCell {
        self.session.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Uuid)>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn fake_session(id: Uuid, email: &str) -> Session {
    Session {
        access_token: format!("memory-{}", id),
        refresh_token: format!("memory-refresh-{}", id),
        expires_at: None,
        user: User {
            id,
            email: Some(email.to_string()),
        },
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn current_user(&self) -> Option<User> {
        self.session.get().map(|s| s.user)
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<User> {
        let id = match self.lock().get(&credentials.email) {
            Some((password, id)) if *password == credentials.password => *id,
            _ => return Err(Error::Auth("Invalid login credentials".into())),
        };
        let session = fake_session(id, &credentials.email);
        let user = session.user.clone();
        self.session.set(Some(session));
        Ok(user)
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<Option<User>> {
        let id = {
            let mut accounts = self.lock();
            if accounts.contains_key(&credentials.email) {
                return Err(Error::Auth("User already registered".into()));
            }
            let id = Uuid::new_v4();
            accounts.insert(credentials.email.clone(), (credentials.password.clone(), id));
            id
        };
        let session = fake_session(id, &credentials.email);
        let user = session.user.clone();
        self.session.set(Some(session));
        Ok(Some(user))
    }

    async fn sign_out(&self) -> Result<()> {
        self.session.set(None);
        Ok(())
    }

    fn subscribe(&self) -> AuthEvents {
        self.session.subscribe()
    }
}
