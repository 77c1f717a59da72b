use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{AuthEvents, AuthProvider, Credentials, Session, SessionCell, User};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Sign-up returns a full session when the project auto-confirms, or just the
/// user record when an email confirmation is pending.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    Pending(User),
}

/// Client for the hosted GoTrue-style auth API.
pub struct GoTrueAuth {
    base_url: String,
    anon_key: String,
    redirect_to: Option<String>,
    http: Client,
    session: SessionCell,
}

impl GoTrueAuth {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            redirect_to: None,
            http,
            session: SessionCell::new(),
        })
    }

    /// Where confirmation emails send the user after sign-up.
    pub fn with_redirect(mut self, redirect_to: Option<String>) -> Self {
        self.redirect_to = redirect_to;
        self
    }

    /// The session slot, shared with the REST store so it can send the bearer token.
    pub fn sessions(&self) -> SessionCell {
        self.session.clone()
    }

    /// Exchange a stored refresh token for a fresh session.
    pub async fn restore_session(&self, refresh_token: &str) -> Result<User> {
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        let session = token.into_session();
        let user = session.user.clone();
        log::info!("restored session for {}", user.id);
        self.session.set(Some(session));
        Ok(user)
    }

    fn sign_up_request(&self, credentials: &Credentials) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}/auth/v1/signup", self.base_url))
            .header("apikey", &self.anon_key);
        if let Some(redirect) = &self.redirect_to {
            req = req.query(&[("redirect_to", redirect)]);
        }
        req.json(&serde_json::json!({
            "email": credentials.email,
            "password": credentials.password,
        }))
    }

    /// Refresh token of the current session, for persisting in the keyring.
    pub fn refresh_token(&self) -> Option<String> {
        self.session.get().map(|s| s.refresh_token)
    }
}

#[async_trait]
impl AuthProvider for GoTrueAuth {
    async fn current_user(&self) -> Option<User> {
        let session = self.session.get()?;
        if session.is_expired(Utc::now()) {
            log::debug!("access token expired, refreshing");
            return match self.restore_session(&session.refresh_token).await {
                Ok(user) => Some(user),
                Err(e) => {
                    log::warn!("session refresh failed: {}", e);
                    self.session.set(None);
                    None
                }
            };
        }
        Some(session.user)
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<User> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }))
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        let session = token.into_session();
        let user = session.user.clone();
        log::info!("signed in as {}", user.id);
        self.session.set(Some(session));
        Ok(user)
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<Option<User>> {
        let resp = self.sign_up_request(credentials).send().await?;
        match read_json::<SignUpResponse>(resp).await? {
            SignUpResponse::Session(token) => {
                let session = token.into_session();
                let user = session.user.clone();
                log::info!("signed up and signed in as {}", user.id);
                self.session.set(Some(session));
                Ok(Some(user))
            }
            SignUpResponse::Pending(user) => {
                log::info!("signed up {}, awaiting email confirmation", user.id);
                Ok(None)
            }
        }
    }

    async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.session.get() else {
            return Ok(());
        };
        // Local scope: the session is dropped here regardless of what the server says.
        self.session.set(None);

        let url = format!("{}/auth/v1/logout?scope=local", self.base_url);
        let result = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status();
                let message = error_message(resp).await;
                log::warn!("logout returned {}: {}", status, message);
                Err(Error::Auth(message))
            }
            Err(e) => {
                log::warn!("logout request failed: {}", e);
                Err(Error::Http(e))
            }
        }
    }

    fn subscribe(&self) -> AuthEvents {
        self.session.subscribe()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(Error::Auth(error_message(resp).await));
    }
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| Error::Decode(format!("auth response: {}", e)))
}

/// Pull the human-readable message out of an auth error body.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    parse_error_body(status, &text)
}

fn parse_error_body(status: StatusCode, text: &str) -> String {
    let body: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Authentication failed ({})", status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert_eq!(
            parse_error_body(StatusCode::BAD_REQUEST, body),
            "Invalid login credentials"
        );
        assert_eq!(
            parse_error_body(StatusCode::UNPROCESSABLE_ENTITY, r#"{"code":422,"msg":"User already registered"}"#),
            "User already registered"
        );
        assert_eq!(
            parse_error_body(StatusCode::BAD_GATEWAY, "<html>"),
            "Authentication failed (502 Bad Gateway)"
        );
    }

    #[test]
    fn sign_up_response_shapes() {
        let pending = r#"{"id":"0b7c8b6e-1a2b-4c3d-8e9f-0a1b2c3d4e5f","email":"a@b.c"}"#;
        assert!(matches!(
            serde_json::from_str::<SignUpResponse>(pending).unwrap(),
            SignUpResponse::Pending(_)
        ));
        let full = r#"{"access_token":"t","refresh_token":"r","expires_in":3600,
            "user":{"id":"0b7c8b6e-1a2b-4c3d-8e9f-0a1b2c3d4e5f","email":"a@b.c"}}"#;
        let SignUpResponse::Session(token) = serde_json::from_str(full).unwrap() else {
            panic!("expected a session");
        };
        let session = token.into_session();
        assert!(!session.is_expired(Utc::now()));
    }

    #[test]
    fn sign_up_carries_encoded_redirect() {
        let auth = GoTrueAuth::new("https://backend.test/", "anon", Duration::from_secs(5))
            .unwrap()
            .with_redirect(Some("https://x.io/a b?c=d".into()));
        let creds = Credentials::new("me@example.com", "secret").unwrap();
        let req = auth.sign_up_request(&creds).build().unwrap();

        assert_eq!(req.url().path(), "/auth/v1/signup");
        let pairs: Vec<(String, String)> = req.url().query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("redirect_to".to_string(), "https://x.io/a b?c=d".to_string())]);
        assert!(!req.url().query().unwrap_or("").contains(' '));
    }

    #[test]
    fn sign_up_without_redirect_has_no_query() {
        let auth = GoTrueAuth::new("https://backend.test", "anon", Duration::from_secs(5)).unwrap();
        let creds = Credentials::new("me@example.com", "secret").unwrap();
        let req = auth.sign_up_request(&creds).build().unwrap();
        assert_eq!(req.url().query(), None);
    }
}
