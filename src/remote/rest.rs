use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use uuid::Uuid;

use super::{Collection, Query, RemoteStore};
use crate::auth::AuthEvents;
use crate::core::Row;
use crate::error::{Error, Result};

/// Table store client speaking the PostgREST dialect of the hosted backend.
/// Row-level security on the server scopes every call to the signed-in user.
#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    anon_key: String,
    sessions: AuthEvents,
    http: Client,
}

impl RestStore {
    pub fn new(base_url: &str, anon_key: &str, sessions: AuthEvents, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            sessions,
            http,
        })
    }

    fn table_url(&self, collection: Collection) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection.table())
    }

    fn request(&self, method: Method, collection: Collection) -> RequestBuilder {
        let token = self
            .sessions
            .current()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.anon_key.clone());
        self.http
            .request(method, self.table_url(collection))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
    }

    fn by_id(id: Uuid) -> [(String, String); 1] {
        [("id".to_string(), format!("eq.{}", id))]
    }
}

async fn read_rows(resp: reqwest::Response) -> Result<Vec<Row>> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(Error::store(status.as_u16(), parse_error(status, &text)));
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).map_err(|e| Error::Decode(format!("store response: {}", e)))
}

/// PostgREST error bodies carry `message` (and sometimes `details`/`hint`).
fn parse_error(status: StatusCode, text: &str) -> String {
    let body: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    match body.get("message").and_then(|v| v.as_str()) {
        Some(msg) => msg.to_string(),
        None if text.is_empty() => status.to_string(),
        None => text.chars().take(200).collect(),
    }
}

fn single(rows: Vec<Row>, what: &str) -> Result<Row> {
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(what.to_string()))
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn list(&self, collection: Collection, query: &Query) -> Result<Vec<Row>> {
        log::debug!("GET {} {:?}", collection.table(), query.to_pairs());
        let resp = self
            .request(Method::GET, collection)
            .query(&[("select", "*")])
            .query(&query.to_pairs())
            .send()
            .await?;
        read_rows(resp).await
    }

    async fn insert(&self, collection: Collection, row: Row) -> Result<Row> {
        let resp = self
            .request(Method::POST, collection)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        single(read_rows(resp).await?, collection.table())
    }

    async fn update(&self, collection: Collection, id: Uuid, patch: Row) -> Result<Row> {
        let resp = self
            .request(Method::PATCH, collection)
            .query(&Self::by_id(id))
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        single(read_rows(resp).await?, &format!("{} {}", collection.table(), id))
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<()> {
        let resp = self
            .request(Method::DELETE, collection)
            .query(&Self::by_id(id))
            .send()
            .await?;
        read_rows(resp).await.map(|_| ())
    }

    async fn delete_where(&self, collection: Collection, query: &Query) -> Result<u64> {
        if query.filters.is_empty() {
            return Err(Error::InvalidInput("refusing to delete without a filter".into()));
        }
        let resp = self
            .request(Method::DELETE, collection)
            .query(&query.to_pairs())
            .header("Prefer", "return=representation")
            .send()
            .await?;
        Ok(read_rows(resp).await?.len() as u64)
    }
}
