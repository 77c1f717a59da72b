pub mod memory;
pub mod rest;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::core::Row;
use crate::error::Result;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Tables of the hosted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Notes,
    Tasks,
}

impl Collection {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::Tasks => "tasks",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    IsNull(String),
    NotNull(String),
    Gte(String, Value),
    Lt(String, Value),
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _) | Self::IsNull(f) | Self::NotNull(f) | Self::Gte(f, _) | Self::Lt(f, _) => f,
        }
    }

    /// PostgREST operator syntax for the right-hand side of `field=...`.
    pub fn to_postgrest(&self) -> String {
        match self {
            Self::Eq(_, v) => format!("eq.{}", render(v)),
            Self::IsNull(_) => "is.null".to_string(),
            Self::NotNull(_) => "not.is.null".to_string(),
            Self::Gte(_, v) => format!("gte.{}", render(v)),
            Self::Lt(_, v) => format!("lt.{}", render(v)),
        }
    }

    /// Evaluate the filter against a row held in memory.
    pub fn matches(&self, row: &Row) -> bool {
        let value = row.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Self::Eq(_, v) => compare(value, v) == Some(Ordering::Equal),
            Self::IsNull(_) => value.is_null(),
            Self::NotNull(_) => !value.is_null(),
            Self::Gte(_, v) => matches!(compare(value, v), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt(_, v) => compare(value, v) == Some(Ordering::Less),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub ascending: bool,
}

/// Filter and ordering for a `list` or `delete_where` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, field: &str) -> Self {
        self.filters.push(Filter::IsNull(field.to_string()));
        self
    }

    pub fn not_null(mut self, field: &str) -> Self {
        self.filters.push(Filter::NotNull(field.to_string()));
        self
    }

    pub fn gte_time(mut self, field: &str, at: DateTime<Utc>) -> Self {
        self.filters.push(Filter::Gte(field.to_string(), Value::String(at.to_rfc3339())));
        self
    }

    pub fn lt_time(mut self, field: &str, at: DateTime<Utc>) -> Self {
        self.filters.push(Filter::Lt(field.to_string(), Value::String(at.to_rfc3339())));
        self
    }

    pub fn order_asc(mut self, field: &str) -> Self {
        self.order = Some(Order { field: field.to_string(), ascending: true });
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order = Some(Order { field: field.to_string(), ascending: false });
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Sort rows in memory by the query's ordering. Nulls sort last.
    pub fn sort(&self, rows: &mut [Row]) {
        let Some(order) = &self.order else { return };
        rows.sort_by(|a, b| {
            let va = a.get(&order.field).unwrap_or(&Value::Null);
            let vb = b.get(&order.field).unwrap_or(&Value::Null);
            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => return Ordering::Greater,
                (false, true) => return Ordering::Less,
                (false, false) => compare(va, vb).unwrap_or(Ordering::Equal),
            };
            if order.ascending { ord } else { ord.reverse() }
        });
    }

    /// Query-string pairs in PostgREST form.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|f| (f.field().to_string(), f.to_postgrest()))
            .collect();
        if let Some(order) = &self.order {
            let dir = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", order.field, dir)));
        }
        pairs
    }
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare two JSON scalars: timestamps chronologically, numbers numerically,
/// everything else by its textual form.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => Some(render(a).cmp(&render(b))),
    }
}

/// CRUD capability of the hosted table store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, collection: Collection, query: &Query) -> Result<Vec<Row>>;

    /// Insert a row and return it as stored, with server-assigned columns.
    async fn insert(&self, collection: Collection, row: Row) -> Result<Row>;

    async fn update(&self, collection: Collection, id: Uuid, patch: Row) -> Result<Row>;

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<()>;

    /// Delete every row matching `query`, returning how many went.
    async fn delete_where(&self, collection: Collection, query: &Query) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn row(v: Value) -> Row {
        let Value::Object(map) = v else { unreachable!() };
        map
    }

    #[test]
    fn postgrest_encoding() {
        let cutoff = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let q = Query::new()
            .not_null("deleted_at")
            .gte_time("deleted_at", cutoff)
            .order_desc("deleted_at");
        assert_eq!(
            q.to_pairs(),
            vec![
                ("deleted_at".to_string(), "not.is.null".to_string()),
                ("deleted_at".to_string(), "gte.2026-03-01T00:00:00+00:00".to_string()),
                ("order".to_string(), "deleted_at.desc".to_string()),
            ]
        );
        assert_eq!(Query::new().eq("note_id", "abc").to_pairs()[0].1, "eq.abc");
    }

    #[test]
    fn timestamps_compare_chronologically_across_offsets() {
        let now = Utc::now();
        let q = Query::new().gte_time("deleted_at", now - Duration::days(7));
        let recent = row(json!({ "deleted_at": (now - Duration::days(6)).to_rfc3339() }));
        let old = row(json!({ "deleted_at": (now - Duration::days(8)).to_rfc3339() }));
        let null = row(json!({ "deleted_at": null }));
        assert!(q.matches(&recent));
        assert!(!q.matches(&old));
        assert!(!q.matches(&null));
    }

    #[test]
    fn sort_numbers_ascending() {
        let mut rows = vec![
            row(json!({ "position": 10 })),
            row(json!({ "position": 2 })),
            row(json!({ "position": 5 })),
        ];
        Query::new().order_asc("position").sort(&mut rows);
        let positions: Vec<i64> = rows.iter().map(|r| r["position"].as_i64().unwrap()).collect();
        assert_eq!(positions, vec![2, 5, 10]);
    }
}
