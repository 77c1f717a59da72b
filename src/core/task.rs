use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::Row;
use super::note::to_row;
use crate::error::{Error, Result};

const TEMP_PREFIX: &str = "temp-";

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a task row. `Temp` ids exist only in the local cache between an
/// optimistic insert and the store's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    Remote(Uuid),
    Temp(u64),
}

impl TaskId {
    pub fn new_temp() -> Self {
        Self::Temp(NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    /// The server id, or `PendingIdentity` for a temp id.
    pub fn remote(&self) -> Result<Uuid> {
        match self {
            Self::Remote(id) => Ok(*id),
            Self::Temp(_) => Err(Error::PendingIdentity(*self)),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => write!(f, "{}", id),
            Self::Temp(n) => write!(f, "{}{}", TEMP_PREFIX, n),
        }
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(n) = s.strip_prefix(TEMP_PREFIX) {
            return n
                .parse()
                .map(Self::Temp)
                .map_err(|_| Error::Decode(format!("bad temp task id: {}", s)));
        }
        Uuid::parse_str(s)
            .map(Self::Remote)
            .map_err(|e| Error::Decode(format!("bad task id {}: {}", s, e)))
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self::Remote(id)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub note_id: Uuid,
    pub content: String,
    pub is_completed: bool,
    pub position: i32,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_row(row: Row) -> Result<Self> {
        let task: Self = serde_json::from_value(serde_json::Value::Object(row))
            .map_err(|e| Error::Decode(format!("task: {}", e)))?;
        if task.id.is_temp() {
            return Err(Error::Decode(format!("store returned a temp id: {}", task.id)));
        }
        Ok(task)
    }

    /// Placeholder row shown while the insert is in flight.
    pub fn optimistic(insert: &TaskInsert, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new_temp(),
            note_id: insert.note_id,
            content: insert.content.clone(),
            is_completed: insert.is_completed,
            position: insert.position,
            due_date: insert.due_date,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInsert {
    pub note_id: Uuid,
    pub content: String,
    pub is_completed: bool,
    pub position: i32,
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskInsert {
    pub fn to_row(&self) -> Result<Row> {
        to_row(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn completed(done: bool) -> Self {
        Self {
            is_completed: Some(done),
            ..Self::default()
        }
    }

    pub fn position(position: i32) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn due(due_date: Option<DateTime<Utc>>) -> Self {
        Self {
            due_date: Some(due_date),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, task: &mut Task) {
        if let Some(content) = &self.content {
            task.content = content.clone();
        }
        if let Some(done) = self.is_completed {
            task.is_completed = done;
        }
        if let Some(position) = self.position {
            task.position = position;
        }
        if let Some(due) = self.due_date {
            task.due_date = due;
        }
        if let Some(updated) = self.updated_at {
            task.updated_at = updated;
        }
    }

    pub fn to_row(&self) -> Result<Row> {
        to_row(self)
    }
}

/// Edit buffer for a single task's text and due date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDraft {
    pub content: String,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskField {
    Content(String),
    DueDate(Option<DateTime<Utc>>),
}

impl TaskDraft {
    pub fn from_task(task: &Task) -> Self {
        Self {
            content: task.content.clone(),
            due_date: task.due_date,
        }
    }

    pub fn apply(&mut self, field: TaskField) {
        match field {
            TaskField::Content(c) => self.content = c,
            TaskField::DueDate(d) => self.due_date = d,
        }
    }

    pub fn has_meaningful_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    pub fn to_patch(&self) -> TaskPatch {
        TaskPatch {
            content: Some(self.content.trim().to_string()),
            due_date: Some(self.due_date),
            ..TaskPatch::default()
        }
    }
}

/// Next position for a task appended to `tasks`.
pub fn next_position(tasks: &[Task]) -> i32 {
    tasks.iter().map(|t| t.position).max().map_or(0, |p| p + 1)
}
