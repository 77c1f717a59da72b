use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Row;
use super::color::NoteColor;
use crate::error::{Error, Result};

static MARKUP_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_pinned: bool,
    pub bg_color: NoteColor,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(row))
            .map_err(|e| Error::Decode(format!("note: {}", e)))
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Title or empty string, for display and search.
    pub fn title_text(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }

    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Insert shape. `user_id` is filled in by the service from the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteInsert {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_pinned: bool,
    pub bg_color: NoteColor,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl NoteInsert {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: non_blank(&title.into()),
            content: None,
            is_pinned: false,
            bg_color: NoteColor::white(),
            due_date: None,
            user_id: None,
        }
    }

    pub fn to_row(&self) -> Result<Row> {
        to_row(self)
    }
}

/// Partial update. The outer `Option` means "leave unchanged"; for nullable
/// columns the inner `None` writes null.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_color: Option<NoteColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NotePatch {
    pub fn pinned(is_pinned: bool) -> Self {
        Self {
            is_pinned: Some(is_pinned),
            ..Self::default()
        }
    }

    pub fn color(color: NoteColor) -> Self {
        Self {
            bg_color: Some(color),
            ..Self::default()
        }
    }

    pub fn due(due_date: Option<DateTime<Utc>>) -> Self {
        Self {
            due_date: Some(due_date),
            ..Self::default()
        }
    }

    pub fn trashed_at(at: Option<DateTime<Utc>>) -> Self {
        Self {
            deleted_at: Some(at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a cached row the way the store would.
    pub fn apply_to(&self, note: &mut Note) {
        if let Some(title) = &self.title {
            note.title = title.clone();
        }
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(pinned) = self.is_pinned {
            note.is_pinned = pinned;
        }
        if let Some(color) = &self.bg_color {
            note.bg_color = color.clone();
        }
        if let Some(due) = self.due_date {
            note.due_date = due;
        }
        if let Some(deleted) = self.deleted_at {
            note.deleted_at = deleted;
        }
        if let Some(updated) = self.updated_at {
            note.updated_at = updated;
        }
    }

    pub fn to_row(&self) -> Result<Row> {
        to_row(self)
    }
}

/// What a note editor holds while the user types. Fields are kept exactly as
/// typed; trimming happens when the draft is persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteDraft {
    pub title: String,
    pub content: String,
    pub bg_color: NoteColor,
    pub due_date: Option<DateTime<Utc>>,
}

/// A single edit coming from the note editor.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteField {
    Title(String),
    Content(String),
    Color(NoteColor),
    DueDate(Option<DateTime<Utc>>),
}

impl NoteDraft {
    /// Seed an editor from an existing note.
    pub fn from_note(note: &Note) -> Self {
        Self {
            title: note.title_text().to_string(),
            content: note.content_text().to_string(),
            bg_color: note.bg_color.clone(),
            due_date: note.due_date,
        }
    }

    pub fn apply(&mut self, field: NoteField) {
        match field {
            NoteField::Title(t) => self.title = t,
            NoteField::Content(c) => self.content = c,
            NoteField::Color(c) => self.bg_color = c,
            NoteField::DueDate(d) => self.due_date = d,
        }
    }

    /// True when the title or the visible text of the content is non-blank.
    pub fn has_meaningful_content(&self) -> bool {
        !self.title.trim().is_empty() || has_visible_text(&self.content)
    }

    pub fn to_insert(&self) -> NoteInsert {
        NoteInsert {
            title: non_blank(&self.title),
            content: non_blank(&self.content),
            is_pinned: false,
            bg_color: self.bg_color.clone(),
            due_date: self.due_date,
            user_id: None,
        }
    }

    /// Full overwrite of the editable fields. An all-blank draft clears them.
    pub fn to_patch(&self) -> NotePatch {
        NotePatch {
            title: Some(non_blank(&self.title)),
            content: Some(non_blank(&self.content)),
            bg_color: Some(self.bg_color.clone()),
            due_date: Some(self.due_date),
            ..NotePatch::default()
        }
    }
}

/// Strip markup tags and check whether any non-whitespace text remains.
pub fn has_visible_text(markup: &str) -> bool {
    !MARKUP_TAG_RE.replace_all(markup, "").trim().is_empty()
}

fn non_blank(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || !has_visible_text(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Decode(format!("expected an object, got {}", other))),
    }
}
