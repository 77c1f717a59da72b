//! Pure derivations over cached notes and tasks for display.

use chrono::{DateTime, Duration, Utc};

use crate::core::note::Note;
use crate::core::task::Task;

/// Unpinned notes shown under "Recent" when grouping by recency.
pub const RECENT_LIMIT: usize = 4;

/// Default trash retention window.
pub fn default_retention() -> Duration {
    Duration::days(7)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitioned {
    pub active: Vec<Note>,
    pub trash: Vec<Note>,
}

pub fn is_in_trash(note: &Note, now: DateTime<Utc>, retention: Duration) -> bool {
    note.deleted_at.is_some_and(|at| at >= now - retention)
}

/// Soft-deleted longer ago than the retention window. Such notes are treated as gone.
pub fn is_expired(note: &Note, now: DateTime<Utc>, retention: Duration) -> bool {
    note.deleted_at.is_some_and(|at| at < now - retention)
}

/// Split notes into the active list and the trash. Expired notes appear in neither.
pub fn partition(notes: &[Note], now: DateTime<Utc>, retention: Duration) -> Partitioned {
    let mut out = Partitioned::default();
    for note in notes {
        if note.is_active() {
            out.active.push(note.clone());
        } else if is_in_trash(note, now, retention) {
            out.trash.push(note.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteGroups {
    pub pinned: Vec<Note>,
    pub recent: Vec<Note>,
    pub others: Vec<Note>,
}

/// Pinned first, then (optionally) the most recently updated unpinned notes, then the rest.
/// Input order is kept within `pinned` and `others`.
pub fn group(notes: &[Note], with_recent: bool) -> NoteGroups {
    let (pinned, mut unpinned): (Vec<Note>, Vec<Note>) = notes.iter().cloned().partition(|n| n.is_pinned);
    if !with_recent {
        return NoteGroups {
            pinned,
            recent: Vec::new(),
            others: unpinned,
        };
    }

    let mut by_update: Vec<usize> = (0..unpinned.len()).collect();
    by_update.sort_by(|&a, &b| unpinned[b].updated_at.cmp(&unpinned[a].updated_at));
    by_update.truncate(RECENT_LIMIT);

    let recent = by_update.iter().map(|&i| unpinned[i].clone()).collect();
    let mut i = 0;
    unpinned.retain(|_| {
        let keep = !by_update.contains(&i);
        i += 1;
        keep
    });
    NoteGroups {
        pinned,
        recent,
        others: unpinned,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub notes: Vec<Note>,
    query_active: bool,
    total: usize,
}

impl SearchOutcome {
    /// A query is active and nothing matched.
    pub fn is_empty_result(&self) -> bool {
        self.query_active && self.notes.is_empty()
    }

    /// There are no notes at all, query or not.
    pub fn no_notes(&self) -> bool {
        self.total == 0
    }

    pub fn query_active(&self) -> bool {
        self.query_active
    }
}

/// Case-insensitive substring match on title or content. A blank query matches
/// everything; otherwise the query is matched as typed, surrounding spaces included.
pub fn search(notes: &[Note], query: &str) -> SearchOutcome {
    let query_active = !query.trim().is_empty();
    let needle = query.to_lowercase();
    let matched = if !query_active {
        notes.to_vec()
    } else {
        notes
            .iter()
            .filter(|n| {
                n.title_text().to_lowercase().contains(&needle)
                    || n.content_text().to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    };
    SearchOutcome {
        notes: matched,
        query_active,
        total: notes.len(),
    }
}

/// Whole days left before a trashed note expires, rounded up, never negative.
pub fn days_remaining(deleted_at: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> i64 {
    let left = (deleted_at + retention - now).num_milliseconds();
    if left <= 0 {
        return 0;
    }
    let day = Duration::days(1).num_milliseconds();
    (left + day - 1) / day
}

/// Incomplete tasks first, completed after, each in position order.
pub fn split_tasks(tasks: &[Task]) -> (Vec<Task>, Vec<Task>) {
    let mut sorted = tasks.to_vec();
    sorted.sort_by_key(|t| t.position);
    sorted.into_iter().partition(|t| !t.is_completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::color::NoteColor;
    use crate::core::task::TaskId;
    use uuid::Uuid;

    fn note(title: &str, updated_ago_min: i64) -> Note {
        let now = Utc::now();
        Note {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            title: Some(title.to_string()),
            content: None,
            is_pinned: false,
            bg_color: NoteColor::white(),
            due_date: None,
            deleted_at: None,
            created_at: now,
            updated_at: now - Duration::minutes(updated_ago_min),
        }
    }

    fn titles(notes: &[Note]) -> Vec<&str> {
        notes.iter().map(|n| n.title_text()).collect()
    }

    #[test]
    fn trash_boundary() {
        let now = Utc::now();
        let week = default_retention();
        let mut recent = note("recent", 0);
        recent.deleted_at = Some(now - (Duration::days(6) + Duration::hours(23)));
        let mut old = note("old", 0);
        old.deleted_at = Some(now - (Duration::days(7) + Duration::hours(1)));
        let active = note("active", 0);

        let parts = partition(&[recent.clone(), old.clone(), active], now, week);
        assert_eq!(titles(&parts.active), vec!["active"]);
        assert_eq!(titles(&parts.trash), vec!["recent"]);
        assert_eq!(days_remaining(recent.deleted_at.unwrap(), now, week), 1);
        assert!(is_expired(&old, now, week));
        assert_eq!(days_remaining(old.deleted_at.unwrap(), now, week), 0);
    }

    #[test]
    fn just_deleted_has_full_window() {
        let now = Utc::now();
        assert_eq!(days_remaining(now, now, default_retention()), 7);
        assert_eq!(days_remaining(now - Duration::seconds(1), now, default_retention()), 7);
    }

    #[test]
    fn last_second_in_trash_still_counts_a_day() {
        let now = Utc::now();
        let week = default_retention();
        let deleted_at = now - week + Duration::milliseconds(400);
        let mut note = note("almost gone", 0);
        note.deleted_at = Some(deleted_at);
        assert!(is_in_trash(&note, now, week));
        assert_eq!(days_remaining(deleted_at, now, week), 1);
    }

    #[test]
    fn recent_group_takes_four_latest_unpinned() {
        let mut pinned = note("pinned", 0);
        pinned.is_pinned = true;
        let notes = vec![
            pinned,
            note("a", 50),
            note("b", 10),
            note("c", 40),
            note("d", 20),
            note("e", 30),
            note("f", 60),
        ];
        let groups = group(&notes, true);
        assert_eq!(titles(&groups.pinned), vec!["pinned"]);
        assert_eq!(titles(&groups.recent), vec!["b", "d", "e", "c"]);
        assert_eq!(titles(&groups.others), vec!["a", "f"]);

        let flat = group(&notes, false);
        assert!(flat.recent.is_empty());
        assert_eq!(flat.others.len(), 6);
    }

    #[test]
    fn search_matches_title_or_content_case_insensitively() {
        let mut soup = note("Dinner", 0);
        soup.content = Some("<p>Tomato SOUP</p>".into());
        let notes = vec![soup, note("Groceries", 0)];

        assert_eq!(titles(&search(&notes, "soup").notes), vec!["Dinner"]);
        assert_eq!(titles(&search(&notes, "GROC").notes), vec!["Groceries"]);
        assert_eq!(search(&notes, "  ").notes.len(), 2);
        assert!(!search(&notes, "  ").query_active());
        assert_eq!(titles(&search(&notes, "tomato soup").notes), vec!["Dinner"]);
        // Surrounding spaces are part of the query.
        assert!(search(&notes, " groceries").is_empty_result());
    }

    #[test]
    fn empty_result_differs_from_no_notes() {
        let notes = vec![note("Groceries", 0)];
        let miss = search(&notes, "zzz");
        assert!(miss.is_empty_result());
        assert!(!miss.no_notes());

        let none = search(&[], "");
        assert!(!none.is_empty_result());
        assert!(none.no_notes());
    }

    #[test]
    fn completed_tasks_come_last() {
        let now = Utc::now();
        let mk = |c: &str, pos: i32, done: bool| Task {
            id: TaskId::Remote(Uuid::new_v4()),
            note_id: Uuid::nil(),
            content: c.into(),
            is_completed: done,
            position: pos,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        let (open, done) = split_tasks(&[mk("b", 2, false), mk("x", 0, true), mk("a", 1, false)]);
        assert_eq!(open.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(done.len(), 1);
    }
}
