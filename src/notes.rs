use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::{AuthProvider, require_user};
use crate::autosave::{AutosaveSession, DraftSink};
use crate::cache::{EntityCache, NoteView};
use crate::core::color::NoteColor;
use crate::core::note::{Note, NoteDraft, NoteInsert, NotePatch};
use crate::error::Result;
use crate::remote::{Collection, Query, RemoteStore};

/// How many times a read retries when a concurrent mutation supersedes its fetch.
const FETCH_ATTEMPTS: usize = 3;

/// Note queries and mutations, routed through the shared cache.
#[derive(Clone)]
pub struct NoteService {
    store: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<EntityCache>,
    retention: Duration,
}

impl NoteService {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        cache: Arc<EntityCache>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            auth,
            cache,
            retention,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn trash_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    fn view_query(&self, view: NoteView) -> Query {
        match view {
            NoteView::Active => Query::new().is_null("deleted_at").order_desc("created_at"),
            NoteView::Trashed => Query::new()
                .not_null("deleted_at")
                .gte_time("deleted_at", self.trash_cutoff(Utc::now()))
                .order_desc("deleted_at"),
        }
    }

    /// Notes not in the trash, newest first.
    pub async fn active_notes(&self) -> Result<Vec<Note>> {
        self.load(NoteView::Active).await
    }

    /// Notes soft-deleted within the retention window, most recently deleted first.
    pub async fn trashed_notes(&self) -> Result<Vec<Note>> {
        self.load(NoteView::Trashed).await
    }

    async fn load(&self, view: NoteView) -> Result<Vec<Note>> {
        let cache = self.cache.notes();
        if let Some(notes) = cache.fresh(&view) {
            return Ok(notes);
        }
        for _ in 0..FETCH_ATTEMPTS {
            let ticket = cache.begin_fetch(&view);
            let rows = self.store.list(Collection::Notes, &self.view_query(view)).await?;
            let notes = rows.into_iter().map(Note::from_row).collect::<Result<Vec<_>>>()?;
            if cache.complete_fetch(ticket, notes.clone()) {
                return Ok(notes);
            }
        }
        Ok(cache.get(&view).unwrap_or_default())
    }

    /// Insert a note for the signed-in user.
    pub async fn create(&self, mut insert: NoteInsert) -> Result<Note> {
        let user = require_user(self.auth.as_ref()).await?;
        insert.user_id = Some(user.id);

        let result = async {
            let row = self.store.insert(Collection::Notes, insert.to_row()?).await?;
            Note::from_row(row)
        }
        .await;

        // Notes appear in the list once the store has them; no placeholder row.
        let cache = self.cache.notes();
        match &result {
            Ok(note) => {
                log::info!("created note {}", note.id);
                cache.patch(&NoteView::Active, |notes| notes.insert(0, note.clone()));
            }
            Err(e) => log::warn!("creating note failed: {}", e),
        }
        cache.invalidate(&NoteView::Active);
        result
    }

    /// Patch an active note. The cached row changes immediately and reverts if the store refuses.
    pub async fn update(&self, id: Uuid, mut patch: NotePatch) -> Result<Note> {
        require_user(self.auth.as_ref()).await?;
        patch.updated_at = Some(Utc::now());

        let tx = self.cache.notes().transaction(NoteView::Active);
        tx.apply(|notes| {
            if let Some(note) = notes.iter_mut().find(|n| n.id == id) {
                patch.apply_to(note);
            }
        });
        let result = async {
            let row = self.store.update(Collection::Notes, id, patch.to_row()?).await?;
            Note::from_row(row)
        }
        .await;
        tx.settle(result)
    }

    /// Flip the pin flag of a cached active note.
    pub async fn toggle_pin(&self, id: Uuid) -> Result<Note> {
        let pinned = self
            .cache
            .notes()
            .get(&NoteView::Active)
            .and_then(|notes| notes.into_iter().find(|n| n.id == id))
            .map(|n| n.is_pinned);
        let pinned = match pinned {
            Some(p) => p,
            None => self.find_active(id).await?.is_pinned,
        };
        self.update(id, NotePatch::pinned(!pinned)).await
    }

    pub async fn set_color(&self, id: Uuid, color: NoteColor) -> Result<Note> {
        self.update(id, NotePatch::color(color)).await
    }

    pub async fn set_due_date(&self, id: Uuid, due: Option<DateTime<Utc>>) -> Result<Note> {
        self.update(id, NotePatch::due(due)).await
    }

    async fn find_active(&self, id: Uuid) -> Result<Note> {
        self.active_notes()
            .await?
            .into_iter()
            .find(|n| n.id == id)
            .ok_or_else(|| crate::error::Error::NotFound(format!("note {}", id)))
    }

    /// Move a note to the trash.
    pub async fn soft_delete(&self, id: Uuid) -> Result<Note> {
        require_user(self.auth.as_ref()).await?;
        let tx = self.cache.notes().transaction(NoteView::Active);
        tx.apply(|notes| notes.retain(|n| n.id != id));

        let patch = NotePatch::trashed_at(Some(Utc::now()));
        let result = async {
            let row = self.store.update(Collection::Notes, id, patch.to_row()?).await?;
            Note::from_row(row)
        }
        .await;
        let result = tx.settle(result);
        self.cache.notes().invalidate(&NoteView::Trashed);
        if result.is_ok() {
            log::info!("moved note {} to trash", id);
        }
        result
    }

    /// Bring a trashed note back to the active list.
    pub async fn restore(&self, id: Uuid) -> Result<Note> {
        require_user(self.auth.as_ref()).await?;
        let tx = self.cache.notes().transaction(NoteView::Trashed);
        tx.apply(|notes| notes.retain(|n| n.id != id));

        let patch = NotePatch::trashed_at(None);
        let result = async {
            let row = self.store.update(Collection::Notes, id, patch.to_row()?).await?;
            Note::from_row(row)
        }
        .await;
        let result = tx.settle(result);
        self.cache.notes().invalidate(&NoteView::Active);
        if result.is_ok() {
            log::info!("restored note {}", id);
        }
        result
    }

    /// Irreversibly delete a trashed note (and, server-side, its tasks).
    pub async fn delete_permanently(&self, id: Uuid) -> Result<()> {
        require_user(self.auth.as_ref()).await?;
        let tx = self.cache.notes().transaction(NoteView::Trashed);
        tx.apply(|notes| notes.retain(|n| n.id != id));
        let result = self.store.delete(Collection::Notes, id).await;
        if result.is_ok() {
            self.cache.tasks().invalidate(&id);
            log::info!("permanently deleted note {}", id);
        }
        tx.settle(result)
    }

    /// Permanently delete everything currently in the trash window.
    pub async fn empty_trash(&self) -> Result<u64> {
        require_user(self.auth.as_ref()).await?;
        let tx = self.cache.notes().transaction(NoteView::Trashed);
        tx.apply(|notes| notes.clear());

        let query = Query::new()
            .not_null("deleted_at")
            .gte_time("deleted_at", self.trash_cutoff(Utc::now()));
        let result = self.store.delete_where(Collection::Notes, &query).await;
        if let Ok(n) = result {
            log::info!("emptied trash ({} notes)", n);
        }
        tx.settle(result)
    }

    /// Hard-delete notes whose retention window has passed.
    pub async fn purge_expired(&self) -> Result<u64> {
        require_user(self.auth.as_ref()).await?;
        let query = Query::new()
            .not_null("deleted_at")
            .lt_time("deleted_at", self.trash_cutoff(Utc::now()));
        let purged = self.store.delete_where(Collection::Notes, &query).await?;
        if purged > 0 {
            log::info!("purged {} expired notes", purged);
            self.cache.notes().invalidate(&NoteView::Trashed);
        }
        Ok(purged)
    }

    /// Autosaving editor for a note that does not exist yet.
    pub fn compose(&self, delay: std::time::Duration) -> AutosaveSession<NoteDraft, NoteService> {
        AutosaveSession::create(self.clone(), delay, NoteDraft::default())
    }

    /// Autosaving editor for an existing note.
    pub fn edit(&self, note: &Note, delay: std::time::Duration) -> AutosaveSession<NoteDraft, NoteService> {
        AutosaveSession::edit(self.clone(), delay, note.id, NoteDraft::from_note(note))
    }
}

#[async_trait]
impl DraftSink<NoteDraft> for NoteService {
    type Id = Uuid;

    async fn create(&self, draft: &NoteDraft) -> Result<Uuid> {
        NoteService::create(self, draft.to_insert()).await.map(|note| note.id)
    }

    async fn update(&self, id: &Uuid, draft: &NoteDraft) -> Result<()> {
        NoteService::update(self, *id, draft.to_patch()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuth;
    use crate::error::Error;
    use crate::remote::MemoryStore;
    use crate::remote::memory::StoreOp;
    use crate::view;

    fn service() -> (NoteService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(MemoryAuth::signed_in("me@example.com"));
        let svc = NoteService::new(store.clone(), auth, Arc::new(EntityCache::default()), Duration::days(7));
        (svc, store)
    }

    fn trashed_row(deleted_ago: Duration) -> crate::core::Row {
        let serde_json::Value::Object(map) = serde_json::json!({
            "user_id": Uuid::nil().to_string(),
            "title": "old",
            "deleted_at": (Utc::now() - deleted_ago).to_rfc3339(),
        }) else {
            unreachable!()
        };
        map
    }

    #[tokio::test]
    async fn groceries_lifecycle() {
        let (svc, _) = service();
        let note = svc.create(NoteInsert::titled("Groceries")).await.unwrap();
        assert_eq!(note.content, None);
        assert!(!note.is_pinned);
        assert_eq!(note.bg_color, NoteColor::white());

        let active = svc.active_notes().await.unwrap();
        assert_eq!(active.len(), 1);

        svc.toggle_pin(note.id).await.unwrap();
        let groups = view::group(&svc.active_notes().await.unwrap(), false);
        assert_eq!(groups.pinned.len(), 1);
        assert!(groups.others.is_empty());

        svc.soft_delete(note.id).await.unwrap();
        assert!(svc.active_notes().await.unwrap().is_empty());
        let trash = svc.trashed_notes().await.unwrap();
        assert_eq!(trash.len(), 1);
        let deleted_at = trash[0].deleted_at.unwrap();
        assert_eq!(view::days_remaining(deleted_at, Utc::now(), svc.retention()), 7);

        let restored = svc.restore(note.id).await.unwrap();
        assert_eq!(restored.deleted_at, None);
        assert!(svc.trashed_notes().await.unwrap().is_empty());
        assert_eq!(svc.active_notes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_soft_delete_rolls_back_active_list() {
        let (svc, store) = service();
        for title in ["A", "B", "C"] {
            svc.create(NoteInsert::titled(title)).await.unwrap();
        }
        let before = svc.active_notes().await.unwrap();
        let b = before.iter().find(|n| n.title_text() == "B").unwrap().id;

        store.fail_next(Collection::Notes, StoreOp::Update);
        assert!(svc.soft_delete(b).await.is_err());
        assert_eq!(svc.cache().notes().get(&NoteView::Active).unwrap(), before);
    }

    #[tokio::test]
    async fn mutations_without_user_fail_before_network() {
        let store = Arc::new(MemoryStore::new());
        let svc = NoteService::new(
            store.clone(),
            Arc::new(MemoryAuth::new()),
            Arc::new(EntityCache::default()),
            Duration::days(7),
        );
        let err = svc.create(NoteInsert::titled("x")).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
        assert!(matches!(svc.soft_delete(Uuid::new_v4()).await, Err(Error::NotAuthenticated)));
        assert_eq!(store.calls(Collection::Notes, StoreOp::Insert), 0);
        assert_eq!(store.calls(Collection::Notes, StoreOp::Update), 0);
    }

    #[tokio::test]
    async fn trash_view_excludes_expired_and_purge_removes_them() {
        let (svc, store) = service();
        store.seed(Collection::Notes, trashed_row(Duration::days(6) + Duration::hours(23)));
        store.seed(Collection::Notes, trashed_row(Duration::days(7) + Duration::hours(1)));

        assert_eq!(svc.trashed_notes().await.unwrap().len(), 1);
        assert_eq!(svc.purge_expired().await.unwrap(), 1);
        assert_eq!(store.rows(Collection::Notes).len(), 1);
    }

    #[tokio::test]
    async fn empty_trash_keeps_active_notes() {
        let (svc, store) = service();
        svc.create(NoteInsert::titled("keep")).await.unwrap();
        store.seed(Collection::Notes, trashed_row(Duration::days(1)));
        store.seed(Collection::Notes, trashed_row(Duration::days(2)));
        assert_eq!(svc.trashed_notes().await.unwrap().len(), 2);

        assert_eq!(svc.empty_trash().await.unwrap(), 2);
        assert!(svc.trashed_notes().await.unwrap().is_empty());
        assert_eq!(svc.active_notes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_empty_trash_restores_cached_trash() {
        let (svc, store) = service();
        store.seed(Collection::Notes, trashed_row(Duration::days(1)));
        let before = svc.trashed_notes().await.unwrap();

        store.fail_next(Collection::Notes, StoreOp::DeleteWhere);
        assert!(svc.empty_trash().await.is_err());
        assert_eq!(svc.cache().notes().get(&NoteView::Trashed).unwrap(), before);
    }

    #[tokio::test]
    async fn reads_are_served_from_cache_until_invalidated() {
        let (svc, store) = service();
        svc.active_notes().await.unwrap();
        svc.active_notes().await.unwrap();
        assert_eq!(store.calls(Collection::Notes, StoreOp::List), 1);

        svc.create(NoteInsert::titled("new")).await.unwrap();
        svc.active_notes().await.unwrap();
        assert_eq!(store.calls(Collection::Notes, StoreOp::List), 2);
    }
}
