use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use uuid::Uuid;

use crate::auth::{AuthProvider, require_user};
use crate::autosave::{AutosaveSession, DraftSink};
use crate::cache::EntityCache;
use crate::core::task::{Task, TaskDraft, TaskId, TaskInsert, TaskPatch, next_position};
use crate::error::{Error, Result};
use crate::remote::{Collection, Query, RemoteStore};

/// Checklist items of a note, routed through the shared cache.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<EntityCache>,
}

impl TaskService {
    pub fn new(store: Arc<dyn RemoteStore>, auth: Arc<dyn AuthProvider>, cache: Arc<EntityCache>) -> Self {
        Self { store, auth, cache }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Tasks of `note_id` in display order.
    pub async fn tasks(&self, note_id: Uuid) -> Result<Vec<Task>> {
        let cache = self.cache.tasks();
        if let Some(tasks) = cache.fresh(&note_id) {
            return Ok(tasks);
        }
        let query = Query::new()
            .eq("note_id", note_id.to_string())
            .order_asc("position");
        let ticket = cache.begin_fetch(&note_id);
        let rows = self.store.list(Collection::Tasks, &query).await?;
        let tasks = rows.into_iter().map(Task::from_row).collect::<Result<Vec<_>>>()?;
        if cache.complete_fetch(ticket, tasks.clone()) {
            Ok(tasks)
        } else {
            // A local mutation landed while fetching; it is the newer truth.
            Ok(cache.get(&note_id).unwrap_or(tasks))
        }
    }

    /// Append a task. A placeholder with a temp id shows up at once and is
    /// swapped in place for the stored row when the insert returns.
    pub async fn create(&self, note_id: Uuid, content: &str) -> Result<Task> {
        self.create_with(note_id, content, None).await
    }

    pub async fn create_with(
        &self,
        note_id: Uuid,
        content: &str,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        require_user(self.auth.as_ref()).await?;
        if self.cache.tasks().get(&note_id).is_none() {
            self.tasks(note_id).await?;
        }

        // Position is taken from the cached list under the transaction, so
        // concurrent creates see each other's placeholders.
        let tx = self.cache.tasks().transaction(note_id);
        let mut insert = TaskInsert {
            note_id,
            content: content.trim().to_string(),
            is_completed: false,
            position: 0,
            due_date,
        };
        let mut temp_id = None;
        tx.apply(|tasks| {
            insert.position = next_position(tasks);
            let placeholder = Task::optimistic(&insert, Utc::now());
            temp_id = Some(placeholder.id);
            tasks.push(placeholder);
        });

        let result = async {
            let row = self.store.insert(Collection::Tasks, insert.to_row()?).await?;
            Task::from_row(row)
        }
        .await;
        if let Ok(task) = &result {
            log::debug!("task {:?} confirmed as {}", temp_id, task.id);
            tx.apply(|tasks| match tasks.iter_mut().find(|t| Some(t.id) == temp_id) {
                Some(slot) => *slot = task.clone(),
                None => tasks.push(task.clone()),
            });
        }
        tx.settle(result)
    }

    pub async fn update(&self, id: TaskId, note_id: Uuid, mut patch: TaskPatch) -> Result<Task> {
        let remote_id = id.remote()?;
        require_user(self.auth.as_ref()).await?;
        patch.updated_at = Some(Utc::now());

        let tx = self.cache.tasks().transaction(note_id);
        tx.apply(|tasks| {
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                patch.apply_to(task);
            }
        });
        let result = async {
            let row = self.store.update(Collection::Tasks, remote_id, patch.to_row()?).await?;
            Task::from_row(row)
        }
        .await;
        tx.settle(result)
    }

    pub async fn set_content(&self, id: TaskId, note_id: Uuid, content: &str) -> Result<Task> {
        self.update(id, note_id, TaskPatch::content(content.trim())).await
    }

    pub async fn set_due_date(&self, id: TaskId, note_id: Uuid, due: Option<DateTime<Utc>>) -> Result<Task> {
        self.update(id, note_id, TaskPatch::due(due)).await
    }

    pub async fn toggle_completion(&self, id: TaskId, note_id: Uuid) -> Result<Task> {
        id.remote()?;
        let done = self
            .tasks(note_id)
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .map(|t| t.is_completed)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        self.update(id, note_id, TaskPatch::completed(!done)).await
    }

    pub async fn delete(&self, id: TaskId, note_id: Uuid) -> Result<()> {
        let remote_id = id.remote()?;
        require_user(self.auth.as_ref()).await?;

        let tx = self.cache.tasks().transaction(note_id);
        tx.apply(|tasks| tasks.retain(|t| t.id != id));
        let result = self.store.delete(Collection::Tasks, remote_id).await;
        tx.settle(result)
    }

    /// Rewrite positions so tasks appear in `order`. Tasks of the note that
    /// `order` leaves out keep their relative order after the listed ones.
    pub async fn reorder(&self, note_id: Uuid, order: &[TaskId]) -> Result<()> {
        for id in order {
            id.remote()?;
        }
        require_user(self.auth.as_ref()).await?;
        let current = self.tasks(note_id).await?;
        if let Some(pending) = current.iter().find(|t| t.id.is_temp()) {
            return Err(Error::PendingIdentity(pending.id));
        }
        let reordered = arrange(current, order);

        let tx = self.cache.tasks().transaction(note_id);
        let optimistic = reordered.clone();
        tx.apply(|tasks| *tasks = optimistic);

        let now = Utc::now();
        let updates = reordered.iter().map(|task| {
            let patch = TaskPatch {
                position: Some(task.position),
                updated_at: Some(now),
                ..TaskPatch::default()
            };
            async move {
                let row = patch.to_row()?;
                self.store.update(Collection::Tasks, task.id.remote()?, row).await
            }
        });
        let result = try_join_all(updates).await.map(|rows| {
            log::debug!("reordered {} tasks of note {}", rows.len(), note_id);
        });
        tx.settle(result)
    }

    /// Drag-and-drop style move among the incomplete tasks of a note. Completed
    /// tasks stay after the incomplete ones.
    pub async fn move_task(&self, note_id: Uuid, from: usize, to: usize) -> Result<()> {
        let tasks = self.tasks(note_id).await?;
        let (mut incomplete, completed): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| !t.is_completed);
        if from >= incomplete.len() || to >= incomplete.len() {
            return Err(Error::InvalidInput(format!(
                "cannot move task {} to {} in a list of {}",
                from,
                to,
                incomplete.len()
            )));
        }
        if from == to {
            return Ok(());
        }
        let moved = incomplete.remove(from);
        incomplete.insert(to, moved);
        let order: Vec<TaskId> = incomplete.iter().chain(&completed).map(|t| t.id).collect();
        self.reorder(note_id, &order).await
    }
}

/// Arrange `tasks` by `order` and renumber positions from zero.
fn arrange(mut tasks: Vec<Task>, order: &[TaskId]) -> Vec<Task> {
    let mut arranged = Vec::with_capacity(tasks.len());
    for id in order {
        if let Some(idx) = tasks.iter().position(|t| t.id == *id) {
            arranged.push(tasks.remove(idx));
        }
    }
    arranged.extend(tasks);
    for (i, task) in arranged.iter_mut().enumerate() {
        task.position = i as i32;
    }
    arranged
}

/// Autosave target for the tasks of one note.
#[derive(Clone)]
pub struct TaskSink {
    service: TaskService,
    note_id: Uuid,
}

impl TaskService {
    pub fn sink(&self, note_id: Uuid) -> TaskSink {
        TaskSink {
            service: self.clone(),
            note_id,
        }
    }

    /// Autosaving editor for a task row that does not exist yet.
    pub fn compose(&self, note_id: Uuid, delay: std::time::Duration) -> AutosaveSession<TaskDraft, TaskSink> {
        AutosaveSession::create(self.sink(note_id), delay, TaskDraft::default())
    }

    pub fn edit(&self, task: &Task, delay: std::time::Duration) -> AutosaveSession<TaskDraft, TaskSink> {
        AutosaveSession::edit(self.sink(task.note_id), delay, task.id, TaskDraft::from_task(task))
    }
}

#[async_trait]
impl DraftSink<TaskDraft> for TaskSink {
    type Id = TaskId;

    async fn create(&self, draft: &TaskDraft) -> Result<TaskId> {
        let task = self
            .service
            .create_with(self.note_id, &draft.content, draft.due_date)
            .await?;
        Ok(task.id)
    }

    async fn update(&self, id: &TaskId, draft: &TaskDraft) -> Result<()> {
        self.service
            .update(*id, self.note_id, draft.to_patch())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuth;
    use crate::remote::MemoryStore;
    use crate::remote::memory::StoreOp;

    fn service() -> (TaskService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(MemoryAuth::signed_in("me@example.com"));
        (TaskService::new(store.clone(), auth, Arc::new(EntityCache::default())), store)
    }

    fn contents(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.content.as_str()).collect()
    }

    #[tokio::test]
    async fn tasks_append_with_increasing_positions() {
        let (svc, _) = service();
        let note = Uuid::new_v4();
        for c in ["milk", "eggs", "bread"] {
            svc.create(note, c).await.unwrap();
        }
        let tasks = svc.tasks(note).await.unwrap();
        assert_eq!(contents(&tasks), vec!["milk", "eggs", "bread"]);
        assert_eq!(tasks.iter().map(|t| t.position).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(tasks.iter().all(|t| !t.id.is_temp()));
    }

    #[tokio::test]
    async fn moving_third_task_to_the_top() {
        let (svc, _) = service();
        let note = Uuid::new_v4();
        for c in ["one", "two", "three"] {
            svc.create(note, c).await.unwrap();
        }
        svc.move_task(note, 2, 0).await.unwrap();

        let tasks = svc.tasks(note).await.unwrap();
        assert_eq!(contents(&tasks), vec!["three", "one", "two"]);
        assert!(tasks.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[tokio::test]
    async fn completed_tasks_stay_last_when_moving() {
        let (svc, _) = service();
        let note = Uuid::new_v4();
        let done = svc.create(note, "done").await.unwrap();
        svc.create(note, "a").await.unwrap();
        svc.create(note, "b").await.unwrap();
        svc.toggle_completion(done.id, note).await.unwrap();

        svc.move_task(note, 1, 0).await.unwrap();
        let tasks = svc.tasks(note).await.unwrap();
        assert_eq!(contents(&tasks), vec!["b", "a", "done"]);
    }

    #[tokio::test]
    async fn temp_ids_are_rejected() {
        let (svc, store) = service();
        let note = Uuid::new_v4();
        let temp = TaskId::new_temp();
        assert!(matches!(svc.delete(temp, note).await, Err(Error::PendingIdentity(_))));
        assert!(matches!(
            svc.set_content(temp, note, "x").await,
            Err(Error::PendingIdentity(_))
        ));
        assert_eq!(store.calls(Collection::Tasks, StoreOp::Delete), 0);
    }

    #[tokio::test]
    async fn failed_insert_removes_the_placeholder() {
        let (svc, store) = service();
        let note = Uuid::new_v4();
        svc.create(note, "kept").await.unwrap();
        let before = svc.tasks(note).await.unwrap();

        store.fail_next(Collection::Tasks, StoreOp::Insert);
        assert!(svc.create(note, "lost").await.is_err());
        assert_eq!(svc.cache().tasks().get(&note).unwrap(), before);
    }

    #[tokio::test]
    async fn placeholder_is_swapped_in_place() {
        let store = Arc::new(MemoryStore::new().with_latency(std::time::Duration::from_millis(50)));
        let auth = Arc::new(MemoryAuth::signed_in("me@example.com"));
        let svc = TaskService::new(store.clone(), auth, Arc::new(EntityCache::default()));
        let note = Uuid::new_v4();
        svc.create(note, "first").await.unwrap();

        let pending = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.create(note, "second").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let cached = svc.cache().tasks().get(&note).unwrap();
        assert_eq!(contents(&cached), vec!["first", "second"]);
        assert!(cached[1].id.is_temp());

        let created = pending.await.unwrap().unwrap();
        let cached = svc.cache().tasks().get(&note).unwrap();
        assert_eq!(cached[1].id, created.id);
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn failed_delete_restores_order() {
        let (svc, store) = service();
        let note = Uuid::new_v4();
        for c in ["A", "B", "C"] {
            svc.create(note, c).await.unwrap();
        }
        let tasks = svc.tasks(note).await.unwrap();
        store.fail_next(Collection::Tasks, StoreOp::Delete);
        assert!(svc.delete(tasks[1].id, note).await.is_err());
        assert_eq!(contents(&svc.cache().tasks().get(&note).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn arrange_appends_unlisted_tasks() {
        let now = Utc::now();
        let mk = |c: &str, p: i32| Task {
            id: TaskId::Remote(Uuid::new_v4()),
            note_id: Uuid::nil(),
            content: c.into(),
            is_completed: false,
            position: p,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        let tasks = vec![mk("a", 0), mk("b", 5), mk("c", 9)];
        let order = vec![tasks[2].id];
        let arranged = arrange(tasks, &order);
        assert_eq!(contents(&arranged), vec!["c", "a", "b"]);
        assert_eq!(arranged.iter().map(|t| t.position).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_editor_creates_then_updates_the_same_row() {
        use crate::autosave::SaveStatus;
        use crate::core::task::TaskField;

        let (svc, store) = service();
        let note = Uuid::new_v4();
        let editor = svc.compose(note, std::time::Duration::from_millis(500));
        editor.on_field_change(TaskField::Content(" buy milk ".into()));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let id = editor.entity_id().unwrap();
        assert!(!id.is_temp());

        editor.on_field_change(TaskField::Content("buy oat milk".into()));
        editor.on_session_close().await.unwrap();
        assert_eq!(editor.status(), SaveStatus::Saved);
        assert_eq!(store.calls(Collection::Tasks, StoreOp::Insert), 1);
        let tasks = svc.tasks(note).await.unwrap();
        assert_eq!(contents(&tasks), vec!["buy oat milk"]);
        assert_eq!(tasks[0].id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_on_unloaded_note_get_distinct_positions() {
        let store = Arc::new(MemoryStore::new().with_latency(std::time::Duration::from_millis(50)));
        let auth = Arc::new(MemoryAuth::signed_in("me@example.com"));
        let svc = TaskService::new(store.clone(), auth, Arc::new(EntityCache::default()));
        let note = Uuid::new_v4();

        let (a, b) = tokio::join!(svc.create(note, "a"), svc.create(note, "b"));
        let mut positions = vec![a.unwrap().position, b.unwrap().position];
        positions.sort();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(store.calls(Collection::Tasks, StoreOp::List), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn task_editor_on_existing_task_updates_it() {
        use crate::core::task::TaskField;

        let (svc, store) = service();
        let note = Uuid::new_v4();
        let task = svc.create(note, "eggs").await.unwrap();
        let editor = svc.edit(&task, std::time::Duration::from_millis(500));
        editor.on_field_change(TaskField::Content("a dozen eggs".into()));
        editor.on_session_close().await.unwrap();

        assert_eq!(store.calls(Collection::Tasks, StoreOp::Insert), 1);
        assert_eq!(store.calls(Collection::Tasks, StoreOp::Update), 1);
        let tasks = svc.tasks(note).await.unwrap();
        assert_eq!(contents(&tasks), vec!["a dozen eggs"]);
        assert_eq!(editor.entity_id(), Some(task.id));
    }
}
