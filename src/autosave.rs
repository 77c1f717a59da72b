//! Debounced autosave for a single editing session.
//!
//! Each keystroke lands in the session's buffer immediately and (re)arms a
//! debounce timer. When typing pauses the buffer is flushed: the first flush
//! of a new entity creates it, later ones update it. A session never issues
//! more than one create: the phase moves to `Creating` before the create call
//! goes out, and any flush requested while a save is in flight is remembered
//! and replayed (as an update) once the save lands.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::core::note::{NoteDraft, NoteField};
use crate::core::task::{TaskDraft, TaskField};
use crate::error::Result;

/// An edit buffer the controller can persist.
pub trait Draft: Clone + PartialEq + Send + Sync + 'static {
    type Field: Send + 'static;

    fn apply(&mut self, field: Self::Field);

    /// Whether the draft is worth creating an entity for.
    fn has_meaningful_content(&self) -> bool;
}

impl Draft for NoteDraft {
    type Field = NoteField;

    fn apply(&mut self, field: NoteField) {
        NoteDraft::apply(self, field)
    }

    fn has_meaningful_content(&self) -> bool {
        NoteDraft::has_meaningful_content(self)
    }
}

impl Draft for TaskDraft {
    type Field = TaskField;

    fn apply(&mut self, field: TaskField) {
        TaskDraft::apply(self, field)
    }

    fn has_meaningful_content(&self) -> bool {
        TaskDraft::has_meaningful_content(self)
    }
}

/// Where flushed drafts go.
#[async_trait]
pub trait DraftSink<D: Draft>: Send + Sync + 'static {
    type Id: Clone + PartialEq + Debug + Send + Sync + 'static;

    async fn create(&self, draft: &D) -> Result<Self::Id>;

    async fn update(&self, id: &Self::Id, draft: &D) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase<I> {
    /// Nothing persisted yet.
    New,
    /// The create call is in flight.
    Creating,
    Existing(I),
}

/// What the editor shows next to the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    /// Edits are buffered and waiting for the debounce to elapse.
    Pending,
    Saving,
    Saved,
    /// The last attempt failed; the buffer is kept and the next edit or close retries.
    NotSaved(String),
}

struct State<D, I> {
    phase: Phase<I>,
    saving: bool,
    dirty_during_save: bool,
    buffer: D,
    persisted: Option<D>,
    status: SaveStatus,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    closed: bool,
}

impl<D: PartialEq, I> State<D, I> {
    fn in_flight(&self) -> bool {
        self.saving || matches!(self.phase, Phase::Creating)
    }

    fn is_persisted(&self) -> bool {
        self.persisted.as_ref() == Some(&self.buffer)
    }

    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum Job<D, I> {
    Create(D),
    Update(I, D),
}

struct Inner<D: Draft, S: DraftSink<D>> {
    state: Mutex<State<D, S::Id>>,
    sink: S,
    delay: Duration,
}

/// One editor's autosave controller. Cheap to clone; clones share the session.
///
/// Must be driven from inside a tokio runtime: field changes spawn the debounce timer.
pub struct AutosaveSession<D: Draft, S: DraftSink<D>> {
    inner: Arc<Inner<D, S>>,
}

impl<D: Draft, S: DraftSink<D>> Clone for AutosaveSession<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Draft, S: DraftSink<D>> AutosaveSession<D, S> {
    /// Session for an entity that does not exist yet.
    pub fn create(sink: S, delay: Duration, initial: D) -> Self {
        Self::with_phase(sink, delay, Phase::New, initial, None)
    }

    /// Session for an existing entity whose stored state is `current`.
    pub fn edit(sink: S, delay: Duration, id: S::Id, current: D) -> Self {
        let persisted = Some(current.clone());
        Self::with_phase(sink, delay, Phase::Existing(id), current, persisted)
    }

    fn with_phase(sink: S, delay: Duration, phase: Phase<S::Id>, buffer: D, persisted: Option<D>) -> Self {
        let state = State {
            phase,
            saving: false,
            dirty_during_save: false,
            buffer,
            persisted,
            status: SaveStatus::Idle,
            timer: None,
            timer_generation: 0,
            closed: false,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                sink,
                delay,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<D, S::Id>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SaveStatus {
        self.lock().status.clone()
    }

    pub fn phase(&self) -> Phase<S::Id> {
        self.lock().phase.clone()
    }

    /// Identity of the persisted entity, once it exists.
    pub fn entity_id(&self) -> Option<S::Id> {
        match &self.lock().phase {
            Phase::Existing(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// The buffer as the user currently sees it.
    pub fn draft(&self) -> D {
        self.lock().buffer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Record an edit and restart the debounce timer.
    pub fn on_field_change(&self, field: D::Field) {
        let mut st = self.lock();
        if st.closed {
            log::warn!("autosave: edit after session close ignored");
            return;
        }
        st.buffer.apply(field);
        if !st.saving {
            st.status = SaveStatus::Pending;
        }
        self.arm_timer(&mut st);
    }

    fn arm_timer(&self, st: &mut State<D, S::Id>) {
        st.cancel_timer();
        let generation = st.timer_generation;
        let session = self.clone();
        let delay = self.inner.delay;
        st.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut st = session.lock();
                if st.timer_generation != generation {
                    return;
                }
                // Detach: a later keystroke must not abort the save this timer starts.
                st.timer = None;
            }
            if let Err(e) = session.flush().await {
                log::warn!("autosave failed: {}", e);
            }
        }));
    }

    /// Persist the buffer now.
    ///
    /// Returns `Ok` without a network call when there is nothing to save, when
    /// a new draft is still blank, or when a save is already in flight (the
    /// in-flight save re-flushes after it lands if the buffer moved on).
    pub async fn flush(&self) -> Result<()> {
        let mut replayed_after_failure = false;
        loop {
            let job = {
                let mut guard = self.lock();
                let st = &mut *guard;
                if st.in_flight() {
                    log::debug!("autosave: save in flight, deferring flush");
                    st.dirty_during_save = true;
                    return Ok(());
                }
                if st.is_persisted() {
                    if st.status == SaveStatus::Pending {
                        st.status = SaveStatus::Saved;
                    }
                    return Ok(());
                }
                let job = match &st.phase {
                    Phase::New if !st.buffer.has_meaningful_content() => {
                        st.status = SaveStatus::Idle;
                        return Ok(());
                    }
                    Phase::New => {
                        st.phase = Phase::Creating;
                        Job::Create(st.buffer.clone())
                    }
                    Phase::Existing(id) => Job::Update(id.clone(), st.buffer.clone()),
                    Phase::Creating => unreachable!("creating implies a save in flight"),
                };
                st.saving = true;
                st.dirty_during_save = false;
                st.status = SaveStatus::Saving;
                job
            };

            let (saved, outcome) = match job {
                Job::Create(draft) => {
                    let outcome = self.inner.sink.create(&draft).await.map(Some);
                    (draft, outcome)
                }
                Job::Update(id, draft) => {
                    let outcome = self.inner.sink.update(&id, &draft).await.map(|_| None);
                    (draft, outcome)
                }
            };

            let again = {
                let mut st = self.lock();
                st.saving = false;
                match outcome {
                    Ok(created) => {
                        if let Some(id) = created {
                            log::debug!("autosave: created {:?}", id);
                            st.phase = Phase::Existing(id);
                        }
                    }
                    Err(e) => {
                        if st.phase == Phase::Creating {
                            st.phase = Phase::New;
                        }
                        // A flush queued by close has no later edit to retry it: run it once.
                        let replay = st.closed && st.dirty_during_save && !replayed_after_failure;
                        st.dirty_during_save = false;
                        st.status = SaveStatus::NotSaved(e.to_string());
                        if !replay {
                            return Err(e);
                        }
                        log::warn!("autosave failed ({}), replaying the final edit", e);
                        replayed_after_failure = true;
                        continue;
                    }
                }
                st.persisted = Some(saved);
                let moved_on = !st.is_persisted();
                let again = st.dirty_during_save && moved_on;
                st.dirty_during_save = false;
                st.status = if moved_on {
                    SaveStatus::Pending
                } else {
                    SaveStatus::Saved
                };
                again
            };
            if !again {
                return Ok(());
            }
            log::debug!("autosave: replaying edits made during save");
        }
    }

    /// The editor is closing: drop the debounce and save what is left.
    ///
    /// With a save in flight this does not race it; the session is marked
    /// dirty and that save re-flushes the final buffer when it lands.
    pub async fn on_session_close(&self) -> Result<()> {
        {
            let mut st = self.lock();
            st.closed = true;
            st.cancel_timer();
            if st.in_flight() {
                if !st.is_persisted() {
                    st.dirty_during_save = true;
                }
                return Ok(());
            }
        }
        self.flush().await
    }
}
