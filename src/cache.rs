//! Process-wide cache of query results with optimistic mutation support.
//!
//! Every cached collection lives in a slot addressed by a key (which notes
//! view, or which note's tasks). A slot remembers when it was fetched, whether
//! it has been invalidated, and a fetch generation. Fetches carry the
//! generation they started under; a mutation or invalidation bumps it, so a
//! response that raced a local write is discarded instead of clobbering it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::core::note::Note;
use crate::core::task::Task;
use crate::error::Result;

/// Which server-side view of the notes table a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteView {
    /// `deleted_at is null`, newest first.
    Active,
    /// Soft-deleted within the retention window, most recently deleted first.
    Trashed,
}

struct Slot<T> {
    rows: Option<Vec<T>>,
    stale: bool,
    fetched_at: Option<Instant>,
    generation: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            rows: None,
            stale: true,
            fetched_at: None,
            generation: 0,
        }
    }
}

/// Proof that a fetch was started; hand it back with the rows.
#[derive(Debug)]
pub struct FetchTicket<K> {
    key: K,
    generation: u64,
}

/// Keyed store for one entity kind.
pub struct Store<K, T> {
    slots: Mutex<HashMap<K, Slot<T>>>,
    stale_after: Duration,
}

impl<K, T> Store<K, T>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
    T: Clone,
{
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn with_slot<R>(&self, key: &K, f: impl FnOnce(&mut Slot<T>) -> R) -> R {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        f(slots.entry(key.clone()).or_default())
    }

    pub fn get(&self, key: &K) -> Option<Vec<T>> {
        self.with_slot(key, |slot| slot.rows.clone())
    }

    /// Rows if present, not invalidated, and younger than the stale window.
    pub fn fresh(&self, key: &K) -> Option<Vec<T>> {
        let stale_after = self.stale_after;
        self.with_slot(key, |slot| {
            let young = slot.fetched_at.is_some_and(|at| at.elapsed() < stale_after);
            if slot.stale || !young {
                None
            } else {
                slot.rows.clone()
            }
        })
    }

    pub fn set(&self, key: &K, rows: Vec<T>) {
        self.with_slot(key, |slot| {
            slot.rows = Some(rows);
            slot.stale = false;
            slot.fetched_at = Some(Instant::now());
        });
    }

    /// Mark the slot for refetch. Cached rows stay readable until then.
    pub fn invalidate(&self, key: &K) {
        log::debug!("cache: invalidate {:?}", key);
        self.with_slot(key, |slot| {
            slot.stale = true;
            slot.generation += 1;
        });
    }

    pub fn is_stale(&self, key: &K) -> bool {
        self.fresh(key).is_none()
    }

    pub fn begin_fetch(&self, key: &K) -> FetchTicket<K> {
        let generation = self.with_slot(key, |slot| slot.generation);
        FetchTicket {
            key: key.clone(),
            generation,
        }
    }

    /// Store fetched rows unless the slot moved on since the fetch began.
    /// Returns whether the rows were accepted.
    pub fn complete_fetch(&self, ticket: FetchTicket<K>, rows: Vec<T>) -> bool {
        let accepted = self.with_slot(&ticket.key, |slot| {
            if slot.generation != ticket.generation {
                return false;
            }
            slot.rows = Some(rows);
            slot.stale = false;
            slot.fetched_at = Some(Instant::now());
            true
        });
        if !accepted {
            log::debug!("cache: dropped superseded fetch for {:?}", ticket.key);
        }
        accepted
    }

    /// Make any fetch currently in flight for `key` land nowhere.
    pub fn cancel_fetches(&self, key: &K) {
        self.with_slot(key, |slot| slot.generation += 1);
    }

    /// Edit the cached rows in place, creating an empty (stale) list if the key was never loaded.
    pub fn patch(&self, key: &K, f: impl FnOnce(&mut Vec<T>)) {
        self.with_slot(key, |slot| {
            if slot.rows.is_none() {
                slot.stale = true;
            }
            f(slot.rows.get_or_insert_with(Vec::new));
        });
    }

    fn restore(&self, key: &K, snapshot: Option<Vec<T>>) {
        self.with_slot(key, |slot| slot.rows = snapshot);
    }

    /// Start an optimistic mutation against `key`: cancel fetches and snapshot.
    pub fn transaction(&self, key: K) -> Transaction<'_, K, T> {
        self.cancel_fetches(&key);
        let snapshot = self.get(&key);
        Transaction {
            store: self,
            key,
            snapshot,
            settled: false,
        }
    }
}

/// One optimistic mutation. Owns the snapshot taken when it began, so
/// overlapping mutations on the same key each roll back to their own prior
/// state. Settling always invalidates the key.
pub struct Transaction<'a, K, T>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
    T: Clone,
{
    store: &'a Store<K, T>,
    key: K,
    snapshot: Option<Vec<T>>,
    settled: bool,
}

impl<'a, K, T> Transaction<'a, K, T>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
    T: Clone,
{
    /// Apply the optimistic effect. Readers see it immediately.
    pub fn apply(&self, f: impl FnOnce(&mut Vec<T>)) {
        self.store.patch(&self.key, f);
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn commit(mut self) {
        self.settled = true;
        self.store.invalidate(&self.key);
    }

    pub fn rollback(mut self) {
        self.settled = true;
        log::debug!("cache: rolling back {:?}", self.key);
        self.store.restore(&self.key, self.snapshot.take());
        self.store.invalidate(&self.key);
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the result through.
    pub fn settle<R>(self, result: Result<R>) -> Result<R> {
        match &result {
            Ok(_) => self.commit(),
            Err(e) => {
                log::warn!("mutation on {:?} failed: {}", self.key, e);
                self.rollback();
            }
        }
        result
    }
}

impl<K, T> Drop for Transaction<'_, K, T>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
    T: Clone,
{
    fn drop(&mut self) {
        // A mutation abandoned mid-flight leaves an unknown server state behind.
        if !self.settled {
            self.store.invalidate(&self.key);
        }
    }
}

/// The cache shared by every service in the process.
pub struct EntityCache {
    notes: Store<NoteView, Note>,
    tasks: Store<Uuid, Task>,
}

impl EntityCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            notes: Store::new(stale_after),
            tasks: Store::new(stale_after),
        }
    }

    pub fn notes(&self) -> &Store<NoteView, Note> {
        &self.notes
    }

    /// Task lists, keyed by owning note.
    pub fn tasks(&self) -> &Store<Uuid, Task> {
        &self.tasks
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn store() -> Store<&'static str, char> {
        Store::new(Duration::from_secs(60))
    }

    #[test]
    fn failed_delete_rolls_back_in_order() {
        let s = store();
        s.set(&"k", vec!['A', 'B', 'C']);

        let tx = s.transaction("k");
        tx.apply(|rows| rows.retain(|c| *c != 'B'));
        assert_eq!(s.get(&"k").unwrap(), vec!['A', 'C']);

        let result: Result<()> = tx.settle(Err(Error::store(500, "boom")));
        assert!(result.is_err());
        assert_eq!(s.get(&"k").unwrap(), vec!['A', 'B', 'C']);
        assert!(s.is_stale(&"k"));
    }

    #[test]
    fn overlapping_transactions_keep_their_own_snapshots() {
        let s = store();
        s.set(&"k", vec!['A', 'B', 'C']);

        let first = s.transaction("k");
        first.apply(|rows| rows.retain(|c| *c != 'A'));
        let second = s.transaction("k");
        second.apply(|rows| rows.retain(|c| *c != 'B'));
        assert_eq!(s.get(&"k").unwrap(), vec!['C']);

        // The second mutation fails: back to what it saw, with the first still applied.
        second.rollback();
        assert_eq!(s.get(&"k").unwrap(), vec!['B', 'C']);
        first.commit();
        assert_eq!(s.get(&"k").unwrap(), vec!['B', 'C']);
    }

    #[test]
    fn mutation_discards_in_flight_fetch() {
        let s = store();
        s.set(&"k", vec!['A']);
        let ticket = s.begin_fetch(&"k");

        let tx = s.transaction("k");
        tx.apply(|rows| rows.push('B'));

        assert!(!s.complete_fetch(ticket, vec!['Z']));
        assert_eq!(s.get(&"k").unwrap(), vec!['A', 'B']);
        tx.commit();
    }

    #[test]
    fn fetch_after_invalidate_is_fresh() {
        let s = store();
        assert!(s.is_stale(&"k"));
        let ticket = s.begin_fetch(&"k");
        assert!(s.complete_fetch(ticket, vec!['A']));
        assert_eq!(s.fresh(&"k"), Some(vec!['A']));
        s.invalidate(&"k");
        assert_eq!(s.fresh(&"k"), None);
        assert_eq!(s.get(&"k"), Some(vec!['A']));
    }

    #[test]
    fn abandoned_transaction_invalidates() {
        let s = store();
        s.set(&"k", vec!['A']);
        {
            let tx = s.transaction("k");
            tx.apply(|rows| rows.clear());
        }
        assert!(s.is_stale(&"k"));
    }

    #[tokio::test(start_paused = true)]
    async fn rows_go_stale_after_the_window() {
        let s = store();
        s.set(&"k", vec!['A']);
        assert!(!s.is_stale(&"k"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(s.is_stale(&"k"));
    }
}
