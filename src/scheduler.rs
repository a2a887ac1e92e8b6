// SPDX-License-Identifier: Apache-2.0

//! Round-robin dispatch of ready tailers.
//!
//! The scheduler hands each worker the next tailer whose identity is not
//! already in flight, walking a cursor over the ready list so every tracked
//! file gets served before any file is served twice. The in-flight set is
//! what enforces at-most-one-reader-per-identity.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::tailer::Tailer;

pub(crate) type SharedTailer = Arc<Mutex<Tailer>>;

struct Entry {
    id: String,
    tailer: SharedTailer,
}

#[derive(Default)]
struct Inner {
    ready: Vec<Entry>,
    index: HashMap<String, usize>,
    cursor: usize,
    running: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a tailer to the ready list. A duplicate id is ignored.
    pub(crate) fn add(&self, id: &str, tailer: SharedTailer) {
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(id) {
            debug!(id, "tailer already scheduled");
            return;
        }
        let pos = inner.ready.len();
        inner.ready.push(Entry {
            id: id.to_string(),
            tailer,
        });
        inner.index.insert(id.to_string(), pos);
    }

    pub(crate) fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.index.remove(id) else {
            return;
        };
        inner.ready.remove(pos);
        inner.running.remove(id);
        for entry_pos in inner.index.values_mut() {
            if *entry_pos > pos {
                *entry_pos -= 1;
            }
        }
        // A cursor at the removed slot now points at its successor; past
        // it, shift back so no entry is skipped. Wrap at the tail.
        if inner.cursor > pos {
            inner.cursor -= 1;
        }
        if inner.cursor >= inner.ready.len() {
            inner.cursor = 0;
        }
    }

    /// Clear the in-flight mark after a completed read attempt.
    pub(crate) fn set_idle(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.running.remove(id);
    }

    /// Starting at the cursor, find the first tailer not in flight, mark it
    /// running, and move the cursor past it. One full loop with no
    /// candidate returns `None`.
    pub(crate) fn next_available(&self) -> Option<(String, SharedTailer)> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.ready.len();
        if len == 0 {
            return None;
        }

        let start = inner.cursor % len;
        for step in 0..len {
            let pos = (start + step) % len;
            let entry = &inner.ready[pos];
            if !inner.running.contains(&entry.id) {
                let id = entry.id.clone();
                let tailer = entry.tailer.clone();
                inner.running.insert(id.clone());
                inner.cursor = (pos + 1) % len;
                return Some((id, tailer));
            }
        }
        None
    }

    pub(crate) fn count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileRegistry;

    fn shared_tailer(id: &str) -> SharedTailer {
        let registry = Arc::new(FileRegistry::new());
        let (tailer, _handle) = Tailer::new(id, "\n", 0, registry, None);
        Arc::new(Mutex::new(tailer))
    }

    fn scheduler_with(ids: &[&str]) -> Scheduler {
        let scheduler = Scheduler::new();
        for id in ids {
            scheduler.add(id, shared_tailer(id));
        }
        scheduler
    }

    #[test]
    fn test_empty_scheduler_has_nothing_available() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.count(), 0);
        assert!(scheduler.next_available().is_none());
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let scheduler = scheduler_with(&["a"]);
        scheduler.add("a", shared_tailer("a"));
        assert_eq!(scheduler.count(), 1);
    }

    #[test]
    fn test_round_robin_order() {
        let scheduler = scheduler_with(&["a", "b", "c"]);

        let (first, _) = scheduler.next_available().unwrap();
        scheduler.set_idle(&first);
        let (second, _) = scheduler.next_available().unwrap();
        scheduler.set_idle(&second);
        let (third, _) = scheduler.next_available().unwrap();
        scheduler.set_idle(&third);
        let (fourth, _) = scheduler.next_available().unwrap();

        assert_eq!(first, "a");
        assert_eq!(second, "b");
        assert_eq!(third, "c");
        assert_eq!(fourth, "a");
    }

    #[test]
    fn test_in_flight_identity_is_not_redispatched() {
        let scheduler = scheduler_with(&["a", "b"]);

        let (first, _) = scheduler.next_available().unwrap();
        let (second, _) = scheduler.next_available().unwrap();
        assert_ne!(first, second);

        // Both busy now; a full loop finds nothing.
        assert!(scheduler.next_available().is_none());

        scheduler.set_idle(&first);
        let (again, _) = scheduler.next_available().unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_remove_clears_in_flight_and_index() {
        let scheduler = scheduler_with(&["a", "b"]);
        let (id, _) = scheduler.next_available().unwrap();
        assert_eq!(id, "a");

        scheduler.remove("a");
        assert_eq!(scheduler.count(), 1);

        // Only "b" remains and it is idle.
        let (next, _) = scheduler.next_available().unwrap();
        assert_eq!(next, "b");
    }

    #[test]
    fn test_remove_at_cursor_advances_to_successor() {
        let scheduler = scheduler_with(&["a", "b", "c"]);

        // Cursor now points at "b".
        let (first, _) = scheduler.next_available().unwrap();
        assert_eq!(first, "a");
        scheduler.set_idle("a");

        scheduler.remove("b");
        let (next, _) = scheduler.next_available().unwrap();
        assert_eq!(next, "c");
    }

    #[test]
    fn test_remove_tail_wraps_cursor_to_head() {
        let scheduler = scheduler_with(&["a", "b", "c"]);

        scheduler.set_idle(&scheduler.next_available().unwrap().0); // a
        scheduler.set_idle(&scheduler.next_available().unwrap().0); // b

        // Cursor points at "c"; removing it wraps to the head.
        scheduler.remove("c");
        let (next, _) = scheduler.next_available().unwrap();
        assert_eq!(next, "a");
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let scheduler = scheduler_with(&["a"]);
        scheduler.remove("ghost");
        assert_eq!(scheduler.count(), 1);
    }
}
