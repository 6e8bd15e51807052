//! In-memory series registry: label set to ref mapping and per-ref state.
//!
//! The registry is owned by the storage engine and injected into appenders
//! and the replayer; there is no process-wide singleton. Lookups take a
//! read lock, the create path serializes behind the write lock so two
//! concurrent callers with an equal label set can never be assigned
//! different refs.

use crate::record::{Labels, RefExemplar, SeriesRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// In-memory state for a single registered series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEntry {
    /// Stable ref of the series.
    pub ref_id: SeriesRef,
    /// Label set identifying the series.
    pub labels: Labels,
    /// Highest timestamp committed for this series, in milliseconds.
    pub last_ts: i64,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_labels: HashMap<Labels, SeriesRef>,
    by_ref: HashMap<SeriesRef, SeriesEntry>,
    // Last staged-or-committed exemplar per ref, kept only for
    // deduplication. Rebuildable from the last replayed exemplar record.
    last_exemplar: HashMap<SeriesRef, RefExemplar>,
}

/// Registry of all live series.
#[derive(Debug, Default)]
pub struct SeriesRegistry {
    state: RwLock<RegistryState>,
    // Last allocated ref; 0 before the first allocation.
    last_ref: AtomicU64,
}

impl SeriesRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the ref for a label set, allocating a new one if the label
    /// set has not been seen before. Returns the ref and whether it was
    /// newly created.
    pub fn get_or_create(&self, labels: &Labels) -> (SeriesRef, bool) {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(&ref_id) = state.by_labels.get(labels) {
                return (ref_id, false);
            }
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        // Re-check: another writer may have created the entry between the
        // read unlock and the write lock.
        if let Some(&ref_id) = state.by_labels.get(labels) {
            return (ref_id, false);
        }

        let ref_id = self.last_ref.fetch_add(1, Ordering::Relaxed) + 1;
        state.by_labels.insert(labels.clone(), ref_id);
        state.by_ref.insert(
            ref_id,
            SeriesEntry {
                ref_id,
                labels: labels.clone(),
                last_ts: 0,
            },
        );
        (ref_id, true)
    }

    /// Registers a series at a ref carried by a replayed record, preserving
    /// the ref value and bumping the allocator past it.
    pub fn restore(&self, ref_id: SeriesRef, labels: Labels) {
        self.observe_ref(ref_id);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.by_labels.insert(labels.clone(), ref_id);
        state.by_ref.insert(
            ref_id,
            SeriesEntry {
                ref_id,
                labels,
                last_ts: 0,
            },
        );
    }

    /// Removes a series entry, keeping its ref retired forever.
    pub fn remove(&self, ref_id: SeriesRef) {
        self.observe_ref(ref_id);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.by_ref.remove(&ref_id) {
            state.by_labels.remove(&entry.labels);
        }
        state.last_exemplar.remove(&ref_id);
    }

    /// Raises `last_ts` for a ref to at least `ts`. Unknown refs are
    /// ignored.
    pub fn update_timestamp(&self, ref_id: SeriesRef, ts: i64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.by_ref.get_mut(&ref_id) {
            entry.last_ts = entry.last_ts.max(ts);
        }
    }

    /// Returns the entry for a ref, if registered.
    pub fn get(&self, ref_id: SeriesRef) -> Option<SeriesEntry> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_ref.get(&ref_id).cloned()
    }

    /// Returns true if the ref is currently registered.
    pub fn contains(&self, ref_id: SeriesRef) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_ref.contains_key(&ref_id)
    }

    /// Number of live series.
    pub fn count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_ref.len()
    }

    /// Point-in-time snapshot of all live entries, ordered by ref.
    ///
    /// Each call returns a fresh, finite sequence; mutations after the call
    /// are not reflected.
    pub fn entries(&self) -> Vec<SeriesEntry> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<SeriesEntry> = state.by_ref.values().cloned().collect();
        entries.sort_by_key(|e| e.ref_id);
        entries
    }

    /// Removes every series whose `last_ts` is below `min_ts` and returns
    /// the removed refs. Their refs stay retired.
    pub fn gc(&self, min_ts: i64) -> Vec<SeriesRef> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<SeriesRef> = state
            .by_ref
            .values()
            .filter(|e| e.last_ts < min_ts)
            .map(|e| e.ref_id)
            .collect();
        for ref_id in &stale {
            if let Some(entry) = state.by_ref.remove(ref_id) {
                state.by_labels.remove(&entry.labels);
            }
            state.last_exemplar.remove(ref_id);
        }
        stale
    }

    /// Last staged-or-committed exemplar for a ref, if any.
    pub fn last_exemplar(&self, ref_id: SeriesRef) -> Option<RefExemplar> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.last_exemplar.get(&ref_id).cloned()
    }

    /// Replaces the cached exemplar for a ref.
    pub fn set_last_exemplar(&self, ref_id: SeriesRef, exemplar: RefExemplar) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.last_exemplar.insert(ref_id, exemplar);
    }

    /// Last allocated ref, including refs whose series were since removed.
    pub fn last_ref(&self) -> SeriesRef {
        self.last_ref.load(Ordering::Relaxed)
    }

    fn observe_ref(&self, ref_id: SeriesRef) {
        self.last_ref.fetch_max(ref_id, Ordering::Relaxed);
    }
}
