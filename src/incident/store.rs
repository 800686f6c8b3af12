//! Single serialization point for the incident record.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::state::IncidentRecord;

/// Owns the incident record. Readers get clones; writers go through
/// [`IncidentStore::mutate`], one at a time.
#[derive(Debug, Default)]
pub struct IncidentStore {
    inner: Mutex<IncidentRecord>,
}

impl IncidentStore {
    pub fn new() -> Self {
        Self::with_record(IncidentRecord::new())
    }

    pub fn with_record(record: IncidentRecord) -> Self {
        Self { inner: Mutex::new(record) }
    }

    /// Point-in-time copy of the record.
    pub fn read(&self) -> IncidentRecord {
        self.lock().clone()
    }

    /// Apply `f` to a working copy under the lock and commit it when `f`
    /// returns. Returns the committed snapshot and whatever `f` produced.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut IncidentRecord) -> T) -> (IncidentRecord, T) {
        let mut guard = self.lock();
        let mut working = guard.clone();
        let out = f(&mut working);
        *guard = working;
        (guard.clone(), out)
    }

    // Commits are all-or-nothing, so a poisoned lock still guards a whole record.
    fn lock(&self) -> MutexGuard<'_, IncidentRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
