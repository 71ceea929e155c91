use crate::types::CanonicalPlate;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Plates that are fully handled: whitelisted, already paid, or paid through us.
///
/// Entries never expire; only `reset` removes them.
#[derive(Debug, Default)]
pub struct DedupLedger {
    plates: Mutex<HashSet<CanonicalPlate>>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn plates(&self) -> MutexGuard<'_, HashSet<CanonicalPlate>> {
        self.plates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn already_handled(&self, plate: &CanonicalPlate) -> bool {
        self.plates().contains(plate)
    }

    /// Returns false if the plate was already present.
    pub fn mark_handled(&self, plate: &CanonicalPlate) -> bool {
        self.plates().insert(plate.clone())
    }

    /// Empties the ledger, returning how many plates were removed.
    pub fn reset(&self) -> usize {
        let mut plates = self.plates();
        let count = plates.len();
        plates.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.plates().len()
    }
}
