use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Advisory cache of the last version observed per context id.
///
/// A context id is either unknown (absent) or known at some version. Known
/// versions only move forward: an observation older than the tracked value is
/// ignored, so responses completing out of order never regress it. The cache
/// is never authoritative and can be dropped at any time without data loss.
#[derive(Debug, Default)]
pub struct VersionTracker {
    versions: RwLock<HashMap<String, AtomicU64>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `version` for `context_id` if it is newer than what is tracked.
    ///
    /// Returns the tracked version after the observation.
    pub fn observe(&self, context_id: &str, version: u64) -> u64 {
        if let Some(slot) = self.read().get(context_id) {
            return advance(slot, version);
        }

        let mut versions = self.write();
        match versions.get(context_id) {
            Some(slot) => advance(slot, version),
            None => {
                versions.insert(context_id.to_string(), AtomicU64::new(version));
                version
            }
        }
    }

    /// Last known version, or `None` while the context id is unknown
    pub fn expected(&self, context_id: &str) -> Option<u64> {
        self.read()
            .get(context_id)
            .map(|slot| slot.load(Ordering::Acquire))
    }

    /// Start the context id over, replacing whatever was tracked.
    ///
    /// Unlike [`observe`](Self::observe) this may lower the version: a freshly
    /// created context begins a new history. `None` leaves it unknown.
    pub fn seed(&self, context_id: &str, version: Option<u64>) {
        let mut versions = self.write();
        match version {
            Some(version) => {
                versions.insert(context_id.to_string(), AtomicU64::new(version));
            }
            None => {
                versions.remove(context_id);
            }
        }
    }

    /// Forget the context id; the next mutation sends no precondition
    pub fn reset(&self, context_id: &str) {
        self.write().remove(context_id);
    }

    /// Forget every context id
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AtomicU64>> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AtomicU64>> {
        self.versions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn advance(slot: &AtomicU64, version: u64) -> u64 {
    slot.fetch_max(version, Ordering::AcqRel).max(version)
}
