//! Holds the current [`OwnershipSnapshot`].
//!
//! The snapshot is never mutated in place. Installing a new one replaces the shared reference under a
//! short lock, so a reader that obtained a snapshot keeps a consistent view no matter how many
//! installs happen afterwards. Ownership computations always run on a reader's own reference, outside the lock.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::snapshot::OwnershipSnapshot;

#[derive(Debug)]
struct StoreInner {
    current: Arc<OwnershipSnapshot>,
    next_generation: u64,
}

#[derive(Debug)]
pub struct OwnershipStateStore {
    inner: Mutex<StoreInner>,
}

impl OwnershipStateStore {
    pub fn new(initial: OwnershipSnapshot) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                current: Arc::new(initial.with_generation(0)),
                next_generation: 1,
            }),
        }
    }

    fn acquire_lock(&self) -> MutexGuard<StoreInner> {
        // the guarded value is only ever replaced wholesale, so a poisoned lock still holds a consistent snapshot
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current snapshot, which may or may not be valid().
    pub fn current(&self) -> Arc<OwnershipSnapshot> {
        self.acquire_lock().current.clone()
    }

    /// Replaces the current snapshot and returns the installed reference
    pub fn install(&self, snapshot: OwnershipSnapshot) -> Arc<OwnershipSnapshot> {
        self.transition(|_| snapshot).1
    }

    /// Builds the next snapshot from the current one and installs it, all under the same lock.
    ///
    /// `build` must be cheap (reference copies only): every reader is blocked while it runs.
    /// Returns the (old, new) pair.
    pub fn transition<F>(&self, build: F) -> (Arc<OwnershipSnapshot>, Arc<OwnershipSnapshot>)
    where
        F: FnOnce(&OwnershipSnapshot) -> OwnershipSnapshot,
    {
        let mut guard = self.acquire_lock();
        let old = guard.current.clone();
        let generation = guard.next_generation;
        let new = Arc::new(build(&old).with_generation(generation));
        guard.next_generation += 1;
        guard.current = new.clone();

        (old, new)
    }
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::Arc, thread};

    use crate::{
        cluster::{
            distribution::{Distribution, DistributionConfigBundle},
            state::ClusterStateBundle,
        },
        ownership::snapshot::OwnershipSnapshot,
    };

    use super::OwnershipStateStore;

    fn valid_snapshot(state: &str) -> OwnershipSnapshot {
        OwnershipSnapshot::new(
            Some(Arc::new(ClusterStateBundle::from_str(state).unwrap())),
            Some(Arc::new(DistributionConfigBundle::from_default(
                Distribution::new(1, 1),
            ))),
            0,
        )
    }

    #[test]
    fn starts_with_the_initial_snapshot() {
        let store = OwnershipStateStore::new(OwnershipSnapshot::uninitialized(3));
        let current = store.current();
        assert!(!current.valid());
        assert_eq!(current.node_index(), 3);
        assert_eq!(current.generation(), 0);
    }

    #[test]
    fn install_replaces_without_touching_previous_readers() {
        let store = OwnershipStateStore::new(OwnershipSnapshot::uninitialized(0));
        let before = store.current();

        let installed = store.install(valid_snapshot("version:1 distributor:1 storage:1"));
        assert!(Arc::ptr_eq(&installed, &store.current()));
        assert!(store.current().valid());
        // the reference obtained before the install is unchanged
        assert!(!before.valid());
        assert_eq!(before.generation(), 0);
    }

    #[test]
    fn transition_returns_old_and_new() {
        let store = OwnershipStateStore::new(valid_snapshot("version:1 distributor:1 storage:1"));
        let (old, new) = store.transition(|old| {
            OwnershipSnapshot::new(
                Some(Arc::new(
                    ClusterStateBundle::from_str("version:2 distributor:2 storage:1").unwrap(),
                )),
                old.distributions().cloned(),
                old.node_index(),
            )
        });

        assert_eq!(old.baseline_state().version(), 1);
        assert_eq!(new.baseline_state().version(), 2);
        assert!(new.generation() > old.generation());
        assert!(Arc::ptr_eq(&new, &store.current()));
    }

    #[test]
    fn generations_increase_under_concurrent_installs() {
        let store = Arc::new(OwnershipStateStore::new(OwnershipSnapshot::uninitialized(0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..100 {
                        let (old, new) = store.transition(|old| old.clone());
                        assert!(new.generation() > old.generation());
                        let seen = store.current().generation();
                        assert!(seen >= last);
                        last = seen;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.current().generation(), 400);
    }
}
