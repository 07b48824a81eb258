//! Queued operations that a cluster state transition may have to abort.
//!
//! The queue itself belongs to the persistence side of the node. The ownership checks only need a way
//! to pull out every operation a transition invalidated, which is what [`PendingOperations`] offers.
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    message::{classifier::mutation_class, StorageCommand},
    ownership::predicate::AbortPredicate,
};

pub trait PendingOperations: Send + Sync {
    /// Removes and returns every mutating operation whose bucket matches `predicate`.
    /// Non-mutating operations (eg: `get`, `visit`) are never returned.
    /// Returned operations must not be executed. The caller answers them with an aborted reply.
    fn abort_matching(&self, predicate: &AbortPredicate) -> Vec<StorageCommand>;
}

/// FIFO queue of operations waiting for persistence
#[derive(Debug, Default)]
pub struct InMemoryOperationQueue {
    queue: Mutex<VecDeque<StorageCommand>>,
}

impl InMemoryOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_lock(&self) -> MutexGuard<VecDeque<StorageCommand>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, cmd: StorageCommand) {
        self.acquire_lock().push_back(cmd);
    }

    /// Takes the next operation to execute
    pub fn pop(&self) -> Option<StorageCommand> {
        self.acquire_lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.acquire_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PendingOperations for InMemoryOperationQueue {
    fn abort_matching(&self, predicate: &AbortPredicate) -> Vec<StorageCommand> {
        if !predicate.may_abort() {
            return Vec::new();
        }

        let mut queue = self.acquire_lock();
        let mut aborted = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for cmd in queue.drain(..) {
            if mutation_class(cmd.kind).is_some() && predicate.should_abort(&cmd.bucket) {
                aborted.push(cmd);
            } else {
                kept.push_back(cmd);
            }
        }
        *queue = kept;

        aborted
    }
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::Arc};

    use crate::{
        bucket::{Bucket, BucketId, BucketSpace},
        cluster::{
            distribution::{Distribution, DistributionConfigBundle},
            state::ClusterStateBundle,
        },
        message::{CommandKind, StorageCommand},
        ownership::{
            predicate::AbortPredicate,
            snapshot::{Owner, OwnershipSnapshot},
        },
    };

    use super::{InMemoryOperationQueue, PendingOperations};

    fn snapshot(state: &str) -> Arc<OwnershipSnapshot> {
        Arc::new(OwnershipSnapshot::new(
            Some(Arc::new(ClusterStateBundle::from_str(state).unwrap())),
            Some(Arc::new(DistributionConfigBundle::from_default(
                Distribution::new(1, 1),
            ))),
            0,
        ))
    }

    fn command(id: u64, kind: CommandKind, location: u64) -> StorageCommand {
        StorageCommand::new(
            id,
            kind,
            Bucket::new(BucketSpace::Default, BucketId::new(16, location)),
            0,
        )
    }

    fn put(id: u64, location: u64) -> StorageCommand {
        command(id, CommandKind::Put, location)
    }

    #[test]
    fn fifo_order() {
        let queue = InMemoryOperationQueue::new();
        assert!(queue.is_empty());
        queue.push(put(1, 1));
        queue.push(put(2, 2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().id, 1);
        assert_eq!(queue.pop().unwrap().id, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn removes_only_matching_operations_and_keeps_order() {
        let old = snapshot("distributor:3 storage:1");
        let new = snapshot("distributor:3 .2.s:d storage:1");
        let predicate = AbortPredicate::build(old.clone(), new);

        let queue = InMemoryOperationQueue::new();
        let mut expected_aborted = Vec::new();
        let mut expected_kept = Vec::new();
        for location in 0..100 {
            let cmd = put(location, location);
            if old.owner_of(&cmd.bucket) == Owner::Node(2) {
                expected_aborted.push(cmd.id);
            } else {
                expected_kept.push(cmd.id);
            }
            queue.push(cmd);
        }
        assert!(!expected_aborted.is_empty());

        let aborted: Vec<_> = queue
            .abort_matching(&predicate)
            .into_iter()
            .map(|cmd| cmd.id)
            .collect();
        assert_eq!(aborted, expected_aborted);

        let mut kept = Vec::new();
        while let Some(cmd) = queue.pop() {
            kept.push(cmd.id);
        }
        assert_eq!(kept, expected_kept);
    }

    #[test]
    fn no_prior_state_leaves_the_queue_alone() {
        let predicate = AbortPredicate::build(
            Arc::new(OwnershipSnapshot::uninitialized(0)),
            snapshot("distributor:2 storage:1"),
        );
        let queue = InMemoryOperationQueue::new();
        for location in 0..10 {
            queue.push(put(location, location));
        }

        assert!(queue.abort_matching(&predicate).is_empty());
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn non_mutating_operations_are_never_aborted() {
        let predicate = AbortPredicate::build(
            snapshot("distributor:2 storage:1"),
            snapshot("distributor:2 .0.s:d .1.s:d storage:1"),
        );
        let queue = InMemoryOperationQueue::new();
        queue.push(command(1, CommandKind::Get, 4));
        queue.push(command(2, CommandKind::Put, 4));
        queue.push(command(3, CommandKind::Visit, 4));
        queue.push(command(4, CommandKind::Stat, 4));
        queue.push(command(5, CommandKind::SplitBucket, 4));

        let aborted: Vec<_> = queue
            .abort_matching(&predicate)
            .into_iter()
            .map(|cmd| cmd.id)
            .collect();
        assert_eq!(aborted, vec![2, 5]);

        let mut kept = Vec::new();
        while let Some(cmd) = queue.pop() {
            kept.push(cmd.kind);
        }
        assert_eq!(
            kept,
            vec![CommandKind::Get, CommandKind::Visit, CommandKind::Stat]
        );
    }
}
