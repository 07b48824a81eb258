//! Lazy abort predicate built from an (old, new) pair of [`OwnershipSnapshot`]s.
//!
//! The bucket universe is unbounded, so a transition never computes a full ownership diff.
//! Instead the predicate captures both snapshots and re-resolves ownership of a single bucket each
//! time it's evaluated. Only buckets named by queued or in-flight operations are ever looked at.
//!
//! The predicate is conservative: if the owner can't be resolved under the new snapshot, the operation
//! is considered affected. Aborting a valid operation costs a retry, silently continuing an invalid one
//! can corrupt a bucket.
use std::sync::Arc;

use tracing::{event, Level};

use crate::{
    bucket::Bucket,
    cluster::{distribution::DISTRIBUTOR_UP_STATES, state::NodeType},
};

use super::snapshot::OwnershipSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// There is no prior ownership to have changed from
    Never,
    /// Every distributor is down in the new state, nobody can own anything
    AbortAll,
    /// Compare ownership bucket by bucket
    Diff,
}

#[derive(Debug, Clone)]
pub struct AbortPredicate {
    old: Arc<OwnershipSnapshot>,
    new: Arc<OwnershipSnapshot>,
    mode: Mode,
}

impl AbortPredicate {
    /// Builds the predicate for the transition `old` -> `new`. No ownership is computed here.
    pub fn build(old: Arc<OwnershipSnapshot>, new: Arc<OwnershipSnapshot>) -> Self {
        let mode = if !old.valid() || !new.valid() {
            Mode::Never
        } else if new
            .baseline_state()
            .nodes_in_states(NodeType::Distributor, &DISTRIBUTOR_UP_STATES)
            .is_empty()
        {
            Mode::AbortAll
        } else {
            Mode::Diff
        };

        Self { old, new, mode }
    }

    /// True if operations on `bucket` must be aborted because of this transition
    pub fn should_abort(&self, bucket: &Bucket) -> bool {
        match self.mode {
            Mode::Never => false,
            Mode::AbortAll => true,
            Mode::Diff => self.ownership_changed(bucket),
        }
    }

    fn ownership_changed(&self, bucket: &Bucket) -> bool {
        let new_owner = self.new.owner_of(bucket);
        if !new_owner.is_resolved() {
            event!(
                Level::TRACE,
                "Owner of {} can't be resolved after the transition ({:?})",
                bucket,
                new_owner
            );
            return true;
        }

        let old_owner = self.old.owner_of(bucket);
        if old_owner != new_owner {
            event!(
                Level::TRACE,
                "Owner of {} changed from {:?} to {:?}",
                bucket,
                old_owner,
                new_owner
            );
            return true;
        }

        if !self.new.node_up(bucket.space, self.new.node_index()) {
            event!(
                Level::TRACE,
                "Storage node {} no longer up in space {}",
                self.new.node_index(),
                bucket.space
            );
            return true;
        }

        false
    }

    pub fn old(&self) -> &Arc<OwnershipSnapshot> {
        &self.old
    }

    pub fn new_snapshot(&self) -> &Arc<OwnershipSnapshot> {
        &self.new
    }

    /// Whether this predicate can ever be true. False only when there was no prior ownership.
    pub fn may_abort(&self) -> bool {
        self.mode != Mode::Never
    }
}
