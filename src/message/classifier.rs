//! Classifies inbound messages for the ownership checks.
//!
//! We consider the following operations as mutating ideal state operations:
//!  - split bucket
//!  - join buckets
//!  - merge buckets
//!  - remove location (technically external load, but used by garbage collection and therefore included here)
//!  - set bucket state
//!  - delete bucket
//!  - create bucket
//!
//! And the following as mutating external load operations:
//!  - put
//!  - update
//!  - remove
//!  - revert
//!
//! Everything else is irrelevant for ownership and passes through untouched.
use crate::bucket::Bucket;

use super::{CommandKind, StorageMessage};

/// The bucket a mutating command touches and the distributor claiming to own it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedTarget {
    pub bucket: Bucket,
    pub claimed_owner: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Irrelevant,
    MutatingIdealState(OwnedTarget),
    MutatingExternalLoad(OwnedTarget),
    Reply,
}

/// Class of a mutating operation. Each class has its own switch and abort counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationClass {
    IdealState,
    ExternalLoad,
}

impl Classification {
    pub fn mutation(&self) -> Option<(MutationClass, OwnedTarget)> {
        match self {
            Classification::MutatingIdealState(target) => Some((MutationClass::IdealState, *target)),
            Classification::MutatingExternalLoad(target) => {
                Some((MutationClass::ExternalLoad, *target))
            }
            Classification::Irrelevant | Classification::Reply => None,
        }
    }
}

pub fn mutation_class(kind: CommandKind) -> Option<MutationClass> {
    match kind {
        CommandKind::SplitBucket
        | CommandKind::JoinBuckets
        | CommandKind::MergeBuckets
        | CommandKind::RemoveLocation
        | CommandKind::SetBucketState
        | CommandKind::DeleteBucket
        | CommandKind::CreateBucket => Some(MutationClass::IdealState),
        CommandKind::Put | CommandKind::Update | CommandKind::Remove | CommandKind::Revert => {
            Some(MutationClass::ExternalLoad)
        }
        CommandKind::Get
        | CommandKind::Visit
        | CommandKind::Stat
        | CommandKind::RequestBucketInfo
        | CommandKind::GetBucketDiff
        | CommandKind::ApplyBucketDiff => None,
    }
}

pub fn classify(message: &StorageMessage) -> Classification {
    match message {
        StorageMessage::Command(cmd) => {
            let target = OwnedTarget {
                bucket: cmd.bucket,
                claimed_owner: cmd.source_index,
            };
            match mutation_class(cmd.kind) {
                Some(MutationClass::IdealState) => Classification::MutatingIdealState(target),
                Some(MutationClass::ExternalLoad) => Classification::MutatingExternalLoad(target),
                None => Classification::Irrelevant,
            }
        }
        StorageMessage::Reply(_) => Classification::Reply,
        StorageMessage::SetSystemState(_) => Classification::Irrelevant,
    }
}
