//! This file contains the [`OwnershipSnapshot`] data structure.
//!
//! A snapshot is an immutable pair of ([`ClusterStateBundle`], [`DistributionConfigBundle`]) that answers
//! questions like: which distributor owns a given bucket? Is a given storage node up?
//!
//! It's possible to have a snapshot without a cluster state (or without a distribution) when the node
//! initially starts up. That's why no snapshot must be queried for ownership unless [`OwnershipSnapshot::valid`]
//! returns true. Querying an invalid snapshot is a programming error and panics.
use std::sync::Arc;

use tracing::{event, Level};

use crate::{
    bucket::{Bucket, BucketSpace},
    cluster::{
        distribution::{Distribution, DistributionConfigBundle, DistributionError},
        state::{ClusterState, ClusterStateBundle, NodeState, NodeType},
    },
};

/// Storage node states in which a node is considered available for load
pub const STORAGE_UP_STATES: [NodeState; 3] =
    [NodeState::Up, NodeState::Initializing, NodeState::Retired];

/// Storage node states considered when picking which replicas should be ready
const READY_STATES: [NodeState; 3] = STORAGE_UP_STATES;

/// Result of an ownership lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Index of the distributor owning the bucket
    Node(u16),
    /// The bucket id uses too few bits to have an owner
    Undefined,
    /// No distributor can own the bucket under the current cluster state
    FailedToResolve,
}

impl Owner {
    /// Sentinel used where an owner has to be represented as a plain node index
    pub const FAILED_TO_RESOLVE: u16 = 0xffff;

    pub fn is_resolved(&self) -> bool {
        matches!(self, Owner::Node(_))
    }

    /// Plain node index representation. Anything but [`Owner::Node`] maps to [`Owner::FAILED_TO_RESOLVE`].
    pub fn as_index(&self) -> u16 {
        match self {
            Owner::Node(index) => *index,
            Owner::Undefined | Owner::FailedToResolve => Self::FAILED_TO_RESOLVE,
        }
    }
}

/// Three valued answer used when "don't know" must be distinguishable from "no"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trinary {
    True,
    False,
    Undefined,
}

impl From<bool> for Trinary {
    fn from(v: bool) -> Self {
        if v {
            Trinary::True
        } else {
            Trinary::False
        }
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipSnapshot {
    state: Option<Arc<ClusterStateBundle>>,
    distributions: Option<Arc<DistributionConfigBundle>>,
    /// Index of the storage node this snapshot is evaluated on
    node_index: u16,
    /// Assigned by [`super::store::OwnershipStateStore`] on install. Strictly increasing.
    generation: u64,
}

impl OwnershipSnapshot {
    pub fn new(
        state: Option<Arc<ClusterStateBundle>>,
        distributions: Option<Arc<DistributionConfigBundle>>,
        node_index: u16,
    ) -> Self {
        Self {
            state,
            distributions,
            node_index,
            generation: 0,
        }
    }

    /// A snapshot with no ownership basis (node startup)
    pub fn uninitialized(node_index: u16) -> Self {
        Self::new(None, None, node_index)
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn valid(&self) -> bool {
        self.state.is_some() && self.distributions.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node_index(&self) -> u16 {
        self.node_index
    }

    pub fn cluster_state_bundle(&self) -> Option<&Arc<ClusterStateBundle>> {
        self.state.as_ref()
    }

    pub fn distributions(&self) -> Option<&Arc<DistributionConfigBundle>> {
        self.distributions.as_ref()
    }

    fn bundle(&self) -> &ClusterStateBundle {
        match &self.state {
            Some(state) => state.as_ref(),
            None => panic!("OwnershipSnapshot queried without a cluster state. Check valid() first"),
        }
    }

    fn space_inputs(&self, space: BucketSpace) -> (&ClusterState, &Distribution) {
        match (&self.state, &self.distributions) {
            (Some(state), Some(distributions)) => (
                state.derived_state(space),
                distributions.bucket_space_distribution(space),
            ),
            _ => panic!("OwnershipSnapshot queried while not valid(). Check valid() first"),
        }
    }

    /// Precondition: valid() == true.
    pub fn baseline_state(&self) -> &ClusterState {
        self.bundle().baseline()
    }

    /// Computes the distributor owning `bucket`.
    ///
    /// Precondition: valid() == true.
    pub fn owner_of(&self, bucket: &Bucket) -> Owner {
        let (state, distribution) = self.space_inputs(bucket.space);
        match distribution.ideal_distributor(state, bucket.id) {
            Ok(index) => Owner::Node(index),
            Err(DistributionError::TooFewBucketBitsInUse { used, required }) => {
                event!(
                    Level::DEBUG,
                    "Too few bucket bits used for {} to be assigned a distributor ({} < {})",
                    bucket,
                    used,
                    required
                );
                Owner::Undefined
            }
            Err(DistributionError::NoDistributorsAvailable) => {
                event!(
                    Level::DEBUG,
                    "No distributors available when resolving owner of {} in state '{}'",
                    bucket,
                    state
                );
                Owner::FailedToResolve
            }
        }
    }

    /// Whether the given storage node is available for load in `space`.
    ///
    /// Precondition: valid() == true.
    pub fn node_up(&self, space: BucketSpace, node_index: u16) -> bool {
        self.node_state_one_of(space, node_index, &STORAGE_UP_STATES)
    }

    /// Returns false if the cluster controller deemed the whole cluster unusable
    ///
    /// Precondition: valid() == true.
    pub fn cluster_up(&self) -> bool {
        self.baseline_state().cluster_up()
    }

    /// Precondition: valid() == true.
    pub fn node_state_one_of(&self, space: BucketSpace, node_index: u16, states: &[NodeState]) -> bool {
        self.bundle()
            .derived_state(space)
            .node_state_one_of(NodeType::Storage, node_index, states)
    }

    pub fn node_initializing(&self, space: BucketSpace) -> bool {
        self.node_state_one_of(space, self.node_index, &[NodeState::Initializing])
    }

    pub fn node_retired(&self, space: BucketSpace) -> bool {
        self.node_state_one_of(space, self.node_index, &[NodeState::Retired])
    }

    /// True iff the local node is in maintenance in every bucket space
    pub fn node_maintenance(&self) -> bool {
        BucketSpace::ALL
            .iter()
            .all(|space| self.node_state_one_of(*space, self.node_index, &[NodeState::Maintenance]))
    }

    /// Whether the local node should hold a ready (searchable) replica of `bucket`.
    ///
    /// Returns [`Trinary::Undefined`] iff the bucket uses too few bits to be placed at all.
    ///
    /// Precondition: valid() == true.
    pub fn should_be_ready(&self, bucket: &Bucket) -> Trinary {
        let (state, distribution) = self.space_inputs(bucket.space);
        if bucket.id.used_bits() == 0 || bucket.id.used_bits() < state.distribution_bits() {
            return Trinary::Undefined;
        }

        if distribution.ready_copies >= distribution.redundancy {
            return Trinary::True;
        }

        match distribution.ideal_storage_nodes(state, bucket.id, &READY_STATES) {
            Ok(nodes) => nodes
                .iter()
                .take(distribution.ready_copies as usize)
                .any(|index| *index == self.node_index)
                .into(),
            Err(_) => Trinary::Undefined,
        }
    }
}
