//! The distribution decides which nodes should own a given bucket.
//!
//! Ownership is computed with weighted rendezvous hashing: for every candidate node we hash the
//! bucket seed together with the node index and pick the node(s) with the highest score.
//! The score is `u^(1/capacity)` where `u` is the hash mapped into (0, 1), so nodes with a higher capacity
//! win proportionally more often.
//!
//! The important property (same as consistent hashing) is that when a node goes down or comes back,
//! only the buckets whose best scoring node changed get a new owner. Everything else stays put.
//!
//! The seed of a bucket only contains its lowest `distribution_bits` location bits (see [`crate::bucket`]),
//! which means a bucket and all its split children are always owned by the same distributor.
use std::{collections::HashMap, io::Cursor, sync::Arc};

use bytes::{BufMut, BytesMut};
use murmur3::murmur3_x86_128;
use serde::{Deserialize, Serialize};

use crate::{
    bucket::{BucketId, BucketSpace},
    cluster::state::{ClusterState, NodeState, NodeType},
};

/// States in which a distributor may own buckets
pub const DISTRIBUTOR_UP_STATES: [NodeState; 2] = [NodeState::Up, NodeState::Initializing];

#[derive(Debug, Clone, PartialEq)]
pub enum DistributionError {
    /// The bucket uses fewer bits than the cluster state's distribution bit count
    TooFewBucketBitsInUse { used: u8, required: u8 },
    /// No distributor is in a state where it could own buckets
    NoDistributorsAvailable,
}

impl std::fmt::Display for DistributionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for DistributionError {}

fn default_capacity() -> f64 {
    1.0
}

/// A node listed in the distribution config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredNode {
    pub index: u16,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
}

/// Partitioning scheme for a single bucket space.
///
/// If `nodes` is empty every node in the cluster state is a candidate with capacity 1.0.
/// Otherwise only the listed node indexes are candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub redundancy: u16,
    #[serde(default)]
    pub ready_copies: u16,
    #[serde(default)]
    pub nodes: Vec<ConfiguredNode>,
}

impl Distribution {
    pub fn new(redundancy: u16, ready_copies: u16) -> Self {
        Self {
            redundancy,
            ready_copies,
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<ConfiguredNode>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Returns the capacity of the given node or None if the node is not part of this distribution
    fn capacity(&self, index: u16) -> Option<f64> {
        if self.nodes.is_empty() {
            return Some(default_capacity());
        }

        self.nodes
            .iter()
            .find(|node| node.index == index)
            .map(|node| node.capacity)
            .filter(|capacity| *capacity > 0.0)
    }

    /// Computes the distributor that should own `bucket` under `state`.
    ///
    /// # Errors
    ///  1. [`DistributionError::TooFewBucketBitsInUse`] if the bucket is not specific enough to be assigned an owner
    ///  2. [`DistributionError::NoDistributorsAvailable`] if no distributor is up
    pub fn ideal_distributor(
        &self,
        state: &ClusterState,
        bucket: BucketId,
    ) -> Result<u16, DistributionError> {
        let seed = self.checked_seed(state, bucket)?;
        let mut best: Option<(f64, u16)> = None;
        for index in state.nodes_in_states(NodeType::Distributor, &DISTRIBUTOR_UP_STATES) {
            let Some(capacity) = self.capacity(index) else {
                continue;
            };

            let score = weighted_score(NodeType::Distributor, seed, index, capacity);
            // ties go to the lowest index, which is the one seen first
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, index));
            }
        }

        best.map(|(_, index)| index)
            .ok_or(DistributionError::NoDistributorsAvailable)
    }

    /// Computes the ordered list of storage nodes that should hold a replica of `bucket`.
    ///
    /// Only nodes whose state is in `up_states` are candidates. At most `redundancy` nodes are returned,
    /// best scoring first.
    pub fn ideal_storage_nodes(
        &self,
        state: &ClusterState,
        bucket: BucketId,
        up_states: &[NodeState],
    ) -> Result<Vec<u16>, DistributionError> {
        let seed = self.checked_seed(state, bucket)?;
        let mut scored: Vec<(f64, u16)> = state
            .nodes_in_states(NodeType::Storage, up_states)
            .into_iter()
            .filter_map(|index| {
                self.capacity(index)
                    .map(|capacity| (weighted_score(NodeType::Storage, seed, index, capacity), index))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(self.redundancy as usize)
            .map(|(_, index)| index)
            .collect())
    }

    fn checked_seed(&self, state: &ClusterState, bucket: BucketId) -> Result<u64, DistributionError> {
        let required = state.distribution_bits();
        if bucket.used_bits() < required || bucket.used_bits() == 0 {
            return Err(DistributionError::TooFewBucketBitsInUse {
                used: bucket.used_bits(),
                required,
            });
        }

        Ok(bucket.seed(required))
    }
}

/// murmur3 hash of (node type, seed, node index)
fn node_hash(node_type: NodeType, seed: u64, index: u16) -> u128 {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(match node_type {
        NodeType::Distributor => 0,
        NodeType::Storage => 1,
    });
    buf.put_u64_le(seed);
    buf.put_u16_le(index);

    murmur3_x86_128(&mut Cursor::new(&buf[..]), 0).expect("reading from an in-memory cursor")
}

fn weighted_score(node_type: NodeType, seed: u64, index: u16, capacity: f64) -> f64 {
    // keep the 53 most significant bits so the value is exactly representable as an f64 mantissa
    let bits = (node_hash(node_type, seed, index) >> 75) as u64;
    let unit = (bits as f64 + 0.5) / (1u64 << 53) as f64;
    unit.powf(1.0 / capacity)
}

/// One [`Distribution`] per bucket space
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionConfigBundle {
    spaces: HashMap<BucketSpace, Arc<Distribution>>,
}

impl DistributionConfigBundle {
    /// Builds a bundle from the default space distribution.
    ///
    /// The global space keeps a replica on every configured node, so its redundancy and ready copies
    /// are raised to the number of configured nodes.
    pub fn from_default(default: Distribution) -> Self {
        let mut global = default.clone();
        let all_nodes = (global.nodes.len() as u16).max(global.redundancy);
        global.redundancy = all_nodes;
        global.ready_copies = all_nodes;

        let mut spaces = HashMap::new();
        spaces.insert(BucketSpace::Default, Arc::new(default));
        spaces.insert(BucketSpace::Global, Arc::new(global));
        Self { spaces }
    }

    /// Overrides the distribution of a single bucket space
    pub fn with_space(mut self, space: BucketSpace, distribution: Distribution) -> Self {
        self.spaces.insert(space, Arc::new(distribution));
        self
    }

    pub fn bucket_space_distribution(&self, space: BucketSpace) -> &Distribution {
        // both spaces are always inserted by `from_default`
        &self.spaces[&space]
    }
}
