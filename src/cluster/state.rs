//! This file contains the [`ClusterState`] and [`ClusterStateBundle`] data structures.
//!
//! A cluster state is the cluster controller's current judgment of which nodes are usable.
//! It's created by an external dissemination mechanism and only consumed (read-only) by this crate.
//! States are versioned and every new state fully replaces the previous one.
//!
//! For readability in logs and tests, a [`ClusterState`] can be parsed from (and printed to) the compact
//! textual format used by the cluster controller:
//!
//! `version:3 cluster:u bits:16 distributor:2 storage:3 .1.s:d`
//!
//! Here there are 2 distributors (both up) and 3 storage nodes where storage node 1 is down.
//! A `.I.s:X` token always refers to the node type token that precedes it.
use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::{
    bucket::{BucketSpace, MAX_USED_BITS},
    error::{Error, Result},
};

/// Distribution bit count used when a state doesn't specify one
pub const DEFAULT_DISTRIBUTION_BITS: u8 = 16;

/// Largest node count per node type. Node indexes stay below `u16::MAX`, which is reserved for
/// [`crate::ownership::snapshot::Owner::FAILED_TO_RESOLVE`].
pub const MAX_NODE_COUNT: usize = u16::MAX as usize;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[strum(to_string = "up", serialize = "u")]
    Up,
    #[strum(to_string = "down", serialize = "d")]
    Down,
    #[strum(to_string = "initializing", serialize = "i")]
    Initializing,
    #[strum(to_string = "retired", serialize = "r")]
    Retired,
    #[strum(to_string = "maintenance", serialize = "m")]
    Maintenance,
}

impl NodeState {
    /// Single letter code used by the textual cluster state format
    pub fn code(&self) -> char {
        match self {
            NodeState::Up => 'u',
            NodeState::Down => 'd',
            NodeState::Initializing => 'i',
            NodeState::Retired => 'r',
            NodeState::Maintenance => 'm',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Distributor,
    Storage,
}

/// An immutable view of the state of every node in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterState {
    version: u32,
    cluster_up: bool,
    distribution_bits: u8,
    distributors: Vec<NodeState>,
    storage: Vec<NodeState>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            version: 0,
            cluster_up: true,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            distributors: Vec::new(),
            storage: Vec::new(),
        }
    }
}

impl ClusterState {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the cluster as a whole is usable.
    ///
    /// This is decided by the cluster controller (eg: too many nodes are down) and never recomputed here.
    pub fn cluster_up(&self) -> bool {
        self.cluster_up
    }

    /// Minimum number of used bits a bucket needs before it can be assigned an owner
    pub fn distribution_bits(&self) -> u8 {
        self.distribution_bits
    }

    pub fn node_count(&self, node_type: NodeType) -> usize {
        self.nodes(node_type).len()
    }

    /// Returns the state of the given node. Nodes outside of the configured node count are [`NodeState::Down`].
    pub fn node_state(&self, node_type: NodeType, index: u16) -> NodeState {
        self.nodes(node_type)
            .get(index as usize)
            .copied()
            .unwrap_or(NodeState::Down)
    }

    pub fn node_state_one_of(&self, node_type: NodeType, index: u16, states: &[NodeState]) -> bool {
        states.contains(&self.node_state(node_type, index))
    }

    /// Indexes of every node of the given type whose state is in `states`
    pub fn nodes_in_states(&self, node_type: NodeType, states: &[NodeState]) -> Vec<u16> {
        self.nodes(node_type)
            .iter()
            .enumerate()
            .filter(|(_, state)| states.contains(state))
            .map(|(index, _)| index as u16)
            .collect()
    }

    fn nodes(&self, node_type: NodeType) -> &Vec<NodeState> {
        match node_type {
            NodeType::Distributor => &self.distributors,
            NodeType::Storage => &self.storage,
        }
    }

    fn nodes_mut(&mut self, node_type: NodeType) -> &mut Vec<NodeState> {
        match node_type {
            NodeType::Distributor => &mut self.distributors,
            NodeType::Storage => &mut self.storage,
        }
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidClusterState { reason }
}

fn parse_number<T: FromStr>(token: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(format!("Invalid numeric value in token '{}'", token)))
}

impl FromStr for ClusterState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut state = ClusterState::default();
        // node attributes (.I.s:X) apply to the last node type token seen
        let mut current_type: Option<NodeType> = None;

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| invalid(format!("Token '{}' is not a key:value pair", token)))?;

            if let Some(node_attribute) = key.strip_prefix('.') {
                let node_type = current_type.ok_or_else(|| {
                    invalid(format!(
                        "Node attribute '{}' found before any node type token",
                        token
                    ))
                })?;
                let (index, attribute) = node_attribute
                    .split_once('.')
                    .ok_or_else(|| invalid(format!("Malformed node attribute '{}'", token)))?;
                let index: usize = parse_number(token, index)?;

                // only the state attribute matters here. Others (eg: disk or description) are skipped
                if attribute == "s" {
                    let node_state = NodeState::from_str(value)
                        .map_err(|_| invalid(format!("Unknown node state in '{}'", token)))?;
                    let nodes = state.nodes_mut(node_type);
                    let count = nodes.len();
                    let node = nodes.get_mut(index).ok_or_else(|| {
                        invalid(format!(
                            "Node index {} out of range for {} (count {})",
                            index, node_type, count
                        ))
                    })?;
                    *node = node_state;
                }

                continue;
            }

            match key {
                "version" => state.version = parse_number(token, value)?,
                "cluster" => {
                    state.cluster_up = match value {
                        "u" => true,
                        "d" => false,
                        _ => return Err(invalid(format!("Unknown cluster state in '{}'", token))),
                    }
                }
                "bits" => {
                    let bits: u8 = parse_number(token, value)?;
                    if bits > MAX_USED_BITS {
                        return Err(invalid(format!(
                            "Distribution bits must be at most {}, got {}",
                            MAX_USED_BITS, bits
                        )));
                    }
                    state.distribution_bits = bits;
                }
                "distributor" | "storage" => {
                    let node_type = NodeType::from_str(key)
                        .map_err(|_| invalid(format!("Unknown node type in '{}'", token)))?;
                    let count: u64 = parse_number(token, value)?;
                    if count > MAX_NODE_COUNT as u64 {
                        return Err(invalid(format!(
                            "{} count must be at most {}, got {}",
                            node_type, MAX_NODE_COUNT, count
                        )));
                    }
                    *state.nodes_mut(node_type) = vec![NodeState::Up; count as usize];
                    current_type = Some(node_type);
                }
                _ => {
                    current_type = None;
                }
            }
        }

        Ok(state)
    }
}

impl Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "version:{} cluster:{} bits:{}",
            self.version,
            if self.cluster_up { 'u' } else { 'd' },
            self.distribution_bits
        )?;

        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let nodes = self.nodes(node_type);
            write!(f, " {}:{}", node_type, nodes.len())?;
            for (index, node_state) in nodes.iter().enumerate() {
                if *node_state != NodeState::Up {
                    write!(f, " .{}.s:{}", index, node_state.code())?;
                }
            }
        }

        Ok(())
    }
}

impl TryFrom<String> for ClusterState {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        ClusterState::from_str(&value)
    }
}

impl From<ClusterState> for String {
    fn from(state: ClusterState) -> Self {
        state.to_string()
    }
}

/// A baseline [`ClusterState`] plus optional per bucket space derived states.
///
/// Bucket spaces without a derived state use the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStateBundle {
    baseline: Arc<ClusterState>,
    derived: HashMap<BucketSpace, Arc<ClusterState>>,
}

impl ClusterStateBundle {
    pub fn new(baseline: ClusterState) -> Self {
        Self {
            baseline: Arc::new(baseline),
            derived: HashMap::new(),
        }
    }

    pub fn with_derived(mut self, space: BucketSpace, state: ClusterState) -> Self {
        self.derived.insert(space, Arc::new(state));
        self
    }

    pub fn baseline(&self) -> &ClusterState {
        &self.baseline
    }

    pub fn derived_state(&self, space: BucketSpace) -> &ClusterState {
        self.derived.get(&space).unwrap_or(&self.baseline)
    }

    pub fn version(&self) -> u32 {
        self.baseline.version()
    }
}

impl From<ClusterState> for ClusterStateBundle {
    fn from(baseline: ClusterState) -> Self {
        Self::new(baseline)
    }
}

impl FromStr for ClusterStateBundle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self::new(ClusterState::from_str(s)?))
    }
}
