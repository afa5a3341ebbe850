//! # Routing Table
//!
//! Ordered peer membership over the XOR metric. The table keeps its entries
//! sorted by distance to the owner, protects the `GROUP_SIZE` closest peers
//! from eviction, and bounds every other bucket index at `BUCKET_SIZE`
//! entries. The result is a membership biased toward the owner's address:
//! dense nearby for group authority, exponentially sparser further out for
//! O(log N) greedy hops.
//!
//! | Operation | Result |
//! |-----------|--------|
//! | `add_node` | `(added, Option<evicted>)`; never grows past `ROUTING_TABLE_SIZE` |
//! | `check_node` | pure acceptance probe, mirrors `add_node` exactly |
//! | `target_nodes` | swarm (whole close group) or greedy (single closest) |
//! | `our_close_group` | up to `GROUP_SIZE` closest peers, ascending |
//!
//! The table itself is a plain data structure; the owning node actor
//! serialises all access by processing one command at a time.

use std::collections::HashMap;

use crate::identity::{closer_to_target, distance_cmp, Address, NodeInfo};

/// Number of peers in a close group.
pub const GROUP_SIZE: usize = 8;

/// Maximum number of peers held in a routing table.
pub const ROUTING_TABLE_SIZE: usize = 64;

/// Maximum occupancy per bucket index outside the close-group region.
pub const BUCKET_SIZE: usize = 1;

/// Table size at which a joining node counts as part of the network.
pub const QUORUM_SIZE: usize = GROUP_SIZE;

/// Delta between two successive close-group snapshots, emitted to the
/// application on churn.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseGroupDifference {
    pub added: Vec<Address>,
    pub removed: Vec<Address>,
}

impl CloseGroupDifference {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Routing table owned by exactly one node. Entries are unique by address,
/// never include the owner, and stay sorted ascending by XOR distance to
/// the owner.
#[derive(Debug)]
pub struct RoutingTable {
    our_id: Address,
    nodes: Vec<NodeInfo>,
}

impl RoutingTable {
    pub fn new(our_id: Address) -> Self {
        Self {
            our_id,
            nodes: Vec::new(),
        }
    }

    pub fn our_id(&self) -> &Address {
        &self.our_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.nodes.iter().any(|node| &node.id == id)
    }

    /// Current fill level as a percentage of `ROUTING_TABLE_SIZE`.
    pub fn network_status(&self) -> u32 {
        (self.nodes.len() * 100 / ROUTING_TABLE_SIZE) as u32
    }

    /// Insert a peer. Returns whether the peer was added and, when the add
    /// displaced somebody, the evicted entry.
    ///
    /// The table never exceeds `ROUTING_TABLE_SIZE`. On overflow the
    /// eviction candidate is the furthest entry outside the close group
    /// whose bucket index holds more than `BUCKET_SIZE` non-close peers;
    /// when that candidate is the entry being added (or nothing is
    /// evictable), the add is rejected instead.
    pub fn add_node(&mut self, info: NodeInfo) -> (bool, Option<NodeInfo>) {
        if info.id == self.our_id || self.contains(&info.id) {
            return (false, None);
        }

        let new_id = info.id;
        let pos = self.sorted_position(&new_id);
        self.nodes.insert(pos, info);

        if self.nodes.len() <= ROUTING_TABLE_SIZE {
            return (true, None);
        }

        let ids: Vec<Address> = self.nodes.iter().map(|node| node.id).collect();
        match candidate_for_removal(&self.our_id, &ids) {
            Some(idx) if self.nodes[idx].id != new_id => {
                let evicted = self.nodes.remove(idx);
                (true, Some(evicted))
            }
            _ => {
                self.nodes.retain(|node| node.id != new_id);
                (false, None)
            }
        }
    }

    /// Would `add_node` accept a peer with this address? Pure, no mutation.
    pub fn check_node(&self, id: &Address) -> bool {
        if *id == self.our_id || self.contains(id) {
            return false;
        }
        if self.nodes.len() < ROUTING_TABLE_SIZE {
            return true;
        }

        let mut ids: Vec<Address> = self.nodes.iter().map(|node| node.id).collect();
        let pos = match ids.binary_search_by(|existing| {
            distance_cmp(
                &existing.xor_distance(&self.our_id),
                &id.xor_distance(&self.our_id),
            )
        }) {
            Ok(pos) | Err(pos) => pos,
        };
        ids.insert(pos, *id);

        match candidate_for_removal(&self.our_id, &ids) {
            Some(idx) => ids[idx] != *id,
            None => false,
        }
    }

    /// Remove a peer if present; idempotent.
    pub fn drop_node(&mut self, id: &Address) -> Option<NodeInfo> {
        let pos = self.nodes.iter().position(|node| &node.id == id)?;
        Some(self.nodes.remove(pos))
    }

    /// The up-to-`GROUP_SIZE` closest peers, ascending by distance.
    pub fn our_close_group(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .take(GROUP_SIZE)
            .cloned()
            .collect()
    }

    /// Addresses of the current close group, for churn snapshots.
    pub fn close_group_ids(&self) -> Vec<Address> {
        self.nodes
            .iter()
            .take(GROUP_SIZE)
            .map(|node| node.id)
            .collect()
    }

    /// Routing targets for a message addressed to `target`.
    ///
    /// Inside the close group's radius every member forwards so the target
    /// hears from `GROUP_SIZE` sources (swarm mode); beyond the radius a
    /// single greedy hop toward the closest known peer suffices.
    pub fn target_nodes(&self, target: &Address) -> Vec<NodeInfo> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        if self.nodes.len() < GROUP_SIZE {
            return self.nodes.clone();
        }

        let radius = self.nodes[GROUP_SIZE - 1].id.xor_distance(&self.our_id);
        let target_distance = target.xor_distance(&self.our_id);
        if distance_cmp(&target_distance, &radius) != std::cmp::Ordering::Greater {
            return self.our_close_group();
        }

        self.nodes
            .iter()
            .min_by(|a, b| {
                distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target))
            })
            .cloned()
            .into_iter()
            .collect()
    }

    /// True iff fewer than `GROUP_SIZE` known peers are strictly closer to
    /// `id` than this node is, i.e. we are one of `id`'s close group.
    pub fn address_in_close_group_range(&self, id: &Address) -> bool {
        let closer = self
            .nodes
            .iter()
            .filter(|node| closer_to_target(&node.id, &self.our_id, id))
            .count();
        closer < GROUP_SIZE
    }

    fn sorted_position(&self, id: &Address) -> usize {
        match self.nodes.binary_search_by(|existing| {
            distance_cmp(
                &existing.id.xor_distance(&self.our_id),
                &id.xor_distance(&self.our_id),
            )
        }) {
            Ok(pos) | Err(pos) => pos,
        }
    }
}

/// Compute the close-group delta between two snapshots.
pub fn close_group_difference(
    before: &[Address],
    after: &[Address],
) -> CloseGroupDifference {
    CloseGroupDifference {
        added: after
            .iter()
            .filter(|id| !before.contains(id))
            .copied()
            .collect(),
        removed: before
            .iter()
            .filter(|id| !after.contains(id))
            .copied()
            .collect(),
    }
}

/// Scan a distance-sorted id sequence from the furthest entry inward and
/// return the first index outside the protected close group whose bucket
/// holds more than `BUCKET_SIZE` entries. The occupancy bound applies
/// beyond the close group only: a close-group member sharing a bucket
/// with one outside peer does not make that bucket over-occupied.
fn candidate_for_removal(our_id: &Address, sorted_ids: &[Address]) -> Option<usize> {
    let mut bucket_counts: HashMap<usize, usize> = HashMap::new();
    for id in sorted_ids.iter().skip(GROUP_SIZE) {
        *bucket_counts.entry(our_id.bucket_index(id)).or_insert(0) += 1;
    }

    for idx in (GROUP_SIZE..sorted_ids.len()).rev() {
        let bucket = our_id.bucket_index(&sorted_ids[idx]);
        if bucket_counts[&bucket] > BUCKET_SIZE {
            return Some(idx);
        }
    }
    None
}
