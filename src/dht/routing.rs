//! The Kademlia routing table: buckets in a stable arena, ordered by their
//! upper range bound for O(log n) lookup of the bucket covering an id.
//!
//! The table starts with one bucket covering the whole id space. Only the
//! bucket containing our own id is ever split, so the table stays focused
//! on the neighborhood we are responsible for. Buckets are never deleted;
//! the arena index of a bucket stays valid for the table's lifetime.
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddrV4;
use std::time::Duration;

use swarm_discovery_primitives::compact::NodeInfo;
use swarm_discovery_primitives::node_id::NodeId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;
use tracing::debug;

use super::bucket::{Bucket, BucketId, BUCKET_NODES};
use super::node::DhtNode;

/// Buckets idle for longer than this get a refresh search.
pub const BUCKET_BOOTSTRAP_AGE: Duration = Duration::from_secs(15 * 60);

/// Unresponsive nodes are removed after this long without a life sign.
pub const NODE_REMOVE_AGE: Duration = Duration::from_secs(4 * 60 * 60);

/// What the table wants done about a node that queried us.
#[derive(PartialEq, Eq, Debug)]
pub enum QueriedNode {
    /// Known node, liveness updated.
    Known,
    /// Unknown node we would like in the table; ping it to verify it.
    WantedPing,
    /// Not interesting or mismatching address.
    Ignored,
}

/// Maintenance work for the caller to perform after housekeeping.
#[derive(Default, Debug)]
pub struct Housekeeping {
    /// Questionable nodes to ping before giving up on them.
    pub pings: Vec<(NodeId, SocketAddrV4)>,
    /// Buckets that are not full or have been idle; refresh each with a
    /// search.
    pub bootstrap_buckets: Vec<BucketId>,
}

pub struct RoutingTable {
    own_id: NodeId,

    buckets: Vec<Bucket>,
    by_upper: BTreeMap<NodeId, BucketId>,
    nodes: HashMap<NodeId, DhtNode>,

    own_bucket: BucketId,

    /// Buckets left empty by a split, to be refreshed by the caller.
    pending_bootstrap: Vec<BucketId>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(own_id: NodeId, now: DurationSinceUnixEpoch) -> RoutingTable {
        let root = Bucket::new(NodeId::ZERO, NodeId::MAX, now);

        let mut by_upper = BTreeMap::new();
        by_upper.insert(NodeId::MAX, BucketId(0));

        RoutingTable {
            own_id,
            buckets: vec![root],
            by_upper,
            nodes: HashMap::new(),
            own_bucket: BucketId(0),
            pending_bootstrap: Vec::new(),
        }
    }

    #[must_use]
    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    #[must_use]
    pub fn own_bucket(&self) -> BucketId {
        self.own_bucket
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn bucket(&self, id: BucketId) -> &Bucket {
        &self.buckets[id.0]
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&DhtNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DhtNode> {
        self.nodes.values()
    }

    /// The bucket whose range contains `id`. The buckets partition the
    /// whole id space, so this cannot miss.
    #[must_use]
    pub fn find_bucket(&self, id: &NodeId) -> BucketId {
        let (_, bucket) = self
            .by_upper
            .range(*id..)
            .next()
            .expect("buckets must cover the entire id space");

        assert!(self.buckets[bucket.0].is_in_range(id), "bucket range lookup is inconsistent");

        *bucket
    }

    /// Whether a new node with this id is worth adding: we always want
    /// nodes for our own bucket (forcing a split when full), elsewhere only
    /// when there is space. Our own id and the reserved zero id are never
    /// wanted.
    #[must_use]
    pub fn want_node(&self, id: &NodeId) -> bool {
        if *id == self.own_id || id.is_zero() {
            return false;
        }

        let bucket = self.find_bucket(id);
        bucket == self.own_bucket || self.buckets[bucket.0].has_space()
    }

    /// Inserts a brand-new node, splitting our own bucket or evicting a bad
    /// node when needed. Returns false when the node was not inserted.
    pub fn add_node(&mut self, id: NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) -> bool {
        if !self.want_node(&id) || self.nodes.contains_key(&id) {
            return false;
        }

        let mut bucket = self.find_bucket(&id);

        while self.buckets[bucket.0].is_full() {
            if let Some(bad) = self.find_replacement_candidate(bucket) {
                self.delete_node(&bad);
                continue;
            }

            // Bucket is full of good nodes; if our own id falls in range
            // then split the bucket, else discard the new node.
            if bucket != self.own_bucket {
                return false;
            }

            self.split_bucket(bucket, now);
            bucket = self.find_bucket(&id);
        }

        let mut node = DhtNode::new(id, addr);
        node.set_bucket(bucket);

        self.buckets[bucket.0].push_member(id);
        self.buckets[bucket.0].touch(now);
        self.nodes.insert(id, node);

        debug!(node = %id, bucket = bucket.0, "node added to routing table");

        true
    }

    /// Restores a cached node, which may carry an old `last_seen`.
    pub fn add_cached_node(&mut self, id: NodeId, addr: SocketAddrV4, last_seen: DurationSinceUnixEpoch, now: DurationSinceUnixEpoch) -> bool {
        if !self.add_node(id, addr, now) {
            return false;
        }

        let bucket = self.nodes[&id].bucket();
        let mut restored = DhtNode::from_cache(id, addr, last_seen, now);
        restored.set_bucket(bucket);

        let good_delta = i32::from(restored.is_good());
        self.nodes.insert(id, restored);
        self.buckets[bucket.0].adjust_counters(good_delta, 0);

        true
    }

    /// A bad member of the bucket, oldest first, or `None` when all
    /// members are in order.
    fn find_replacement_candidate(&self, bucket: BucketId) -> Option<NodeId> {
        self.buckets[bucket.0]
            .members()
            .iter()
            .filter(|id| self.nodes[*id].is_bad())
            .min_by_key(|id| self.nodes[*id].last_seen())
            .copied()
    }

    pub fn delete_node(&mut self, id: &NodeId) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };

        let bucket = node.bucket();
        self.buckets[bucket.0].remove_member(id);
        self.buckets[bucket.0].adjust_counters(-i32::from(node.is_good()), -i32::from(node.is_bad()));

        debug!(node = %id, "node removed from routing table");
    }

    /// Splits the bucket in two. The existing bucket keeps the upper half,
    /// preserving its key in the ordered map; the new bucket takes the
    /// lower half. The parent/child chain is rewired so that the bucket
    /// containing our own id stays at the child end.
    fn split_bucket(&mut self, bucket: BucketId, now: DurationSinceUnixEpoch) {
        let mid = self.buckets[bucket.0].mid_point();
        let upper_low = self.buckets[bucket.0].mid_point_plus_one();
        let low = self.buckets[bucket.0].low();

        let new_id = BucketId(self.buckets.len());
        let mut new_bucket = Bucket::new(low, mid, now);
        new_bucket.set_time(self.buckets[bucket.0].last_changed());

        self.buckets[bucket.0].set_low(upper_low);
        self.buckets.push(new_bucket);
        self.by_upper.insert(mid, new_id);

        // Partition the members: those below the midpoint move over.
        let moving: Vec<NodeId> = self.buckets[bucket.0]
            .members()
            .iter()
            .filter(|id| **id <= mid)
            .copied()
            .collect();

        for id in &moving {
            self.buckets[bucket.0].remove_member(id);
            self.buckets[new_id.0].push_member(*id);
            self.nodes.get_mut(id).expect("member must exist").set_bucket(new_id);
        }

        self.recount(bucket);
        self.recount(new_id);

        // Rewire the chain so our own bucket stays the child end.
        if self.buckets[new_id.0].is_in_range(&self.own_id) {
            let old_child = self.buckets[bucket.0].child();
            self.buckets[bucket.0].set_child(Some(new_id));
            self.buckets[new_id.0].set_parent(Some(bucket));
            debug_assert!(old_child.is_none(), "split must happen at the child end of the chain");
        } else {
            if let Some(parent) = self.buckets[bucket.0].parent() {
                self.buckets[parent.0].set_child(Some(new_id));
                self.buckets[new_id.0].set_parent(Some(parent));
            }
            self.buckets[bucket.0].set_parent(Some(new_id));
            self.buckets[new_id.0].set_child(Some(bucket));
        }

        // Track which half our own id lives in now.
        if bucket == self.own_bucket && self.buckets[new_id.0].is_in_range(&self.own_id) {
            self.own_bucket = new_id;
        }

        assert!(
            self.buckets[self.own_bucket.0].is_in_range(&self.own_id),
            "own id ended up in the wrong bucket"
        );

        // The half that received no members needs fresh nodes.
        for half in [bucket, new_id] {
            if self.buckets[half.0].is_empty() {
                self.pending_bootstrap.push(half);
            }
        }

        debug!(buckets = self.buckets.len(), "bucket split");
    }

    fn recount(&mut self, bucket: BucketId) {
        let mut good = 0;
        let mut bad = 0;

        for id in self.buckets[bucket.0].members() {
            good += u32::from(self.nodes[id].is_good());
            bad += u32::from(self.nodes[id].is_bad());
        }

        self.buckets[bucket.0].set_counters(good, bad);
    }

    /// Buckets emptied by recent splits, for the caller to refresh.
    pub fn take_pending_bootstrap(&mut self) -> Vec<BucketId> {
        std::mem::take(&mut self.pending_bootstrap)
    }

    /// A known node queried us. Unknown nodes we could use are reported
    /// back so the caller can ping them; a known id arriving from a
    /// different address is ignored so rogue nodes cannot hijack table
    /// entries.
    pub fn node_queried(&mut self, id: &NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) -> QueriedNode {
        let Some(node) = self.nodes.get(id) else {
            if self.want_node(id) {
                return QueriedNode::WantedPing;
            }
            return QueriedNode::Ignored;
        };

        if node.addr().ip() != addr.ip() {
            return QueriedNode::Ignored;
        }

        self.update_node_quality(id, now, |node, now| node.queried(now));

        if self.nodes[id].is_good() {
            let bucket = self.nodes[id].bucket();
            self.buckets[bucket.0].touch(now);
        }

        QueriedNode::Known
    }

    /// A node replied to one of our queries; creates the node when it is
    /// new and wanted. Returns false when the reply was ignored.
    pub fn node_replied(&mut self, id: &NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) -> bool {
        if !self.nodes.contains_key(id) {
            if !self.want_node(id) {
                return false;
            }

            // A node that replied is a good node; insert it right away.
            if !self.add_node(*id, addr, now) {
                return false;
            }
        }

        if self.nodes[id].addr().ip() != addr.ip() {
            return false;
        }

        self.update_node_quality(id, now, |node, now| node.replied(now));

        let bucket = self.nodes[id].bucket();
        self.buckets[bucket.0].touch(now);

        true
    }

    /// One of our queries to the node went unanswered (or it sent garbage).
    /// Bad nodes past the removal age are dropped, but only on this path so
    /// a dead network does not empty the table.
    pub fn node_inactive(&mut self, id: &NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };

        // node_inactive is also reached for malformed replies; check the
        // source address so rogue packets cannot defame other nodes.
        if node.addr().ip() != addr.ip() {
            return;
        }

        self.update_node_quality(id, now, |node, _| node.inactive());

        if self.nodes[id].is_bad() && self.nodes[id].age(now) >= NODE_REMOVE_AGE {
            self.delete_node(id);
        }
    }

    /// We queried this id but a different id answered from its address:
    /// the stored address is stale.
    pub fn node_invalid(&mut self, id: &NodeId) {
        if *id == self.own_id {
            return;
        }

        self.delete_node(id);
    }

    fn update_node_quality(
        &mut self,
        id: &NodeId,
        now: DurationSinceUnixEpoch,
        transition: impl FnOnce(&mut DhtNode, DurationSinceUnixEpoch),
    ) {
        let node = self.nodes.get_mut(id).expect("caller checked node existence");
        let (was_good, was_bad) = (node.is_good(), node.is_bad());

        transition(node, now);

        let (is_good, is_bad) = (node.is_good(), node.is_bad());
        let bucket = node.bucket();

        self.buckets[bucket.0].adjust_counters(
            i32::from(is_good) - i32::from(was_good),
            i32::from(is_bad) - i32::from(was_bad),
        );
    }

    /// Up to `max` non-bad nodes from the bucket containing `target`, then
    /// its children, then its parents. The chain order approximates
    /// closest-first well enough for `find_node`/`get_peers` replies.
    #[must_use]
    pub fn closest_nodes(&self, target: &NodeId, max: usize) -> Vec<NodeInfo> {
        let mut found = Vec::with_capacity(max);

        let mut chain = BucketChain::new(self, self.find_bucket(target));

        loop {
            for id in self.buckets[chain.current().0].members() {
                if found.len() >= max {
                    return found;
                }

                let node = &self.nodes[id];
                if !node.is_bad() {
                    found.push(NodeInfo {
                        id: *id,
                        addr: node.addr(),
                    });
                }
            }

            if chain.next().is_none() {
                return found;
            }
        }
    }

    /// 15 minute table maintenance: refresh node quality, collect
    /// questionable nodes to ping and buckets to refresh.
    pub fn housekeeping(&mut self, now: DurationSinceUnixEpoch) -> Housekeeping {
        let mut work = Housekeeping::default();

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();

        for id in ids {
            self.update_node_quality(&id, now, |node, now| node.update(now));

            let node = &self.nodes[&id];

            // Contact nodes we have not heard from in a while. Repeatedly
            // unresponsive nodes only get a last chance right before they
            // would be removed.
            if !node.is_good() && (!node.is_bad() || node.age(now) >= NODE_REMOVE_AGE) {
                work.pings.push((id, node.addr()));
            }
        }

        for index in 0..self.buckets.len() {
            let bucket = BucketId(index);
            self.recount(bucket);

            if !self.buckets[index].is_full() || self.buckets[index].age(now) > BUCKET_BOOTSTRAP_AGE {
                work.bootstrap_buckets.push(bucket);
            }
        }

        work
    }
}

/// Follows a chain of buckets: first the start bucket, then its children
/// (closer to our own bucket by definition), then its parents.
pub struct BucketChain<'a> {
    table: &'a RoutingTable,
    restart: Option<BucketId>,
    current: BucketId,
}

impl<'a> BucketChain<'a> {
    #[must_use]
    pub fn new(table: &'a RoutingTable, start: BucketId) -> BucketChain<'a> {
        BucketChain {
            table,
            restart: Some(start),
            current: start,
        }
    }

    #[must_use]
    pub fn current(&self) -> BucketId {
        self.current
    }

    /// `restart` is cleared once we are done recursing into the children
    /// and follow the parents instead.
    pub fn next(&mut self) -> Option<BucketId> {
        let next = match self.restart {
            None => self.table.bucket(self.current).parent(),
            Some(restart) => match self.table.bucket(self.current).child() {
                Some(child) => Some(child),
                None => {
                    self.restart = None;
                    self.table.bucket(restart).parent()
                }
            },
        };

        if let Some(next) = next {
            self.current = next;
        }

        next
    }
}
