//! A remote DHT node and its liveness accounting.
use std::net::SocketAddrV4;
use std::time::Duration;

use swarm_discovery_primitives::node_id::NodeId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;

use super::bucket::BucketId;

/// A node is considered bad if it failed to reply to this many queries.
pub const MAX_FAILED_REPLIES: u32 = 5;

/// A node is good if it sent us any traffic within this window.
pub const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Liveness of a remote node.
///
/// - *good*: we received traffic from it in the last 15 minutes.
/// - *bad*: five consecutive queries got no reply.
/// - *questionable*: everything in between.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum NodeQuality {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Clone)]
pub struct DhtNode {
    id: NodeId,
    addr: SocketAddrV4,

    last_seen: DurationSinceUnixEpoch,
    recently_active: bool,
    failed_replies: u32,

    bucket: BucketId,
}

impl DhtNode {
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddrV4) -> DhtNode {
        DhtNode {
            id,
            addr,
            last_seen: DurationSinceUnixEpoch::ZERO,
            recently_active: false,
            failed_replies: 0,
            bucket: BucketId::INVALID,
        }
    }

    /// Restores a node from the persisted cache.
    #[must_use]
    pub fn from_cache(id: NodeId, addr: SocketAddrV4, last_seen: DurationSinceUnixEpoch, now: DurationSinceUnixEpoch) -> DhtNode {
        let mut node = DhtNode::new(id, addr);
        node.last_seen = last_seen;
        node.update(now);
        node
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    #[must_use]
    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn set_bucket(&mut self, bucket: BucketId) {
        self.bucket = bucket;
    }

    #[must_use]
    pub fn last_seen(&self) -> DurationSinceUnixEpoch {
        self.last_seen
    }

    #[must_use]
    pub fn age(&self, now: DurationSinceUnixEpoch) -> Duration {
        now.saturating_sub(self.last_seen)
    }

    #[must_use]
    pub fn is_good(&self) -> bool {
        self.recently_active
    }

    #[must_use]
    pub fn is_questionable(&self) -> bool {
        !self.recently_active && !self.is_bad()
    }

    #[must_use]
    pub fn is_bad(&self) -> bool {
        self.failed_replies >= MAX_FAILED_REPLIES
    }

    /// The node has sent or answered anything at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.last_seen != DurationSinceUnixEpoch::ZERO
    }

    #[must_use]
    pub fn quality(&self) -> NodeQuality {
        if self.is_bad() {
            NodeQuality::Bad
        } else if self.is_good() {
            NodeQuality::Good
        } else {
            NodeQuality::Questionable
        }
    }

    /// Recomputes goodness from the node's age; run by the 15 minute
    /// housekeeping.
    pub fn update(&mut self, now: DurationSinceUnixEpoch) {
        self.recently_active = self.age(now) < GOOD_WINDOW;
    }

    /// The node answered one of our queries.
    pub fn replied(&mut self, now: DurationSinceUnixEpoch) {
        self.set_good(now);
    }

    /// The node queried us; only counts as life sign when it was active
    /// before, so a node cannot bootstrap its own goodness by spamming us.
    pub fn queried(&mut self, now: DurationSinceUnixEpoch) {
        if self.is_active() {
            self.set_good(now);
        }
    }

    /// One of our queries to the node got no reply.
    pub fn inactive(&mut self) {
        if self.failed_replies + 1 == MAX_FAILED_REPLIES {
            self.failed_replies = MAX_FAILED_REPLIES;
            self.recently_active = false;
        } else if !self.is_bad() {
            self.failed_replies += 1;
        }
    }

    fn set_good(&mut self, now: DurationSinceUnixEpoch) {
        self.last_seen = now;
        self.failed_replies = 0;
        self.recently_active = true;
    }
}
