//! A Kademlia bucket: a binary partition of the 160-bit id space.
use std::time::Duration;

use rand::Rng;
use swarm_discovery_primitives::node_id::{NodeId, NODE_ID_BYTES_LEN};
use swarm_discovery_primitives::DurationSinceUnixEpoch;

/// Maximum number of nodes per bucket.
pub const BUCKET_NODES: usize = 8;

/// Index of a bucket in the routing table's arena. Buckets are never
/// deleted, so an id stays valid for the table's lifetime.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct BucketId(pub usize);

impl BucketId {
    pub const INVALID: BucketId = BucketId(usize::MAX);
}

/// A container holding a small number of nodes that fall in a given binary
/// partition of the id space, i.e. the range `low..=high` where
/// `high - low + 1` is a power of two.
///
/// `parent` is the adjacent bucket with double the id width, `child` the
/// adjacent bucket with half the width; the chain always ends at the bucket
/// holding our own id.
#[derive(Debug)]
pub struct Bucket {
    low: NodeId,
    high: NodeId,

    members: Vec<NodeId>,

    good: u32,
    bad: u32,

    last_changed: DurationSinceUnixEpoch,

    parent: Option<BucketId>,
    child: Option<BucketId>,
}

impl Bucket {
    #[must_use]
    pub fn new(low: NodeId, high: NodeId, now: DurationSinceUnixEpoch) -> Bucket {
        Bucket {
            low,
            high,
            members: Vec::with_capacity(BUCKET_NODES),
            good: 0,
            bad: 0,
            last_changed: now,
            parent: None,
            child: None,
        }
    }

    #[must_use]
    pub fn low(&self) -> NodeId {
        self.low
    }

    #[must_use]
    pub fn high(&self) -> NodeId {
        self.high
    }

    #[must_use]
    pub fn is_in_range(&self, id: &NodeId) -> bool {
        self.low <= *id && *id <= self.high
    }

    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.members.len() >= BUCKET_NODES
    }

    /// There is room for a fresh node, possibly by evicting a bad one.
    #[must_use]
    pub fn has_space(&self) -> bool {
        !self.is_full() || self.bad > 0
    }

    #[must_use]
    pub fn num_good(&self) -> u32 {
        self.good
    }

    #[must_use]
    pub fn num_bad(&self) -> u32 {
        self.bad
    }

    #[must_use]
    pub fn parent(&self) -> Option<BucketId> {
        self.parent
    }

    #[must_use]
    pub fn child(&self) -> Option<BucketId> {
        self.child
    }

    pub fn set_parent(&mut self, parent: Option<BucketId>) {
        self.parent = parent;
    }

    pub fn set_child(&mut self, child: Option<BucketId>) {
        self.child = child;
    }

    #[must_use]
    pub fn age(&self, now: DurationSinceUnixEpoch) -> Duration {
        now.saturating_sub(self.last_changed)
    }

    #[must_use]
    pub fn last_changed(&self) -> DurationSinceUnixEpoch {
        self.last_changed
    }

    pub fn touch(&mut self, now: DurationSinceUnixEpoch) {
        self.last_changed = now;
    }

    pub fn set_time(&mut self, time: DurationSinceUnixEpoch) {
        self.last_changed = time;
    }

    pub(super) fn push_member(&mut self, id: NodeId) {
        self.members.push(id);
    }

    pub(super) fn remove_member(&mut self, id: &NodeId) {
        let position = self
            .members
            .iter()
            .position(|member| member == id)
            .expect("node must be a member of its bucket");
        self.members.swap_remove(position);
    }

    pub(super) fn set_counters(&mut self, good: u32, bad: u32) {
        self.good = good;
        self.bad = bad;
    }

    pub(super) fn adjust_counters(&mut self, good_delta: i32, bad_delta: i32) {
        self.good = self.good.checked_add_signed(good_delta).expect("good count must not underflow");
        self.bad = self.bad.checked_add_signed(bad_delta).expect("bad count must not underflow");
    }

    /// The middle of the range: for a power-of-two width the two halves
    /// `low..=mid` and `mid+1..=high` are equally wide.
    #[must_use]
    pub fn mid_point(&self) -> NodeId {
        let mut middle = self.high;

        for i in 0..NODE_ID_BYTES_LEN {
            if self.low.0[i] != self.high.0[i] {
                middle.0[i] = ((u16::from(self.low.0[i]) + u16::from(self.high.0[i])) / 2) as u8;
                break;
            }
        }

        middle
    }

    /// A uniformly random id inside the bucket's range. Since
    /// `high - low = 2^n - 1`, masking random bytes with the range width
    /// stays in range.
    #[must_use]
    pub fn random_id(&self, rng: &mut impl Rng) -> NodeId {
        let mut id = NodeId::ZERO;

        for i in 0..NODE_ID_BYTES_LEN {
            let spread = self.high.0[i] - self.low.0[i];
            id.0[i] = self.low.0[i] + (rng.gen::<u8>() & spread);
        }

        id
    }

    /// `mid_point() + 1`: the lower end of the upper half after a split.
    #[must_use]
    pub fn mid_point_plus_one(&self) -> NodeId {
        let mut id = self.mid_point();

        for i in (0..NODE_ID_BYTES_LEN).rev() {
            let (byte, carry) = id.0[i].overflowing_add(1);
            id.0[i] = byte;
            if !carry {
                break;
            }
        }

        id
    }

    pub(super) fn set_low(&mut self, low: NodeId) {
        self.low = low;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use swarm_discovery_primitives::node_id::NodeId;

    use super::Bucket;

    fn full_range() -> Bucket {
        Bucket::new(NodeId::ZERO, NodeId::MAX, Duration::ZERO)
    }

    fn id_with_first_byte(first: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        NodeId(bytes)
    }

    #[test]
    fn it_should_split_the_full_range_at_the_half_way_point() {
        let bucket = full_range();

        let mid = bucket.mid_point();

        assert_eq!(mid.0[0], 0x7F);
        assert_eq!(&mid.0[1..], &[0xFF; 19]);

        // The two halves are equally wide.
        assert_eq!(bucket.mid_point_plus_one().0[0], 0x80);
        assert_eq!(&bucket.mid_point_plus_one().0[1..], &[0x00; 19]);
    }

    #[test]
    fn it_should_split_a_width_two_bucket_into_single_addresses() {
        let low = id_with_first_byte(4);
        let mut high = low;
        high.0[19] = 1;

        let bucket = Bucket::new(low, high, Duration::ZERO);

        assert_eq!(bucket.mid_point(), low);
        assert_eq!(bucket.mid_point_plus_one(), high);
    }

    #[test]
    fn it_should_carry_when_incrementing_the_mid_point() {
        // A range whose midpoint ends in 0xFF bytes forces a carry chain.
        let low = NodeId::ZERO;
        let high = id_with_first_byte(0x01); // [0x01, 0, 0, ...]
        let mut high = high;
        for byte in &mut high.0[1..] {
            *byte = 0xFF;
        }

        let bucket = Bucket::new(low, high, Duration::ZERO);

        let mid = bucket.mid_point();
        assert_eq!(mid.0[0], 0x00);
        assert_eq!(&mid.0[1..], &[0xFF; 19]);

        let upper_low = bucket.mid_point_plus_one();
        assert_eq!(upper_low.0[0], 0x01);
        assert_eq!(&upper_low.0[1..], &[0x00; 19]);
    }

    #[test]
    fn it_should_generate_random_ids_inside_the_range() {
        let low = id_with_first_byte(0x40);
        let mut high = id_with_first_byte(0x7F);
        for byte in &mut high.0[1..] {
            *byte = 0xFF;
        }

        let bucket = Bucket::new(low, high, Duration::ZERO);
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let id = bucket.random_id(&mut rng);
            assert!(bucket.is_in_range(&id), "{id} out of range");
        }
    }
}
