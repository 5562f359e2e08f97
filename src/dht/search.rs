//! Iterative lookup state for a single target id.
//!
//! A search keeps a candidate set sorted by XOR distance to the target and
//! hands out contacts up to a concurrency limit. Replies add closer
//! candidates; when no contactable candidate remains the search is
//! complete. An announce is a search that, once the lookup settles,
//! switches to a second phase: `get_peers` to the closest good nodes,
//! followed by `announce_peer` to each that handed out a token.
use std::collections::BTreeMap;
use std::net::SocketAddrV4;

use swarm_discovery_primitives::node_id::{NodeId, NODE_ID_BYTES_LEN};

use super::node::NodeQuality;

/// Number of closest potential contact nodes to keep.
pub const MAX_CONTACTS: usize = 18;

/// Number of closest good nodes an announce eventually talks to.
pub const MAX_ANNOUNCE_NODES: usize = super::bucket::BUCKET_NODES;

/// Baseline number of in-flight queries per search.
pub const BASE_CONCURRENCY: u32 = 3;

/// Identifies a live search within the server.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct SearchId(pub u64);

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum CandidateState {
    /// Not contacted yet.
    Unknown,
    /// A query is in flight.
    Active,
    /// Contacted and replied.
    Good,
    /// Contacted and never replied.
    Bad,
}

#[derive(Debug)]
struct Candidate {
    id: NodeId,
    addr: SocketAddrV4,
    state: CandidateState,
}

/// What a search is for.
#[derive(Debug)]
pub enum SearchKind {
    /// Table refresh: `find_node` for the target, nothing more.
    Refresh,
    /// Peer lookup ending in `announce_peer`.
    Announce {
        /// Peers collected from `get_peers` replies.
        peers: Vec<SocketAddrV4>,
        /// Second phase reached: the remaining candidates are being sent
        /// `get_peers` + `announce_peer`.
        announcing: bool,
    },
}

#[derive(Debug)]
pub struct DhtSearch {
    target: NodeId,
    kind: SearchKind,

    /// Candidates keyed by distance to the target, closest first.
    candidates: BTreeMap<[u8; NODE_ID_BYTES_LEN], Candidate>,

    pending: u32,
    contacted: u32,
    replied: u32,
    concurrency: u32,

    /// Contacts arrived since the last trim; re-trim before handing out
    /// the next contact.
    restart: bool,
    started: bool,
}

impl DhtSearch {
    #[must_use]
    pub fn new(target: NodeId, kind: SearchKind) -> DhtSearch {
        DhtSearch {
            target,
            kind,
            candidates: BTreeMap::new(),
            pending: 0,
            contacted: 0,
            replied: 0,
            concurrency: BASE_CONCURRENCY,
            restart: false,
            started: false,
        }
    }

    #[must_use]
    pub fn target(&self) -> NodeId {
        self.target
    }

    #[must_use]
    pub fn is_announce(&self) -> bool {
        matches!(self.kind, SearchKind::Announce { .. })
    }

    #[must_use]
    pub fn is_announcing(&self) -> bool {
        matches!(self.kind, SearchKind::Announce { announcing: true, .. })
    }

    #[must_use]
    pub fn num_contacted(&self) -> u32 {
        self.contacted
    }

    #[must_use]
    pub fn num_replied(&self) -> u32 {
        self.replied
    }

    #[must_use]
    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Peers gathered for an announce so far.
    #[must_use]
    pub fn peers(&self) -> &[SocketAddrV4] {
        match &self.kind {
            SearchKind::Announce { peers, .. } => peers,
            SearchKind::Refresh => &[],
        }
    }

    pub fn add_peers(&mut self, found: &[SocketAddrV4]) {
        if let SearchKind::Announce { peers, .. } = &mut self.kind {
            peers.extend_from_slice(found);
        }
    }

    fn distance(&self, id: &NodeId) -> [u8; NODE_ID_BYTES_LEN] {
        id.xor(&self.target).0
    }

    /// Adds a potential node to contact. Duplicates are ignored.
    pub fn add_contact(&mut self, id: NodeId, addr: SocketAddrV4) -> bool {
        let key = self.distance(&id);

        if self.candidates.contains_key(&key) {
            return false;
        }

        self.candidates.insert(
            key,
            Candidate {
                id,
                addr,
                state: CandidateState::Unknown,
            },
        );
        self.restart = true;

        true
    }

    /// Seeds the candidate set from a walk of the routing table: the
    /// closest nodes first, taking bad ones too while the closest slots
    /// are unfilled, and continuing until enough good nodes are on board.
    pub fn seed(&mut self, chain: impl Iterator<Item = (NodeId, SocketAddrV4, NodeQuality)>) {
        let mut need_closest = MAX_CONTACTS.saturating_sub(self.candidates.len()) as i64;
        let mut need_good = MAX_ANNOUNCE_NODES as i64;

        for (id, addr, quality) in chain {
            if need_closest <= 0 && need_good <= 0 {
                return;
            }

            let is_bad = quality == NodeQuality::Bad;

            if (!is_bad || need_closest > 0) && self.add_contact(id, addr) {
                need_good -= i64::from(!is_bad);
                need_closest -= 1;
            }
        }
    }

    /// The next node to contact, up to the concurrency limit.
    pub fn get_contact(&mut self) -> Option<(NodeId, SocketAddrV4)> {
        if self.pending >= self.concurrency {
            return None;
        }

        if self.restart {
            self.trim(false);
        }

        let candidate = self
            .candidates
            .values_mut()
            .find(|candidate| candidate.state == CandidateState::Unknown)?;

        candidate.state = CandidateState::Active;
        self.pending += 1;
        self.contacted += 1;

        Some((candidate.id, candidate.addr))
    }

    /// Books the outcome of a contact's transaction.
    ///
    /// # Panics
    ///
    /// Will panic when the node is not an active candidate of this search;
    /// that would mean the transaction table and the search disagree.
    pub fn node_status(&mut self, id: &NodeId, success: bool) {
        let key = self.distance(id);
        let candidate = self
            .candidates
            .get_mut(&key)
            .expect("node status reported for a node that is not a candidate");

        assert_eq!(candidate.state, CandidateState::Active, "node status reported for an inactive candidate");

        candidate.state = if success {
            self.replied += 1;
            CandidateState::Good
        } else {
            CandidateState::Bad
        };

        self.pending -= 1;
    }

    /// Marks the search started; a search that could not issue a single
    /// query is dead on arrival and the caller drops it.
    pub fn start(&mut self) -> bool {
        self.started = true;
        self.pending > 0
    }

    /// All issued queries have resolved and no contactable candidate is
    /// left.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.started && self.pending == 0
    }

    /// A stalled transaction no longer counts against the concurrency
    /// limit.
    pub fn increase_concurrency(&mut self) {
        self.concurrency += 1;
    }

    pub fn decrease_concurrency(&mut self) {
        self.concurrency -= 1;
    }

    /// After new contacts arrived, discard the least close candidates.
    ///
    /// We keep the `MAX_CONTACTS` closest good-or-unknown nodes (and any
    /// closer ones), for announces at least `MAX_ANNOUNCE_NODES` good
    /// nodes, and whatever currently has a transaction pending. The final
    /// trim before announcing keeps only good nodes.
    fn trim(&mut self, final_trim: bool) {
        let mut need_closest: i64 = if final_trim { 0 } else { MAX_CONTACTS as i64 };
        let mut need_good: i64 = if self.is_announce() { MAX_ANNOUNCE_NODES as i64 } else { 0 };

        self.candidates.retain(|_, candidate| {
            let is_active = candidate.state == CandidateState::Active;
            let is_good = candidate.state == CandidateState::Good;

            if !is_active && need_closest <= 0 && (!is_good || need_good <= 0) {
                return false;
            }

            need_closest -= 1;
            need_good -= i64::from(is_good);
            true
        });

        self.restart = false;
    }

    /// Switches an announce into its second phase: every remaining (good)
    /// candidate is contacted again with `get_peers`. Returns the final
    /// contact set, empty when the lookup found nobody.
    pub fn start_announce(&mut self) -> Vec<(NodeId, SocketAddrV4)> {
        self.trim(true);

        if self.candidates.is_empty() {
            return Vec::new();
        }

        assert!(
            self.is_complete() && self.candidates.len() <= MAX_ANNOUNCE_NODES,
            "start_announce called in an inconsistent state"
        );

        #[allow(clippy::cast_possible_truncation)]
        let count = self.candidates.len() as u32;
        self.contacted = count;
        self.pending = count;
        self.replied = 0;

        if let SearchKind::Announce { announcing, .. } = &mut self.kind {
            *announcing = true;
        }

        self.candidates
            .values_mut()
            .map(|candidate| {
                candidate.state = CandidateState::Active;
                (candidate.id, candidate.addr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use swarm_discovery_primitives::node_id::NodeId;

    use super::{DhtSearch, SearchKind, BASE_CONCURRENCY, MAX_CONTACTS};

    fn target() -> NodeId {
        NodeId::ZERO
    }

    fn id(last: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        NodeId(bytes)
    }

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 6881)
    }

    fn search_with_contacts(count: u8) -> DhtSearch {
        let mut search = DhtSearch::new(target(), SearchKind::Refresh);
        for i in 1..=count {
            search.add_contact(id(i), addr(i));
        }
        search
    }

    #[test]
    fn it_should_hand_out_contacts_closest_first() {
        let mut search = search_with_contacts(5);

        // Inserted in arbitrary order, returned by distance to the target.
        assert_eq!(search.get_contact().unwrap().0, id(1));
        assert_eq!(search.get_contact().unwrap().0, id(2));
        assert_eq!(search.get_contact().unwrap().0, id(3));
    }

    #[test]
    fn it_should_stop_at_the_concurrency_limit() {
        let mut search = search_with_contacts(10);

        for _ in 0..BASE_CONCURRENCY {
            assert!(search.get_contact().is_some());
        }
        assert!(search.get_contact().is_none());

        // A resolved contact frees a slot.
        search.node_status(&id(1), true);
        assert!(search.get_contact().is_some());
    }

    #[test]
    fn it_should_lift_the_limit_for_stalled_transactions() {
        let mut search = search_with_contacts(10);

        for _ in 0..BASE_CONCURRENCY {
            search.get_contact();
        }

        search.increase_concurrency();
        assert!(search.get_contact().is_some());
        assert!(search.get_contact().is_none());
    }

    #[test]
    fn it_should_complete_once_all_pending_contacts_resolved() {
        let mut search = search_with_contacts(2);

        search.get_contact();
        search.get_contact();
        assert!(search.start());
        assert!(!search.is_complete());

        search.node_status(&id(1), true);
        search.node_status(&id(2), false);
        assert!(search.is_complete());
        assert_eq!(search.num_replied(), 1);
        assert_eq!(search.num_contacted(), 2);
    }

    #[test]
    fn it_should_trim_distant_candidates_when_new_ones_arrive() {
        let mut search = search_with_contacts(30);

        // Handing out a contact triggers the trim.
        search.get_contact();

        assert_eq!(search.num_candidates(), MAX_CONTACTS);
    }

    #[test]
    fn it_should_keep_pending_candidates_through_a_trim() {
        let mut search = DhtSearch::new(target(), SearchKind::Refresh);

        // Contact a distant candidate, then flood the set with closer ones
        // so the trim has plenty to discard.
        search.add_contact(id(200), addr(200));
        let (contacted, _) = search.get_contact().unwrap();
        assert_eq!(contacted, id(200));

        for i in 1..40 {
            search.add_contact(id(i), addr(i));
        }
        while search.get_contact().is_some() {}

        // The distant candidate is far outside the kept window but has a
        // transaction pending, so the trim must not have dropped it.
        search.node_status(&id(200), false);
    }

    #[test]
    fn it_should_enter_the_announce_phase_with_only_good_nodes() {
        let mut search = DhtSearch::new(target(), SearchKind::Announce {
            peers: Vec::new(),
            announcing: false,
        });

        for i in 1..=6 {
            search.add_contact(id(i), addr(i));
        }

        let mut contacted = Vec::new();
        while let Some((id, _)) = search.get_contact() {
            contacted.push(id);
        }
        search.start();

        // Three resolve well, three never reply.
        search.node_status(&id(1), true);
        search.node_status(&id(2), false);
        search.node_status(&id(3), true);
        while let Some((id, _)) = search.get_contact() {
            contacted.push(id);
        }
        for i in 4..=6 {
            search.node_status(&id(i), i % 2 == 0);
        }

        assert!(search.is_complete());

        let announce_set: Vec<NodeId> = search.start_announce().into_iter().map(|(id, _)| id).collect();

        assert_eq!(announce_set, vec![id(1), id(3), id(4), id(6)]);
        assert!(search.is_announcing());
    }

    #[test]
    fn it_should_gather_peers_only_for_announces() {
        let mut refresh = DhtSearch::new(target(), SearchKind::Refresh);
        refresh.add_peers(&[addr(1)]);
        assert!(refresh.peers().is_empty());

        let mut announce = DhtSearch::new(target(), SearchKind::Announce {
            peers: Vec::new(),
            announcing: false,
        });
        announce.add_peers(&[addr(1)]);
        assert_eq!(announce.peers(), &[addr(1)]);
    }
}
