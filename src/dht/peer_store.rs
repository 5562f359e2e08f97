//! Per-infohash store of announced swarm peers.
use std::net::SocketAddrV4;
use std::time::Duration;

use rand::Rng;
use swarm_discovery_primitives::DurationSinceUnixEpoch;

/// Maximum number of peers we return for a `get_peers` query (default
/// value only). Small enough that a payload of this many 6-byte records
/// does not need fragmentation; roughly the size of a `find_node` reply
/// (8 * 26 bytes).
pub const MAX_PEERS_PER_REPLY: usize = 32;

/// Maximum number of peers we keep per torrent. For busier torrents each
/// new announce replaces the oldest peer instead of growing the table.
pub const MAX_STORED_PEERS: usize = 128;

/// Peers that have not reannounced within this window are pruned.
pub const REANNOUNCE_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Container for the peers announced under one infohash.
///
/// Peers and their announce times are kept in two parallel vectors; entries
/// stay in announce order, which makes the oldest-entry scan trivial.
#[derive(Default, Debug)]
pub struct PeerStore {
    peers: Vec<SocketAddrV4>,
    last_seen: Vec<DurationSinceUnixEpoch>,
}

impl PeerStore {
    #[must_use]
    pub fn new() -> PeerStore {
        PeerStore::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Adds or refreshes a peer. At capacity the oldest entry is replaced.
    /// Port zero announces are discarded.
    pub fn add_peer(&mut self, addr: SocketAddrV4, now: DurationSinceUnixEpoch) {
        if addr.port() == 0 {
            return;
        }

        let mut oldest = 0;
        let mut oldest_seen = DurationSinceUnixEpoch::MAX;

        for i in 0..self.peers.len() {
            if self.peers[i].ip() == addr.ip() {
                self.peers[i] = addr;
                self.last_seen[i] = now;
                return;
            }

            if self.last_seen[i] < oldest_seen {
                oldest_seen = self.last_seen[i];
                oldest = i;
            }
        }

        if self.peers.len() < MAX_STORED_PEERS {
            self.peers.push(addr);
            self.last_seen.push(now);
        } else {
            self.peers[oldest] = addr;
            self.last_seen[oldest] = now;
        }
    }

    /// Up to `max_peers` peers. When more are stored, a random contiguous
    /// block is returned so successive calls cycle through all peers
    /// without fragmenting the reply packet. Peers in overlapping blocks
    /// get picked a little more often, which beats returning fewer peers.
    #[must_use]
    pub fn get_peers(&self, max_peers: usize, rng: &mut impl Rng) -> Vec<SocketAddrV4> {
        if self.peers.len() <= max_peers {
            return self.peers.clone();
        }

        let blocks = self.peers.len().div_ceil(max_peers);
        let first = (rng.gen_range(0..blocks) * (self.peers.len() - max_peers)) / (blocks - 1);

        self.peers[first..first + max_peers].to_vec()
    }

    /// Removes entries older than `max_age`.
    pub fn prune(&mut self, max_age: Duration, now: DurationSinceUnixEpoch) {
        let min_seen = now.saturating_sub(max_age);

        let mut i = 0;
        while i < self.peers.len() {
            if self.last_seen[i] < min_seen {
                self.peers.remove(i);
                self.last_seen.remove(i);
            } else {
                i += 1;
            }
        }

        assert_eq!(self.peers.len(), self.last_seen.len(), "inconsistent peer pruning");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use super::{PeerStore, MAX_PEERS_PER_REPLY, MAX_STORED_PEERS, REANNOUNCE_WINDOW};

    const T0: u64 = 1_000_000;

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn peer(index: u16) -> SocketAddrV4 {
        #[allow(clippy::cast_possible_truncation)]
        SocketAddrV4::new(Ipv4Addr::new(10, (index >> 8) as u8, index as u8, 1), 6881)
    }

    #[test]
    fn it_should_refresh_a_reannouncing_peer_instead_of_duplicating_it() {
        let mut store = PeerStore::new();

        store.add_peer(peer(0), at(T0));
        store.add_peer(peer(0), at(T0 + 60));

        assert_eq!(store.len(), 1);

        // The refreshed entry survives a prune that would have dropped the
        // original timestamp.
        store.prune(REANNOUNCE_WINDOW, at(T0 + 60 + 29 * 60));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn it_should_drop_port_zero_announces() {
        let mut store = PeerStore::new();

        store.add_peer(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 0), at(T0));

        assert!(store.is_empty());
    }

    #[test]
    fn it_should_append_below_capacity_and_replace_the_oldest_at_capacity() {
        let mut store = PeerStore::new();

        for i in 0..MAX_STORED_PEERS as u16 - 1 {
            store.add_peer(peer(i), at(T0 + u64::from(i)));
        }
        assert_eq!(store.len(), MAX_STORED_PEERS - 1);

        // One below capacity: simply appended.
        store.add_peer(peer(1000), at(T0 + 5000));
        assert_eq!(store.len(), MAX_STORED_PEERS);

        // At capacity: the single oldest entry (peer 0) is replaced.
        store.add_peer(peer(2000), at(T0 + 6000));
        assert_eq!(store.len(), MAX_STORED_PEERS);

        let peers = store.get_peers(MAX_STORED_PEERS, &mut rand::thread_rng());
        assert!(!peers.contains(&peer(0)));
        assert!(peers.contains(&peer(1)));
        assert!(peers.contains(&peer(2000)));
    }

    #[test]
    fn it_should_return_everything_when_under_the_reply_limit() {
        let mut store = PeerStore::new();

        for i in 0..10u16 {
            store.add_peer(peer(i), at(T0));
        }

        assert_eq!(store.get_peers(MAX_PEERS_PER_REPLY, &mut rand::thread_rng()).len(), 10);
    }

    #[test]
    fn it_should_return_a_window_with_one_of_two_starts_when_oversized() {
        let mut store = PeerStore::new();

        // Between one and two reply limits: two possible blocks, starting
        // either at the beginning or right before the end.
        for i in 0..48u16 {
            store.add_peer(peer(i), at(T0));
        }

        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let peers = store.get_peers(MAX_PEERS_PER_REPLY, &mut rng);

            assert_eq!(peers.len(), MAX_PEERS_PER_REPLY);
            assert!(peers[0] == peer(0) || peers[0] == peer(16), "unexpected window start {:?}", peers[0]);
        }
    }

    #[test]
    fn it_should_prune_entries_past_the_reannounce_window() {
        let mut store = PeerStore::new();

        store.add_peer(peer(0), at(T0));
        store.add_peer(peer(1), at(T0 + 600));

        store.prune(REANNOUNCE_WINDOW, at(T0 + 600 + 30 * 60));

        let peers = store.get_peers(MAX_PEERS_PER_REPLY, &mut rand::thread_rng());
        assert_eq!(peers, vec![peer(1)]);
    }
}
