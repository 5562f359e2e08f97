//! One outstanding DHT RPC.
//!
//! Transactions are keyed by the remote IPv4 address plus an 8-bit
//! transaction id, packed into a `u64` so that all transactions of one
//! address form a contiguous key range.
use std::net::SocketAddrV4;
use std::time::Duration;

use swarm_discovery_primitives::info_hash::InfoHash;
use swarm_discovery_primitives::node_id::NodeId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;

use super::search::SearchId;

/// After this long without a reply the transaction has failed.
pub const FULL_TIMEOUT: Duration = Duration::from_secs(30);

/// A `find_node` transaction counts as stalled after this long; the search
/// may issue an extra concurrent query while the stalled one still waits
/// out its full timeout.
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(4);

/// Table key: IPv4 address in the high half, transaction id in the low.
#[must_use]
pub fn key(addr: &SocketAddrV4, transaction_id: u8) -> u64 {
    (u64::from(u32::from(*addr.ip())) << 32) | u64::from(transaction_id)
}

#[must_use]
pub fn key_matches_addr(key: u64, addr: &SocketAddrV4) -> bool {
    (key >> 32) == u64::from(u32::from(*addr.ip()))
}

#[must_use]
pub fn transaction_id_of(key: u64) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    {
        key as u8
    }
}

#[derive(Debug, Clone)]
pub enum TransactionKind {
    Ping,
    FindNode { search: SearchId },
    GetPeers { search: SearchId },
    AnnouncePeer { info_hash: InfoHash, token: Vec<u8> },
}

#[derive(Debug)]
pub struct Transaction {
    /// The queried node's id; the zero id when we do not know it (pings to
    /// raw bootstrap contacts).
    pub node_id: NodeId,
    pub addr: SocketAddrV4,
    pub kind: TransactionKind,

    pub timeout: DurationSinceUnixEpoch,
    pub quick_timeout: Option<DurationSinceUnixEpoch>,

    /// The query packet still sits in the send queue; the node cannot be
    /// blamed for not answering it.
    pub has_packet: bool,

    /// This transaction raised its search's concurrency limit (get_peers
    /// from creation, find_node once stalled); completing it lowers the
    /// limit again.
    pub boosted_concurrency: bool,
}

impl Transaction {
    #[must_use]
    pub fn new(kind: TransactionKind, node_id: NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) -> Transaction {
        let quick_timeout = match kind {
            TransactionKind::FindNode { .. } => Some(now + QUICK_TIMEOUT),
            _ => None,
        };

        Transaction {
            node_id,
            addr,
            kind,
            timeout: now + FULL_TIMEOUT,
            quick_timeout,
            has_packet: false,
            boosted_concurrency: false,
        }
    }

    #[must_use]
    pub fn search(&self) -> Option<SearchId> {
        match self.kind {
            TransactionKind::FindNode { search } | TransactionKind::GetPeers { search } => Some(search),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_search(&self) -> bool {
        self.search().is_some()
    }

    /// The quick timeout fired; it must not fire again.
    pub fn set_stalled(&mut self) {
        assert!(self.quick_timeout.is_some(), "transaction stalled twice");

        self.quick_timeout = None;
        self.boosted_concurrency = true;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use swarm_discovery_primitives::node_id::NodeId;

    use super::{key, key_matches_addr, transaction_id_of, Transaction, TransactionKind};
    use crate::dht::search::SearchId;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 6881)
    }

    #[test]
    fn it_should_pack_address_and_id_into_the_key() {
        let packed = key(&addr(1), 0xAB);

        assert!(key_matches_addr(packed, &addr(1)));
        assert!(!key_matches_addr(packed, &addr(2)));
        assert_eq!(transaction_id_of(packed), 0xAB);
    }

    #[test]
    fn it_should_key_all_ids_of_one_address_contiguously() {
        let low = key(&addr(1), 0);
        let high = key(&addr(1), 255);
        let other = key(&addr(2), 0);

        assert_eq!(high - low, 255);
        assert!(other > high);
    }

    #[test]
    fn it_should_only_give_find_node_a_quick_timeout() {
        let now = Duration::from_secs(1000);

        let find_node = Transaction::new(
            TransactionKind::FindNode { search: SearchId(1) },
            NodeId([1; 20]),
            addr(1),
            now,
        );
        assert_eq!(find_node.quick_timeout, Some(now + super::QUICK_TIMEOUT));

        let ping = Transaction::new(TransactionKind::Ping, NodeId([1; 20]), addr(1), now);
        assert_eq!(ping.quick_timeout, None);

        assert_eq!(find_node.timeout, now + super::FULL_TIMEOUT);
    }
}
