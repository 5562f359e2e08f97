//! Compact wire encodings for peers and DHT nodes.
//!
//! A compact peer is 6 bytes: 4-byte IPv4 address plus 2-byte port, both
//! big-endian. Compact node info prepends the 20-byte node id, giving
//! 26-byte records. Trackers and DHT nodes concatenate these records
//! without separators.
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::node_id::{NodeId, NODE_ID_BYTES_LEN};

pub const COMPACT_PEER_LEN: usize = 6;
pub const COMPACT_NODE_INFO_LEN: usize = NODE_ID_BYTES_LEN + COMPACT_PEER_LEN;

/// A (node id, IPv4 socket address) record from a `find_node` or
/// `get_peers` reply.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

#[must_use]
pub fn encode_peer(addr: &SocketAddrV4) -> [u8; COMPACT_PEER_LEN] {
    let mut buffer = [0u8; COMPACT_PEER_LEN];
    buffer[..4].copy_from_slice(&addr.ip().octets());
    buffer[4..].copy_from_slice(&addr.port().to_be_bytes());
    buffer
}

/// Decodes a concatenation of 6-byte compact peers.
///
/// A trailing partial record is ignored, matching what remote
/// implementations send when they truncate at a packet boundary.
#[must_use]
pub fn decode_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

#[must_use]
pub fn encode_node_info(node: &NodeInfo) -> [u8; COMPACT_NODE_INFO_LEN] {
    let mut buffer = [0u8; COMPACT_NODE_INFO_LEN];
    buffer[..NODE_ID_BYTES_LEN].copy_from_slice(&node.id.0);
    buffer[NODE_ID_BYTES_LEN..].copy_from_slice(&encode_peer(&node.addr));
    buffer
}

/// Decodes a concatenation of 26-byte compact node info records, ignoring
/// a trailing partial record.
#[must_use]
pub fn decode_node_info(bytes: &[u8]) -> Vec<NodeInfo> {
    bytes
        .chunks_exact(COMPACT_NODE_INFO_LEN)
        .map(|chunk| {
            let id = NodeId::try_from(&chunk[..NODE_ID_BYTES_LEN]).expect("chunk has exactly 20 id bytes");
            let addr = decode_peers(&chunk[NODE_ID_BYTES_LEN..])[0];
            NodeInfo { id, addr }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::{decode_node_info, decode_peers, encode_node_info, encode_peer, NodeInfo};
    use crate::node_id::NodeId;

    #[test]
    fn it_should_round_trip_a_compact_peer() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881);

        let encoded = encode_peer(&addr);

        assert_eq!(encoded, [127, 0, 0, 1, 0x1A, 0xE1]);
        assert_eq!(decode_peers(&encoded), vec![addr]);
    }

    #[test]
    fn it_should_decode_concatenated_peers_ignoring_a_partial_trailer() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_peer(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 51413)));
        bytes.extend_from_slice(&encode_peer(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51414)));
        bytes.extend_from_slice(&[1, 2, 3]);

        let peers = decode_peers(&bytes);

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].port(), 51414);
    }

    #[test]
    fn it_should_round_trip_a_compact_node_info_record() {
        let node = NodeInfo {
            id: NodeId([0x5A; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), 6881),
        };

        let encoded = encode_node_info(&node);

        assert_eq!(encoded.len(), 26);
        assert_eq!(decode_node_info(&encoded), vec![node]);
    }
}
