//! The DHT wire format: single bencoded dictionaries over UDP.
//!
//! Every packet carries a transaction id `t`, a type `y` (`q`uery,
//! `r`esponse or `e`rror) and a version tag `v`. Queries add the method
//! name `q` and an arguments dict `a`; responses carry `r`, errors a
//! two-element list `e` of code and message.
//!
//! Incoming packets are read with the bencode static map: one pass over
//! the datagram routes the handful of known keys into slots and skips
//! everything else. None of the values are copied out of the receive
//! buffer.
use std::net::SocketAddrV4;

use bencode::static_map::{read_static_map, MapKey, Slot};
use bencode::{ben_bytes, ben_int, ben_list, ben_map, BMutAccess, BencodeMut, BencodeParseResult};
use swarm_discovery_primitives::compact;
use swarm_discovery_primitives::info_hash::InfoHash;
use swarm_discovery_primitives::node_id::NodeId;

/// If a message would exceed an Ethernet frame, something went very wrong.
pub const MAX_PACKET_LEN: usize = 1500;

/// Version tag sent in every packet: client id plus two version bytes.
pub const VERSION_TAG: &[u8; 4] = b"SD\x01\x00";

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_BAD_METHOD: i64 = 204;

const A_ID: usize = 0;
const A_INFO_HASH: usize = 1;
const A_PORT: usize = 2;
const A_TARGET: usize = 3;
const A_TOKEN: usize = 4;
const E_0: usize = 5;
const E_1: usize = 6;
const Q: usize = 7;
const R_ID: usize = 8;
const R_NODES: usize = 9;
const R_TOKEN: usize = 10;
const R_VALUES: usize = 11;
const T: usize = 12;
const V: usize = 13;
const Y: usize = 14;
const KEY_COUNT: usize = 15;

/// All the keys we need or support in a DHT message. Unsupported keys in
/// received packets are skipped while decoding.
const KEYS: &[MapKey] = &[
    MapKey::new(A_ID, "a::id*S"),
    MapKey::new(A_INFO_HASH, "a::info_hash*S"),
    MapKey::new(A_PORT, "a::port"),
    MapKey::new(A_TARGET, "a::target*S"),
    MapKey::new(A_TOKEN, "a::token*S"),
    MapKey::new(E_0, "e[]*"),
    MapKey::new(E_1, "e[]*"),
    MapKey::new(Q, "q*S"),
    MapKey::new(R_ID, "r::id*S"),
    MapKey::new(R_NODES, "r::nodes*S"),
    MapKey::new(R_TOKEN, "r::token*S"),
    MapKey::new(R_VALUES, "r::values*L"),
    MapKey::new(T, "t*S"),
    MapKey::new(V, "v*"),
    MapKey::new(Y, "y*S"),
];

/// A received DHT message, borrowing from the datagram buffer.
pub struct DhtMessage<'a> {
    slots: [Slot<'a>; KEY_COUNT],
}

impl<'a> DhtMessage<'a> {
    /// Reads one datagram.
    ///
    /// # Errors
    ///
    /// Will return an error when the datagram is not a bencoded dictionary
    /// at all; the caller drops those silently since they are probably not
    /// DHT traffic.
    pub fn read(bytes: &'a [u8]) -> BencodeParseResult<DhtMessage<'a>> {
        let mut slots = [Slot::Empty; KEY_COUNT];
        read_static_map(bytes, KEYS, &mut slots)?;

        Ok(DhtMessage { slots })
    }

    #[must_use]
    pub fn transaction(&self) -> Option<&'a [u8]> {
        self.slots[T].bytes()
    }

    /// The message type byte: `q`, `r` or `e`. `None` when `y` is missing
    /// or not a single byte.
    #[must_use]
    pub fn message_type(&self) -> Option<u8> {
        match self.slots[Y].bytes() {
            Some([one]) => Some(*one),
            _ => None,
        }
    }

    #[must_use]
    pub fn query_method(&self) -> Option<&'a [u8]> {
        self.slots[Q].bytes()
    }

    /// The sender's node id: `a.id` for queries, `r.id` for responses.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        let bytes = match self.message_type()? {
            b'q' => self.slots[A_ID].bytes()?,
            b'r' => self.slots[R_ID].bytes()?,
            _ => return None,
        };

        NodeId::try_from(bytes).ok()
    }

    #[must_use]
    pub fn info_hash(&self) -> Option<InfoHash> {
        InfoHash::try_from(self.slots[A_INFO_HASH].bytes()?).ok()
    }

    #[must_use]
    pub fn target(&self) -> Option<NodeId> {
        NodeId::try_from(self.slots[A_TARGET].bytes()?).ok()
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        u16::try_from(self.slots[A_PORT].int()?).ok()
    }

    #[must_use]
    pub fn token(&self) -> Option<&'a [u8]> {
        self.slots[A_TOKEN].bytes()
    }

    #[must_use]
    pub fn nodes(&self) -> Option<&'a [u8]> {
        self.slots[R_NODES].bytes()
    }

    #[must_use]
    pub fn reply_token(&self) -> Option<&'a [u8]> {
        self.slots[R_TOKEN].bytes()
    }

    /// The compact peers from `r.values`, decoded from the raw list slice.
    /// Entries that are not 6-byte strings are skipped.
    #[must_use]
    pub fn values(&self) -> Option<Vec<SocketAddrV4>> {
        let raw = self.slots[R_VALUES].raw()?;

        let bencode = bencode::BencodeRef::decode(raw, bencode::BDecodeOpt::default()).ok()?;
        let list = bencode::BRefAccess::list(&bencode)?;

        let mut peers = Vec::new();
        for index in 0..list.len() {
            if let Some(bytes) = list.get(index).and_then(bencode::BRefAccess::bytes) {
                peers.extend(compact::decode_peers(bytes));
            }
        }

        Some(peers)
    }
}

/// Arguments of an outgoing query; the method name follows from the
/// variant.
pub enum QueryArgs<'a> {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
    AnnouncePeer { info_hash: InfoHash, token: &'a [u8], port: u16 },
}

impl QueryArgs<'_> {
    #[must_use]
    pub fn method(&self) -> &'static [u8] {
        match self {
            QueryArgs::Ping => b"ping",
            QueryArgs::FindNode { .. } => b"find_node",
            QueryArgs::GetPeers { .. } => b"get_peers",
            QueryArgs::AnnouncePeer { .. } => b"announce_peer",
        }
    }
}

#[must_use]
pub fn build_query(transaction_id: u8, own_id: &NodeId, args: &QueryArgs<'_>) -> Vec<u8> {
    let mut arguments = ben_map! {
        "id" => ben_bytes!(own_id.0.to_vec())
    };

    {
        let dict = arguments.dict_mut().unwrap();

        match args {
            QueryArgs::Ping => {}
            QueryArgs::FindNode { target } => {
                dict.insert(b"target"[..].into(), ben_bytes!(target.0.to_vec()));
            }
            QueryArgs::GetPeers { info_hash } => {
                dict.insert(b"info_hash"[..].into(), ben_bytes!(info_hash.0.to_vec()));
            }
            QueryArgs::AnnouncePeer { info_hash, token, port } => {
                dict.insert(b"info_hash"[..].into(), ben_bytes!(info_hash.0.to_vec()));
                dict.insert(b"port"[..].into(), ben_int!(i64::from(*port)));
                dict.insert(b"token"[..].into(), ben_bytes!(token.to_vec()));
            }
        }
    }

    let message = ben_map! {
        "a" => arguments,
        "q" => ben_bytes!(args.method()),
        "t" => ben_bytes!(vec![transaction_id]),
        "v" => ben_bytes!(VERSION_TAG.to_vec()),
        "y" => ben_bytes!("q")
    };

    finish(message)
}

/// Payload of a response beyond our id.
#[derive(Default)]
pub struct ResponseValues {
    pub nodes: Option<Vec<u8>>,
    pub token: Option<Vec<u8>>,
    pub values: Option<Vec<SocketAddrV4>>,
}

#[must_use]
pub fn build_response(transaction: &[u8], own_id: &NodeId, payload: ResponseValues) -> Vec<u8> {
    let mut reply = ben_map! {
        "id" => ben_bytes!(own_id.0.to_vec())
    };

    {
        let dict = reply.dict_mut().unwrap();

        if let Some(nodes) = payload.nodes {
            dict.insert(b"nodes"[..].into(), ben_bytes!(nodes));
        }
        if let Some(token) = payload.token {
            dict.insert(b"token"[..].into(), ben_bytes!(token));
        }
        if let Some(values) = payload.values {
            let mut list = BencodeMut::new_list();
            {
                let entries = list.list_mut().unwrap();
                for peer in values {
                    entries.push(ben_bytes!(compact::encode_peer(&peer).to_vec()));
                }
            }
            dict.insert(b"values"[..].into(), list);
        }
    }

    let message = ben_map! {
        "r" => reply,
        "t" => ben_bytes!(transaction.to_vec()),
        "v" => ben_bytes!(VERSION_TAG.to_vec()),
        "y" => ben_bytes!("r")
    };

    finish(message)
}

#[must_use]
pub fn build_error(transaction: Option<&[u8]>, code: i64, message: &str) -> Vec<u8> {
    let mut error = ben_map! {
        "e" => ben_list!(ben_int!(code), ben_bytes!(message.as_bytes().to_vec())),
        "v" => ben_bytes!(VERSION_TAG.to_vec()),
        "y" => ben_bytes!("e")
    };

    if let Some(transaction) = transaction {
        error.dict_mut().unwrap().insert(b"t"[..].into(), ben_bytes!(transaction.to_vec()));
    }

    finish(error)
}

fn finish(message: BencodeMut<'_>) -> Vec<u8> {
    let bytes = message.encode();
    debug_assert!(bytes.len() <= MAX_PACKET_LEN, "outgoing DHT packet exceeds one Ethernet frame");
    bytes
}
