//! Persisting the routing table between runs.
//!
//! The cache is a bencoded dictionary: our node id under `self_id`, the
//! known nodes under `nodes` (a dict keyed by the raw 20-byte id, each
//! entry holding ip, port and last-seen time) and, while the bootstrap is
//! still running, the unresolved `contacts`.
use std::net::{Ipv4Addr, SocketAddrV4};

use bencode::{ben_bytes, ben_int, ben_list, ben_map, BDecodeOpt, BMutAccess, BRefAccess, BencodeMut, BencodeRef};
use swarm_discovery_primitives::node_id::NodeId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;
use thiserror::Error;

use super::routing::RoutingTable;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache is not valid bencode: {source}")]
    Bencode {
        #[from]
        source: bencode::BencodeParseError,
    },

    #[error("cache has an unexpected shape: {reason}")]
    Invalid { reason: &'static str },
}

/// The decoded contents of a cache file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadedCache {
    pub self_id: Option<NodeId>,
    pub nodes: Vec<(NodeId, SocketAddrV4, DurationSinceUnixEpoch)>,
    pub contacts: Vec<(String, u16)>,
}

/// Encodes the table (and pending bootstrap contacts) for persistence.
/// Bad nodes are not worth keeping.
#[must_use]
pub fn encode_cache(routing: &RoutingTable, contacts: Option<&[(String, u16)]>) -> Vec<u8> {
    let mut nodes = BencodeMut::new_dict();

    {
        let dict = nodes.dict_mut().unwrap();

        for node in routing.nodes().filter(|node| !node.is_bad()) {
            let entry = ben_map! {
                "i" => ben_int!(i64::from(u32::from(*node.addr().ip()))),
                "p" => ben_int!(i64::from(node.addr().port())),
                "t" => ben_int!(i64::try_from(node.last_seen().as_secs()).unwrap_or(0))
            };

            dict.insert(node.id().0.to_vec().into(), entry);
        }
    }

    let mut cache = ben_map! {
        "nodes" => nodes,
        "self_id" => ben_bytes!(routing.own_id().0.to_vec())
    };

    if let Some(contacts) = contacts {
        let mut list = BencodeMut::new_list();
        {
            let entries = list.list_mut().unwrap();
            for (host, port) in contacts {
                entries.push(ben_list!(
                    ben_bytes!(host.clone().into_bytes()),
                    ben_int!(i64::from(*port))
                ));
            }
        }

        cache.dict_mut().unwrap().insert(b"contacts"[..].into(), list);
    }

    cache.encode()
}

/// Decodes a cache previously written by [`encode_cache`].
///
/// # Errors
///
/// Will return an error when the cache is not bencode or its node records
/// are malformed.
pub fn decode_cache(bytes: &[u8]) -> Result<LoadedCache, CacheError> {
    let bencode = BencodeRef::decode(bytes, BDecodeOpt::default())?;
    let dict = bencode.dict().ok_or(CacheError::Invalid {
        reason: "cache is not a dictionary",
    })?;

    let mut loaded = LoadedCache::default();

    if let Some(self_id) = dict.lookup(b"self_id".as_slice()) {
        let bytes = self_id.bytes().ok_or(CacheError::Invalid {
            reason: "self_id is not a byte string",
        })?;
        loaded.self_id = Some(NodeId::try_from(bytes).map_err(|_| CacheError::Invalid { reason: "invalid self_id" })?);
    }

    if let Some(nodes) = dict.lookup(b"nodes".as_slice()) {
        let nodes = nodes.dict().ok_or(CacheError::Invalid {
            reason: "nodes is not a dictionary",
        })?;

        for (id, entry) in nodes.to_list() {
            let id = NodeId::try_from(*id).map_err(|_| CacheError::Invalid { reason: "invalid node id" })?;

            let entry = entry.dict().ok_or(CacheError::Invalid {
                reason: "node entry is not a dictionary",
            })?;

            let lookup_int = |key: &[u8]| -> Result<i64, CacheError> {
                entry
                    .lookup(key)
                    .and_then(|value| value.int())
                    .ok_or(CacheError::Invalid { reason: "node entry field missing" })
            };

            let ip = u32::try_from(lookup_int(b"i")?).map_err(|_| CacheError::Invalid { reason: "invalid node address" })?;
            let port = u16::try_from(lookup_int(b"p")?).map_err(|_| CacheError::Invalid { reason: "invalid node port" })?;
            let last_seen = u64::try_from(lookup_int(b"t")?).unwrap_or(0);

            loaded.nodes.push((
                id,
                SocketAddrV4::new(Ipv4Addr::from(ip), port),
                DurationSinceUnixEpoch::from_secs(last_seen),
            ));
        }
    }

    if let Some(contacts) = dict.lookup(b"contacts".as_slice()) {
        let contacts = contacts.list().ok_or(CacheError::Invalid {
            reason: "contacts is not a list",
        })?;

        for index in 0..contacts.len() {
            let Some(pair) = contacts.get(index).and_then(BRefAccess::list) else {
                continue;
            };

            let host = pair.get(0).and_then(BRefAccess::str);
            let port = pair.get(1).and_then(BRefAccess::int).and_then(|p| u16::try_from(p).ok());

            if let (Some(host), Some(port)) = (host, port) {
                loaded.contacts.push((host.to_string(), port));
            }
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use swarm_discovery_primitives::node_id::NodeId;

    use super::{decode_cache, encode_cache};
    use crate::dht::routing::RoutingTable;

    const T0: u64 = 1_000_000;

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        NodeId(bytes)
    }

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 6881)
    }

    #[test]
    fn it_should_round_trip_the_routing_table() {
        let mut table = RoutingTable::new(id(0x10), at(T0));
        table.add_node(id(0xA0), addr(1), at(T0));
        table.add_node(id(0xB0), addr(2), at(T0));
        table.node_replied(&id(0xA0), addr(1), at(T0 + 5));

        let contacts = vec![("router.example.com".to_string(), 6881u16)];
        let bytes = encode_cache(&table, Some(&contacts));

        let loaded = decode_cache(&bytes).unwrap();

        assert_eq!(loaded.self_id, Some(id(0x10)));
        assert_eq!(loaded.contacts, contacts);
        assert_eq!(loaded.nodes.len(), 2);

        let restored: RoutingTable = {
            let mut restored = RoutingTable::new(loaded.self_id.unwrap(), at(T0 + 10));
            for (id, addr, last_seen) in &loaded.nodes {
                restored.add_cached_node(*id, *addr, *last_seen, at(T0 + 10));
            }
            restored
        };

        assert_eq!(restored.num_nodes(), 2);
        assert_eq!(restored.node(&id(0xA0)).unwrap().addr(), addr(1));
        assert_eq!(restored.node(&id(0xA0)).unwrap().last_seen(), at(T0 + 5));
        // The recently seen node is restored as good.
        assert!(restored.node(&id(0xA0)).unwrap().is_good());
        assert!(!restored.node(&id(0xB0)).unwrap().is_good());
    }

    #[test]
    fn it_should_not_persist_bad_nodes() {
        let mut table = RoutingTable::new(id(0x10), at(T0));
        table.add_node(id(0xA0), addr(1), at(T0));

        for _ in 0..crate::dht::node::MAX_FAILED_REPLIES {
            table.node_inactive(&id(0xA0), addr(1), at(T0));
        }

        let loaded = decode_cache(&encode_cache(&table, None)).unwrap();

        assert!(loaded.nodes.is_empty());
    }

    #[test]
    fn it_should_reject_a_cache_with_a_malformed_node_id() {
        let bytes = b"d5:nodesd3:abcd1:ii0e1:pi1e1:ti0eee7:self_id20:aaaaaaaaaaaaaaaaaaaae";

        assert!(decode_cache(bytes).is_err());
    }

    #[test]
    fn it_should_reject_garbage() {
        assert!(decode_cache(b"not a cache").is_err());
    }
}
