//! Delivery layer: the protocol clients the scheduling core hands its
//! request tickets to.
//!
//! - [`http`]: announce and scrape over HTTP GET (BEP-3, BEP-48).
//! - [`udp`]: announce and scrape over the UDP tracker protocol (BEP-15).
use swarm_discovery_primitives::announce_event::AnnounceEvent;
use swarm_discovery_primitives::info_hash::InfoHash;
use swarm_discovery_primitives::peer::PeerId;

use crate::core::AnnounceStats;

pub mod http;
pub mod udp;

/// Everything a tracker needs to know about us for one announce, shared by
/// the HTTP and UDP clients.
#[derive(Clone, Debug)]
pub struct AnnounceQuery {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// The port we accept peer connections on.
    pub port: u16,
    pub stats: AnnounceStats,
    pub event: AnnounceEvent,
    /// Number of peers wanted; `None` lets the tracker decide.
    pub numwant: Option<i32>,
    /// Random key identifying us across IP changes.
    pub key: Option<u32>,
    /// Tracker id echoed from a previous announce response.
    pub tracker_id: Option<String>,
}
