//! The core `tracker` module contains the announce scheduling logic which is
//! independent of the delivery layer.
//!
//! It decides *which* tracker to contact *when*; the actual HTTP and UDP
//! requests live in [`crate::clients`] and the DHT in [`crate::dht`].
//!
//! ```text
//! Delivery layer        Domain layer
//!
//!   HTTP client |
//!    UDP client |>  TrackerController -> TrackerList -> Tracker
//!   DHT service |
//! ```
//!
//! The controller and list are synchronous state machines: every method
//! takes the current time and I/O surfaces as data. Sending marks a tracker
//! busy and queues a [`RequestTicket`]; the driver task executes tickets and
//! feeds results back through the `receive_*` methods. A ticket carries the
//! tracker's request generation, so a result whose generation is stale (the
//! request was closed or disowned in the meantime) is silently dropped —
//! a tracker never observes interleaved results.
use std::net::SocketAddrV4;

use swarm_discovery_primitives::announce_event::AnnounceEvent;

pub mod controller;
pub mod tracker;
pub mod tracker_list;

/// The last request kind a tracker was asked to perform.
///
/// Unlike [`AnnounceEvent`] this includes scrapes, which share the busy flag
/// with announces but not their scheduling restrictions.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrackerEvent {
    None,
    Completed,
    Started,
    Stopped,
    Scrape,
}

impl TrackerEvent {
    /// The announce event to put on the wire, or `None` for scrapes.
    #[must_use]
    pub fn announce_event(&self) -> Option<AnnounceEvent> {
        match self {
            TrackerEvent::None => Some(AnnounceEvent::None),
            TrackerEvent::Completed => Some(AnnounceEvent::Completed),
            TrackerEvent::Started => Some(AnnounceEvent::Started),
            TrackerEvent::Stopped => Some(AnnounceEvent::Stopped),
            TrackerEvent::Scrape => None,
        }
    }

    /// Bit for the close/disown event masks.
    #[must_use]
    pub fn bit(&self) -> u32 {
        match self {
            TrackerEvent::None => 1,
            TrackerEvent::Completed => 1 << 1,
            TrackerEvent::Started => 1 << 2,
            TrackerEvent::Stopped => 1 << 3,
            TrackerEvent::Scrape => 1 << 4,
        }
    }
}

/// Transfer progress reported with every announce.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// What a tracker answered to an announce.
#[derive(Clone, Debug, Default)]
pub struct AnnounceReply {
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddrV4>,
}

/// What a tracker answered to a scrape, for one torrent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeReply {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// A request the scheduling core wants the driver to perform.
///
/// `tracker` is the list index at send time and only valid until the next
/// list mutation; `seq` is the list-wide unique request generation, which
/// results are routed by. Results carrying a stale generation are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTicket {
    pub tracker: usize,
    pub seq: u64,
    pub kind: RequestKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Announce(AnnounceEvent),
    Scrape,
}
