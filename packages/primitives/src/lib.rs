//! Primitive types for [swarm-discovery](https://docs.rs/swarm-discovery).
//!
//! This module contains the basic data structures for the swarm-discovery
//! library, which discovers `BitTorrent` swarm peers via announce trackers
//! and the Mainline DHT. These structures are shared by all the crates in
//! the workspace.
use std::time::Duration;

pub mod announce_event;
pub mod compact;
pub mod info_hash;
pub mod node_id;
pub mod peer;

/// Duration since the Unix Epoch.
pub type DurationSinceUnixEpoch = Duration;
