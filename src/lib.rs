//! **swarm-discovery** is a `BitTorrent` peer discovery library: it finds
//! the peers of a swarm by talking to announce trackers and to the
//! Kademlia-based Mainline DHT.
//!
//! [`BitTorrent`](https://en.wikipedia.org/wiki/BitTorrent) peers need to
//! know where to find the other peers sharing the files they are looking
//! for. Trackers answer that question centrally; the DHT answers it without
//! any central party. This crate implements the client side of both and the
//! scheduling glue that drives them, and nothing else: no peer wire
//! protocol, no piece downloading, no file I/O.
//!
//! # Components
//!
//! ```text
//! Delivery layer            Domain layer
//!
//!   HTTP tracker client  |
//!    UDP tracker client  |>  TrackerController -> TrackerList -> Tracker
//!           DHT service  |            |
//!                                     v
//!                              SwarmEvent (peers / failure)
//! ```
//!
//! - [`core`]: the tracker scheduling state machines.
//! - [`clients`]: announce and scrape over HTTP (BEP-3) and UDP (BEP-15).
//! - [`dht`]: a full Mainline DHT node (BEP-5) with routing table,
//!   iterative searches, announce tokens and peer tracking.
//! - [`discovery`]: the per-torrent task tying the above together.
//! - [`app`] / [`bootstrap`]: configuration-driven wiring and logging.
//!
//! # Usage
//!
//! ```rust,no_run
//! use swarm_discovery::app::App;
//! use swarm_discovery::discovery::SwarmEvent;
//! use swarm_discovery_configuration::Configuration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::start(Configuration::default()).await?;
//!
//!     let info_hash = "9c38422213e30bff212b30c360d26f9a02136422".parse().unwrap();
//!     let trackers = vec![(0, "udp://tracker.example.com:6969".to_string())];
//!
//!     let (handle, mut events, _task) = app.discover(info_hash, &trackers)?;
//!     handle.send_start_event();
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SwarmEvent::Peers(peers) => println!("{} peers", peers.len()),
//!             SwarmEvent::Failure(msg) => eprintln!("announce failed: {msg}"),
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
pub mod app;
pub mod bootstrap;
pub mod clients;
pub mod core;
pub mod dht;
pub mod discovery;
pub mod shared;

/// This code needs to be copied into each crate.
/// Working version, for production.
#[cfg(not(test))]
pub(crate) type CurrentClock = swarm_discovery_clock::clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
pub(crate) type CurrentClock = swarm_discovery_clock::clock::Stopped;
