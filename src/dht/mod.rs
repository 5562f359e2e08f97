//! The Mainline DHT (BEP-5): a Kademlia routing table over UDP through
//! which peers find each other without any tracker.
//!
//! Layering, leaves first:
//!
//! - [`node`] / [`bucket`] / [`routing`]: the routing table.
//! - [`search`]: iterative lookups over the table.
//! - [`message`] / [`transaction`]: the wire format and RPC bookkeeping.
//! - [`token`] / [`peer_store`]: what makes us a useful citizen — we track
//!   announced peers for others and guard writes with tokens.
//! - [`server`]: the sans-io state machine tying it all together.
//! - [`service`]: the tokio task that owns the socket and drives the
//!   server.
//! - [`cache`]: persistence of the table between runs.
pub mod bucket;
pub mod cache;
pub mod message;
pub mod node;
pub mod peer_store;
pub mod routing;
pub mod search;
pub mod server;
pub mod service;
pub mod token;
pub mod transaction;
