//! The tokio task that owns the DHT's UDP socket and drives the sans-io
//! [`DhtServer`].
//!
//! All DHT state lives inside this one task; the rest of the application
//! talks to it through a [`DhtHandle`]. Timers, socket readiness and
//! commands meet in a single `select!` loop, so the server is never touched
//! concurrently.
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use swarm_discovery_clock::clock::Time;
use swarm_discovery_configuration::Dht;
use swarm_discovery_primitives::info_hash::InfoHash;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::{generate_node_id, AnnounceTicket, DhtEvent, DhtServer};
use crate::shared::throttle::Throttle;
use crate::CurrentClock;

/// How often pending transactions are checked for timeouts.
const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// How often a bootstrap round runs until the table is filled.
const BOOTSTRAP_PERIOD: Duration = Duration::from_secs(60);

/// How often the table, tokens and peer stores are refreshed.
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(15 * 60);

type AnnounceResult = Result<Vec<SocketAddrV4>, String>;

enum Command {
    Announce {
        info_hash: InfoHash,
        reply: oneshot::Sender<AnnounceResult>,
    },
    CancelAnnounce {
        info_hash: InfoHash,
    },
    AddNode {
        host: String,
        port: u16,
    },
    ContactResolved {
        addr: SocketAddrV4,
    },
    StoreCache {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Stop,
}

/// Cheap-to-clone handle to the running DHT task.
#[derive(Clone)]
pub struct DhtHandle {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
}

impl DhtHandle {
    /// The address the DHT socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts a peer search plus announce for the infohash. The receiver
    /// yields the found peers, or an error message; it is dropped without
    /// a value when the announce is cancelled or the service stops.
    pub fn announce(&self, info_hash: InfoHash) -> oneshot::Receiver<AnnounceResult> {
        let (reply, receiver) = oneshot::channel();

        let _ = self.commands.send(Command::Announce { info_hash, reply });

        receiver
    }

    pub fn cancel_announce(&self, info_hash: InfoHash) {
        let _ = self.commands.send(Command::CancelAnnounce { info_hash });
    }

    /// Feeds an external `host:port` contact into the bootstrap process.
    pub fn add_node(&self, host: String, port: u16) {
        let _ = self.commands.send(Command::AddNode { host, port });
    }

    /// Serializes the current routing table, for persisting at shutdown.
    pub async fn store_cache(&self) -> Option<Vec<u8>> {
        let (reply, receiver) = oneshot::channel();

        self.commands.send(Command::StoreCache { reply }).ok()?;
        receiver.await.ok()
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

pub struct DhtService {
    server: DhtServer,
    socket: UdpSocket,

    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,

    upload_throttle: Throttle,
    download_throttle: Throttle,

    cache_file: Option<String>,

    announces: HashMap<AnnounceTicket, (InfoHash, oneshot::Sender<AnnounceResult>)>,
    next_ticket: u64,
}

impl DhtService {
    /// Binds the DHT socket, restores the cached routing table and spawns
    /// the service task.
    ///
    /// # Errors
    ///
    /// Will return an error when the configured bind address is invalid or
    /// the socket cannot be bound.
    pub async fn start(config: &Dht, listen_port: u16) -> std::io::Result<(DhtHandle, JoinHandle<()>)> {
        let bind_address: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid dht bind address"))?;

        let socket = UdpSocket::bind(bind_address).await?;
        let now = CurrentClock::now();

        let cache_file = (!config.cache_file.is_empty()).then(|| config.cache_file.clone());

        let mut server = match &cache_file {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => DhtServer::from_cache(&bytes, listen_port, now).unwrap_or_else(|err| {
                    warn!(%path, %err, "ignoring unreadable dht cache");
                    DhtServer::new(generate_node_id(), listen_port, now)
                }),
                Err(_) => DhtServer::new(generate_node_id(), listen_port, now),
            },
            None => DhtServer::new(generate_node_id(), listen_port, now),
        };

        for contact in &config.bootstrap_nodes {
            if let Some((host, port)) = split_host_port(contact) {
                server.add_contact(host, port);
            } else {
                warn!(%contact, "ignoring malformed bootstrap node");
            }
        }

        let local_addr = socket.local_addr()?;
        info!(node_id = %server.routing().own_id(), addr = %local_addr, "dht service starting");

        let (command_sender, commands) = mpsc::unbounded_channel();

        let service = DhtService {
            server,
            socket,
            commands,
            command_sender: command_sender.clone(),
            upload_throttle: Throttle::new(config.rate_limit_up, now),
            download_throttle: Throttle::new(config.rate_limit_down, now),
            cache_file,
            announces: HashMap::new(),
            next_ticket: 0,
        };

        let join = tokio::spawn(service.run());

        Ok((
            DhtHandle {
                commands: command_sender,
                local_addr,
            },
            join,
        ))
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        let mut bootstrap = tokio::time::interval(BOOTSTRAP_PERIOD);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);

        // The first housekeeping is due in 15 minutes, not now.
        housekeeping.reset();

        let mut buffer = [0u8; 2048];

        loop {
            self.flush_outgoing().await;
            self.drain_events();

            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, SocketAddr::V4(from))) => {
                            let now = CurrentClock::now();
                            self.download_throttle.refill(now);

                            #[allow(clippy::cast_possible_truncation)]
                            if self.download_throttle.try_consume(len as u32) {
                                self.server.handle_packet(&buffer[..len], from, now);
                            }
                        }
                        // No IPv6 DHT; drop the datagram.
                        Ok((_, SocketAddr::V6(_))) => {}
                        Err(err) => {
                            debug!(%err, "dht socket read failed");
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.server.sweep_transactions(CurrentClock::now());
                }

                _ = bootstrap.tick() => {
                    let now = CurrentClock::now();
                    for (host, port) in self.server.bootstrap_round(now) {
                        self.resolve_and_contact(host, port);
                    }
                }

                _ = housekeeping.tick() => {
                    self.server.housekeeping(CurrentClock::now());
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        let now = CurrentClock::now();

        match command {
            Command::Announce { info_hash, reply } => {
                let ticket = AnnounceTicket(self.next_ticket);
                self.next_ticket += 1;

                self.announces.insert(ticket, (info_hash, reply));
                self.server.announce(info_hash, ticket, now);
            }
            Command::CancelAnnounce { info_hash } => {
                let tickets: Vec<AnnounceTicket> = self
                    .announces
                    .iter()
                    .filter(|(_, (hash, _))| *hash == info_hash)
                    .map(|(ticket, _)| *ticket)
                    .collect();

                for ticket in tickets {
                    self.server.cancel_announce(ticket);
                    self.announces.remove(&ticket);
                }
            }
            Command::AddNode { host, port } => {
                // Keep it as a bootstrap contact for later rounds, but also
                // reach out right away.
                if !self.server.is_bootstrapped() {
                    self.server.add_contact(host.clone(), port);
                }
                self.resolve_and_contact(host, port);
            }
            Command::ContactResolved { addr } => {
                self.server.contact(addr, now);
            }
            Command::StoreCache { reply } => {
                let _ = reply.send(self.server.store_cache());
            }
            Command::Stop => {}
        }
    }

    /// Resolves a hostname off-task and feeds the first IPv4 address back
    /// in as a command.
    fn resolve_and_contact(&self, host: String, port: u16) {
        let sender = self.command_sender.clone();

        tokio::spawn(async move {
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let v4 = addrs.into_iter().find_map(|addr| match addr {
                        SocketAddr::V4(addr) => Some(addr),
                        SocketAddr::V6(_) => None,
                    });

                    match v4 {
                        Some(addr) => {
                            let _ = sender.send(Command::ContactResolved { addr });
                        }
                        None => debug!(%host, "bootstrap contact has no IPv4 address"),
                    }
                }
                Err(err) => debug!(%host, %err, "bootstrap contact did not resolve"),
            }
        });
    }

    /// Sends queued packets while the upload throttle has quota; the rest
    /// stay queued for the next pass.
    async fn flush_outgoing(&mut self) {
        let now = CurrentClock::now();
        self.upload_throttle.refill(now);

        while let Some(len) = self.server.peek_packet_len(now) {
            #[allow(clippy::cast_possible_truncation)]
            if !self.upload_throttle.try_consume(len as u32) {
                return;
            }

            let Some(packet) = self.server.pop_packet(now) else {
                return;
            };

            if let Err(err) = self.socket.send_to(&packet.data, SocketAddr::V4(packet.addr)).await {
                debug!(addr = %packet.addr, %err, "dht datagram send failed");
                self.server.send_failed(&packet, now);
            }
        }
    }

    fn drain_events(&mut self) {
        for event in self.server.take_events() {
            match event {
                DhtEvent::AnnounceCompleted { ticket, result } => {
                    if let Some((_, reply)) = self.announces.remove(&ticket) {
                        let _ = reply.send(result.map_err(String::from));
                    }
                }
                DhtEvent::AnnounceProgress { ticket, replied, contacted } => {
                    debug!(?ticket, replied, contacted, "dht announce progress");
                }
            }
        }
    }

    async fn shutdown(mut self) {
        if let Some(path) = &self.cache_file {
            let cache = self.server.store_cache();

            if let Err(err) = tokio::fs::write(path, cache).await {
                warn!(%path, %err, "failed to persist dht cache");
            }
        }

        // Anyone still waiting learns that the service is gone.
        self.announces.clear();

        info!("dht service stopped");
    }
}

fn split_host_port(contact: &str) -> Option<(String, u16)> {
    let (host, port) = contact.rsplit_once(':')?;

    if host.is_empty() {
        return None;
    }

    port.parse().ok().map(|port| (host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::split_host_port;

    #[test]
    fn it_should_split_bootstrap_contacts() {
        assert_eq!(
            split_host_port("router.bittorrent.com:6881"),
            Some(("router.bittorrent.com".to_string(), 6881))
        );
        assert_eq!(split_host_port("10.0.0.1:6881"), Some(("10.0.0.1".to_string(), 6881)));
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port(":6881"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }
}
