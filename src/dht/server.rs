//! The DHT RPC endpoint: transaction table, send queues and the
//! query/response state machine.
//!
//! The server is sans-io: the driver task feeds it received datagrams via
//! [`DhtServer::handle_packet`], drains [`DhtServer::pop_packet`] under the
//! upload throttle, and calls the periodic entry points
//! ([`DhtServer::sweep_transactions`], [`DhtServer::bootstrap_round`],
//! [`DhtServer::housekeeping`]). Everything the outside world needs to
//! know comes back as [`DhtEvent`]s.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::Duration;

use rand::Rng;
use swarm_discovery_primitives::compact;
use swarm_discovery_primitives::info_hash::InfoHash;
use swarm_discovery_primitives::node_id::NodeId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;
use tracing::{debug, info, warn};

use super::bucket::BucketId;
use super::message::{self, DhtMessage, QueryArgs, ResponseValues};
use super::peer_store::{PeerStore, MAX_PEERS_PER_REPLY, REANNOUNCE_WINDOW};
use super::routing::{QueriedNode, RoutingTable};
use super::search::{DhtSearch, SearchId, SearchKind};
use super::token::TokenKeeper;
use super::transaction::{self, Transaction, TransactionKind};

/// Number of nodes at which the bootstrap process counts as complete.
pub const BOOTSTRAP_COMPLETE_NODES: usize = 32;

/// Maximum number of potential external contacts kept while bootstrapping.
pub const BOOTSTRAP_MAX_CONTACTS: usize = 64;

/// Contacts resolved and pinged per bootstrap round.
const BOOTSTRAP_CONTACTS_PER_ROUND: usize = 8;

/// Queued packets older than this are dropped instead of sent.
const PACKET_MAX_AGE: Duration = Duration::from_secs(15);

/// Nodes a `find_node`/`get_peers` reply hands out.
const CLOSEST_NODES_PER_REPLY: usize = super::bucket::BUCKET_NODES;

/// Correlation id the caller uses to match announce results to requests.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct AnnounceTicket(pub u64);

/// What a finished announce reports back.
#[derive(Debug, PartialEq, Eq)]
pub enum DhtEvent {
    AnnounceCompleted {
        ticket: AnnounceTicket,
        result: Result<Vec<SocketAddrV4>, &'static str>,
    },
    AnnounceProgress {
        ticket: AnnounceTicket,
        replied: u32,
        contacted: u32,
    },
}

/// Send priority. High priority packets carry announce queries and jump
/// the queue; replies wait behind all of our own queries.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum PacketPriority {
    High,
    Low,
    Reply,
}

#[derive(Debug)]
pub struct OutgoingPacket {
    pub addr: SocketAddrV4,
    pub data: Vec<u8>,

    transaction: Option<u64>,
    queued_at: DurationSinceUnixEpoch,
}

/// Counters exposed for diagnostics.
#[derive(Default, Debug, Clone, Copy)]
pub struct ServerStats {
    pub queries_received: u64,
    pub queries_sent: u64,
    pub replies_received: u64,
    pub errors_received: u64,
    pub errors_caught: u64,
}

struct DhtError {
    code: i64,
    message: &'static str,
}

impl DhtError {
    fn protocol(message: &'static str) -> DhtError {
        DhtError {
            code: message::ERROR_PROTOCOL,
            message,
        }
    }

    fn generic(message: &'static str) -> DhtError {
        DhtError {
            code: message::ERROR_GENERIC,
            message,
        }
    }

    fn bad_method(message: &'static str) -> DhtError {
        DhtError {
            code: message::ERROR_BAD_METHOD,
            message,
        }
    }
}

pub struct DhtServer {
    routing: RoutingTable,

    transactions: BTreeMap<u64, Transaction>,
    searches: HashMap<SearchId, DhtSearch>,
    announce_tickets: HashMap<SearchId, AnnounceTicket>,
    next_search: u64,

    tokens: TokenKeeper,
    peer_stores: HashMap<InfoHash, PeerStore>,

    /// Hostname and port of potential bootstrap nodes; `None` once the
    /// bootstrap process completed.
    contacts: Option<VecDeque<(String, u16)>>,

    /// Set by any valid incoming packet, cleared by the housekeeping.
    /// While clear, timeouts do not defame nodes: if the whole network is
    /// unreachable the fault is ours.
    network_up: bool,

    /// The port peers should announce to us on, sent in `announce_peer`.
    listen_port: u16,

    high_queue: VecDeque<OutgoingPacket>,
    reply_queue: VecDeque<OutgoingPacket>,

    events: Vec<DhtEvent>,
    stats: ServerStats,
}

impl DhtServer {
    #[must_use]
    pub fn new(own_id: NodeId, listen_port: u16, now: DurationSinceUnixEpoch) -> DhtServer {
        DhtServer {
            routing: RoutingTable::new(own_id, now),
            transactions: BTreeMap::new(),
            searches: HashMap::new(),
            announce_tickets: HashMap::new(),
            next_search: 0,
            tokens: TokenKeeper::new(&mut rand::thread_rng()),
            peer_stores: HashMap::new(),
            contacts: Some(VecDeque::new()),
            network_up: false,
            listen_port,
            high_queue: VecDeque::new(),
            reply_queue: VecDeque::new(),
            events: Vec::new(),
            stats: ServerStats::default(),
        }
    }

    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    #[must_use]
    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    #[must_use]
    pub fn num_transactions(&self) -> usize {
        self.transactions.len()
    }

    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.contacts.is_none()
    }

    #[must_use]
    pub fn tracked_torrents(&self) -> usize {
        self.peer_stores.len()
    }

    pub fn take_events(&mut self) -> Vec<DhtEvent> {
        std::mem::take(&mut self.events)
    }

    /// Remembers an external `host:port` contact for bootstrapping. Once
    /// the table is bootstrapped new contacts are not needed.
    pub fn add_contact(&mut self, host: String, port: u16) {
        if let Some(contacts) = &mut self.contacts {
            if contacts.len() >= BOOTSTRAP_MAX_CONTACTS {
                contacts.pop_front();
            }

            contacts.push_back((host, port));
        }
    }

    /// Pings a resolved contact to learn its node id.
    pub fn contact(&mut self, addr: SocketAddrV4, now: DurationSinceUnixEpoch) {
        self.ping(NodeId::ZERO, addr, now);
    }

    /// Pings a node unless we are already talking to its address.
    pub fn ping(&mut self, node_id: NodeId, addr: SocketAddrV4, now: DurationSinceUnixEpoch) {
        let probe = transaction::key(&addr, 0);
        let already_contacting = self
            .transactions
            .range(probe..)
            .next()
            .is_some_and(|(key, _)| transaction::key_matches_addr(*key, &addr));

        if !already_contacting {
            self.add_transaction(TransactionKind::Ping, node_id, addr, PacketPriority::Low, now);
        }
    }

    /// Starts a `find_node` search to refresh the neighborhood of
    /// `target`.
    pub fn start_refresh(&mut self, target: NodeId, now: DurationSinceUnixEpoch) {
        let search_id = self.new_search(target, SearchKind::Refresh);
        self.search_step(search_id, now);

        if !self.searches.get_mut(&search_id).expect("search was just created").start() {
            // Not a single contactable node; forget the search.
            self.searches.remove(&search_id);
        }
    }

    /// Starts a peer search for the infohash that ends by announcing our
    /// listen port to the closest good nodes.
    pub fn announce(&mut self, info_hash: InfoHash, ticket: AnnounceTicket, now: DurationSinceUnixEpoch) {
        let search_id = self.new_search(
            NodeId::from(info_hash),
            SearchKind::Announce {
                peers: Vec::new(),
                announcing: false,
            },
        );
        self.announce_tickets.insert(search_id, ticket);

        info!(info_hash = %info_hash, "dht announce started");

        self.search_step(search_id, now);

        if !self.searches.get_mut(&search_id).expect("search was just created").start() {
            self.remove_search(search_id);
            self.events.push(DhtEvent::AnnounceCompleted {
                ticket,
                result: Err("No DHT nodes available for peer search."),
            });
        }
    }

    /// Cancels the announce without delivering a result. Its search and
    /// outstanding transactions disappear.
    pub fn cancel_announce(&mut self, ticket: AnnounceTicket) {
        let ids: Vec<SearchId> = self
            .announce_tickets
            .iter()
            .filter(|(_, t)| **t == ticket)
            .map(|(id, _)| *id)
            .collect();

        for search_id in ids {
            self.transactions.retain(|_, tx| tx.search() != Some(search_id));
            self.remove_search(search_id);
        }
    }

    fn new_search(&mut self, target: NodeId, kind: SearchKind) -> SearchId {
        let search_id = SearchId(self.next_search);
        self.next_search += 1;

        let mut search = DhtSearch::new(target, kind);

        let own_id = self.routing.own_id();
        let chain_nodes = self.chain_nodes(&target);
        search.seed(chain_nodes.into_iter().filter(|(id, _, _)| *id != own_id));

        self.searches.insert(search_id, search);
        search_id
    }

    /// All nodes along the bucket chain for `target`, with their quality.
    fn chain_nodes(&self, target: &NodeId) -> Vec<(NodeId, SocketAddrV4, super::node::NodeQuality)> {
        let mut found = Vec::new();
        let mut chain = super::routing::BucketChain::new(&self.routing, self.routing.find_bucket(target));

        loop {
            for id in self.routing.bucket(chain.current()).members() {
                let node = self.routing.node(id).expect("bucket member must exist");
                found.push((*id, node.addr(), node.quality()));
            }

            if chain.next().is_none() {
                return found;
            }
        }
    }

    /// Issues queries for a search until its concurrency limit is reached,
    /// and switches announces into their second phase when the lookup has
    /// settled.
    fn search_step(&mut self, search_id: SearchId, now: DurationSinceUnixEpoch) {
        let Some(search) = self.searches.get_mut(&search_id) else {
            return;
        };

        let priority = if search.is_announce() {
            PacketPriority::High
        } else {
            PacketPriority::Low
        };

        let mut contacts = Vec::new();
        while let Some(contact) = self.searches.get_mut(&search_id).expect("checked above").get_contact() {
            contacts.push(contact);
        }

        for (node_id, addr) in contacts {
            self.add_transaction(TransactionKind::FindNode { search: search_id }, node_id, addr, priority, now);
        }

        let search = self.searches.get_mut(&search_id).expect("checked above");

        if search.is_announce() && !search.is_announcing() && search.is_complete() {
            // The lookup settled on the closest nodes; retrieve peers from
            // them and announce to them.
            let final_contacts = search.start_announce();

            for (node_id, addr) in final_contacts {
                self.searches
                    .get_mut(&search_id)
                    .expect("checked above")
                    .increase_concurrency();

                let transaction_key =
                    self.add_transaction(TransactionKind::GetPeers { search: search_id }, node_id, addr, PacketPriority::High, now);

                if let Some(key) = transaction_key {
                    self.transactions.get_mut(&key).expect("transaction was just added").boosted_concurrency = true;
                } else {
                    // The query could not be issued; undo its booking.
                    let search = self.searches.get_mut(&search_id).expect("checked above");
                    search.decrease_concurrency();
                    search.node_status(&node_id, false);
                }
            }
        }

        self.push_progress(search_id);
    }

    fn push_progress(&mut self, search_id: SearchId) {
        if let (Some(search), Some(ticket)) = (self.searches.get(&search_id), self.announce_tickets.get(&search_id)) {
            self.events.push(DhtEvent::AnnounceProgress {
                ticket: *ticket,
                replied: search.num_replied(),
                contacted: search.num_contacted(),
            });
        }
    }

    /// Books the outcome of a search transaction and, when that was the
    /// last open question, finalizes the search.
    fn retire_search_transaction(&mut self, tx: &Transaction, success: bool, continue_search: bool, now: DurationSinceUnixEpoch) {
        let Some(search_id) = tx.search() else {
            return;
        };

        let Some(search) = self.searches.get_mut(&search_id) else {
            return;
        };

        search.node_status(&tx.node_id, success);
        if tx.boosted_concurrency {
            search.decrease_concurrency();
        }

        if continue_search {
            self.search_step(search_id, now);
        }

        if self.searches.get(&search_id).is_some_and(DhtSearch::is_complete) {
            self.finalize_search(search_id);
        }
    }

    /// Delivers an announce's verdict and drops the search.
    fn finalize_search(&mut self, search_id: SearchId) {
        let Some(search) = self.searches.get(&search_id) else {
            return;
        };

        if let Some(ticket) = self.announce_tickets.get(&search_id).copied() {
            let result = if !search.is_announcing() {
                if search.num_contacted() == 0 {
                    Err("No DHT nodes available for peer search.")
                } else {
                    Err("DHT search unsuccessful.")
                }
            } else if search.num_replied() == 0 && search.peers().is_empty() {
                Err("Announce failed")
            } else {
                Ok(search.peers().to_vec())
            };

            match &result {
                Ok(peers) => info!(peers = peers.len(), "dht announce finished"),
                Err(reason) => info!(%reason, "dht announce failed"),
            }

            self.events.push(DhtEvent::AnnounceCompleted { ticket, result });
        }

        self.remove_search(search_id);
    }

    fn remove_search(&mut self, search_id: SearchId) {
        self.searches.remove(&search_id);
        self.announce_tickets.remove(&search_id);
    }

    /// Picks a random unused transaction id for the address by linear
    /// probing from a random start, builds the query packet and queues it.
    fn add_transaction(
        &mut self,
        kind: TransactionKind,
        node_id: NodeId,
        addr: SocketAddrV4,
        priority: PacketPriority,
        now: DurationSinceUnixEpoch,
    ) -> Option<u64> {
        assert!(node_id != self.routing.own_id(), "trying to query ourselves");

        let start: u8 = rand::thread_rng().gen();
        let mut chosen = None;

        for offset in 0..=u8::MAX {
            let id = start.wrapping_add(offset);
            if !self.transactions.contains_key(&transaction::key(&addr, id)) {
                chosen = Some(id);
                break;
            }
        }

        let Some(id) = chosen else {
            // 256 live transactions to one address cannot happen without a
            // scheduling bug.
            debug_assert!(false, "transaction id space exhausted for {addr}");
            warn!(%addr, "transaction id space exhausted, dropping query");
            return None;
        };

        let args = match &kind {
            TransactionKind::Ping => QueryArgs::Ping,
            TransactionKind::FindNode { search } => QueryArgs::FindNode {
                target: self.searches[search].target(),
            },
            TransactionKind::GetPeers { search } => QueryArgs::GetPeers {
                info_hash: InfoHash(self.searches[search].target().0),
            },
            TransactionKind::AnnouncePeer { info_hash, token } => QueryArgs::AnnouncePeer {
                info_hash: *info_hash,
                token,
                port: self.listen_port,
            },
        };

        let data = message::build_query(id, &self.routing.own_id(), &args);

        let key = transaction::key(&addr, id);
        let mut transaction = Transaction::new(kind, node_id, addr, now);
        transaction.has_packet = true;

        self.transactions.insert(key, transaction);
        self.enqueue(
            OutgoingPacket {
                addr,
                data,
                transaction: Some(key),
                queued_at: now,
            },
            priority,
        );

        self.stats.queries_sent += 1;

        Some(key)
    }

    fn enqueue(&mut self, packet: OutgoingPacket, priority: PacketPriority) {
        match priority {
            PacketPriority::High => self.high_queue.push_front(packet),
            PacketPriority::Low => self.high_queue.push_back(packet),
            PacketPriority::Reply => self.reply_queue.push_back(packet),
        }
    }

    /// Length of the next packet to send, dropping stale and orphaned
    /// packets first. `None` when nothing is ready.
    pub fn peek_packet_len(&mut self, now: DurationSinceUnixEpoch) -> Option<usize> {
        for queue in [&mut self.high_queue, &mut self.reply_queue] {
            while let Some(head) = queue.front() {
                let orphaned = head.transaction.is_some_and(|key| !self.transactions.contains_key(&key));

                if orphaned || now.saturating_sub(head.queued_at) > PACKET_MAX_AGE {
                    queue.pop_front();
                    continue;
                }

                return Some(head.data.len());
            }
        }

        None
    }

    /// Takes the packet whose length [`Self::peek_packet_len`] reported.
    pub fn pop_packet(&mut self, now: DurationSinceUnixEpoch) -> Option<OutgoingPacket> {
        self.peek_packet_len(now)?;

        let packet = if self.high_queue.front().is_some() {
            self.high_queue.pop_front()
        } else {
            self.reply_queue.pop_front()
        }?;

        if let Some(key) = packet.transaction {
            if let Some(transaction) = self.transactions.get_mut(&key) {
                transaction.has_packet = false;
            }
        }

        Some(packet)
    }

    /// The datagram could not be written; the node's address is broken, so
    /// its transaction fails immediately.
    pub fn send_failed(&mut self, packet: &OutgoingPacket, now: DurationSinceUnixEpoch) {
        if let Some(key) = packet.transaction {
            self.fail_transaction(key, now);
        }
    }

    /// Processes one received datagram.
    pub fn handle_packet(&mut self, bytes: &[u8], from: SocketAddrV4, now: DurationSinceUnixEpoch) {
        // If it's not a bencode dictionary at all it's probably not DHT
        // traffic; stay silent to avoid bounce loops.
        let Ok(message) = DhtMessage::read(bytes) else {
            return;
        };

        let message_type = message.message_type();
        let node_id = message.node_id();

        match self.dispatch(&message, node_id, from, now) {
            Ok(()) => {}
            Err(error) => {
                self.stats.errors_caught += 1;

                // A node sending us a malformed or invalid reply gets a
                // missed-reply strike instead of an answer; queries get the
                // error response.
                if matches!(message_type, Some(b'r' | b'e')) {
                    if let Some(id) = node_id {
                        self.routing.node_inactive(&id, from, now);
                    }
                } else {
                    debug!(%from, code = error.code, message = error.message, "rejecting dht query");
                    let packet = message::build_error(message.transaction(), error.code, error.message);
                    self.enqueue(
                        OutgoingPacket {
                            addr: from,
                            data: packet,
                            transaction: None,
                            queued_at: now,
                        },
                        PacketPriority::Reply,
                    );
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        message: &DhtMessage<'_>,
        node_id: Option<NodeId>,
        from: SocketAddrV4,
        now: DurationSinceUnixEpoch,
    ) -> Result<(), DhtError> {
        let transaction = message.transaction().ok_or(DhtError::protocol("No transaction ID"))?;
        let message_type = message.message_type().ok_or(DhtError::protocol("No message type"))?;

        // Queries and replies carry the node id in different dictionaries.
        if matches!(message_type, b'q' | b'r') {
            let id = node_id.ok_or(DhtError::protocol("Invalid `id' value"))?;

            // Stupid broken implementations.
            if id == self.routing.own_id() {
                return Err(DhtError::protocol("Send your own ID, not mine"));
            }
        }

        if matches!(message_type, b'r' | b'e') && transaction.len() != 1 {
            return Err(DhtError::protocol("Invalid transaction ID length"));
        }

        match message_type {
            b'q' => self.process_query(message, node_id.expect("checked above"), from, now),
            b'r' => {
                self.process_response(message, node_id.expect("checked above"), transaction[0], from, now);
                Ok(())
            }
            b'e' => {
                self.process_error(transaction[0], from, now);
                Ok(())
            }
            _ => Err(DhtError::bad_method("Unknown message type.")),
        }
    }

    fn process_query(
        &mut self,
        message: &DhtMessage<'_>,
        node_id: NodeId,
        from: SocketAddrV4,
        now: DurationSinceUnixEpoch,
    ) -> Result<(), DhtError> {
        self.stats.queries_received += 1;
        self.network_up = true;

        let method = message.query_method().ok_or(DhtError::protocol("No query method"))?;

        let payload = match method {
            b"ping" => ResponseValues::default(),
            b"find_node" => self.answer_find_node(message)?,
            b"get_peers" => self.answer_get_peers(message, from)?,
            b"announce_peer" => self.answer_announce_peer(message, from, now)?,
            _ => return Err(DhtError::bad_method("Unknown query type.")),
        };

        if self.routing.node_queried(&node_id, from, now) == QueriedNode::WantedPing {
            self.ping(node_id, from, now);
        }

        let reply = message::build_response(
            message.transaction().expect("transaction checked by dispatch"),
            &self.routing.own_id(),
            payload,
        );

        self.enqueue(
            OutgoingPacket {
                addr: from,
                data: reply,
                transaction: None,
                queued_at: now,
            },
            PacketPriority::Reply,
        );

        Ok(())
    }

    fn answer_find_node(&mut self, message: &DhtMessage<'_>) -> Result<ResponseValues, DhtError> {
        let target = message.target().ok_or(DhtError::protocol("target string too short"))?;

        let nodes = self.encode_closest_nodes(&target);

        if nodes.is_empty() {
            return Err(DhtError::generic("No nodes"));
        }

        Ok(ResponseValues {
            nodes: Some(nodes),
            ..ResponseValues::default()
        })
    }

    fn answer_get_peers(&mut self, message: &DhtMessage<'_>, from: SocketAddrV4) -> Result<ResponseValues, DhtError> {
        let info_hash = message.info_hash().ok_or(DhtError::protocol("info hash too short"))?;

        let token = self.tokens.make_token(&from).to_vec();

        // If we track peers for the torrent, hand them out; closest nodes
        // otherwise.
        let known_peers = self
            .peer_stores
            .get(&info_hash)
            .filter(|store| !store.is_empty())
            .map(|store| store.get_peers(MAX_PEERS_PER_REPLY, &mut rand::thread_rng()));

        match known_peers {
            Some(peers) => Ok(ResponseValues {
                token: Some(token),
                values: Some(peers),
                ..ResponseValues::default()
            }),
            None => {
                let nodes = self.encode_closest_nodes(&NodeId::from(info_hash));

                if nodes.is_empty() {
                    return Err(DhtError::generic("No peers nor nodes"));
                }

                Ok(ResponseValues {
                    token: Some(token),
                    nodes: Some(nodes),
                    ..ResponseValues::default()
                })
            }
        }
    }

    fn answer_announce_peer(
        &mut self,
        message: &DhtMessage<'_>,
        from: SocketAddrV4,
        now: DurationSinceUnixEpoch,
    ) -> Result<ResponseValues, DhtError> {
        let info_hash = message.info_hash().ok_or(DhtError::protocol("info hash too short"))?;
        let token = message.token().ok_or(DhtError::protocol("Token invalid."))?;

        if !self.tokens.token_valid(token, &from) {
            return Err(DhtError::protocol("Token invalid."));
        }

        let port = message.port().ok_or(DhtError::protocol("port missing"))?;

        self.peer_stores
            .entry(info_hash)
            .or_default()
            .add_peer(SocketAddrV4::new(*from.ip(), port), now);

        Ok(ResponseValues::default())
    }

    fn encode_closest_nodes(&self, target: &NodeId) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(CLOSEST_NODES_PER_REPLY * compact::COMPACT_NODE_INFO_LEN);

        for info in self.routing.closest_nodes(target, CLOSEST_NODES_PER_REPLY) {
            buffer.extend_from_slice(&compact::encode_node_info(&info));
        }

        buffer
    }

    fn process_response(
        &mut self,
        message: &DhtMessage<'_>,
        node_id: NodeId,
        transaction_id: u8,
        from: SocketAddrV4,
        now: DurationSinceUnixEpoch,
    ) {
        let key = transaction::key(&from, transaction_id);

        // A response to a transaction we don't have. It may have timed out
        // already, or someone is guessing ids; the protocol has no way to
        // answer errors to responses, so ignore it.
        let Some(transaction) = self.transactions.get(&key) else {
            return;
        };

        self.stats.replies_received += 1;
        self.network_up = true;

        // A reply from a node id we did not query means interference from
        // a rogue node; leave the transaction open for the real answer.
        if node_id != transaction.node_id && !transaction.node_id.is_zero() {
            return;
        }

        let transaction = self.transactions.remove(&key).expect("presence checked above");

        match &transaction.kind {
            TransactionKind::FindNode { search } => {
                // Feed the reply's contacts to the search before booking
                // the transaction, so the next round sees them.
                if let Some(nodes) = message.nodes() {
                    let own_id = self.routing.own_id();

                    if let Some(search) = self.searches.get_mut(search) {
                        for info in compact::decode_node_info(nodes) {
                            if info.id != own_id && !info.id.is_zero() {
                                search.add_contact(info.id, info.addr);
                            }
                        }
                    }
                }

                self.retire_search_transaction(&transaction, true, true, now);
            }
            TransactionKind::GetPeers { search } => {
                let search_id = *search;

                if let Some(target) = self.searches.get(&search_id).map(DhtSearch::target) {
                    if let Some(values) = message.values() {
                        self.searches
                            .get_mut(&search_id)
                            .expect("search presence checked above")
                            .add_peers(&values);
                    }

                    // Every responder that handed out a token receives our
                    // announce.
                    if let Some(token) = message.reply_token() {
                        self.add_transaction(
                            TransactionKind::AnnouncePeer {
                                info_hash: InfoHash(target.0),
                                token: token.to_vec(),
                            },
                            transaction.node_id,
                            transaction.addr,
                            PacketPriority::Low,
                            now,
                        );
                    }
                }

                self.retire_search_transaction(&transaction, true, false, now);
            }
            TransactionKind::Ping | TransactionKind::AnnouncePeer { .. } => {}
        }

        // Mark the node responsive only now that processing succeeded.
        self.routing.node_replied(&node_id, from, now);

        // A reply may have grown the table past a split; freshly emptied
        // buckets want a refresh.
        self.refresh_pending_buckets(now);
    }

    fn process_error(&mut self, transaction_id: u8, from: SocketAddrV4, now: DurationSinceUnixEpoch) {
        let key = transaction::key(&from, transaction_id);

        let Some(transaction) = self.transactions.remove(&key) else {
            return;
        };

        self.stats.replies_received += 1;
        self.stats.errors_received += 1;
        self.network_up = true;

        // Don't mark the node good (it replied) or bad (it errored); a few
        // error messages are acceptable, so pretend the query never
        // happened. The search, if any, still has to book the contact.
        self.retire_search_transaction(&transaction, false, false, now);
    }

    /// Fails transactions past their deadlines. Driven every few seconds
    /// while transactions are outstanding.
    pub fn sweep_transactions(&mut self, now: DurationSinceUnixEpoch) {
        // Quick timeouts: the transaction stays open but its search may
        // issue another query in its place.
        let stalled: Vec<u64> = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.quick_timeout.is_some_and(|deadline| deadline < now))
            .map(|(key, _)| *key)
            .collect();

        for key in stalled {
            let search_id = {
                let transaction = self.transactions.get_mut(&key).expect("key was just listed");
                transaction.set_stalled();
                transaction.search()
            };

            if let Some(search_id) = search_id {
                if let Some(search) = self.searches.get_mut(&search_id) {
                    search.increase_concurrency();
                }
                self.search_step(search_id, now);
            }
        }

        // Full timeouts: the transaction failed.
        let failed: Vec<u64> = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.timeout < now)
            .map(|(key, _)| *key)
            .collect();

        for key in failed {
            self.fail_transaction(key, now);
        }
    }

    fn fail_transaction(&mut self, key: u64, now: DurationSinceUnixEpoch) {
        let Some(transaction) = self.transactions.remove(&key) else {
            return;
        };

        // Blame the node only if the packet actually went out and the
        // network as a whole is alive.
        if self.network_up && !transaction.has_packet && !transaction.node_id.is_zero() {
            self.routing.node_inactive(&transaction.node_id, transaction.addr, now);
        }

        self.retire_search_transaction(&transaction, false, true, now);
    }

    /// One bootstrap round, run every minute until the table holds enough
    /// nodes. Returns external contacts for the driver to resolve and feed
    /// back via [`DhtServer::contact`].
    pub fn bootstrap_round(&mut self, now: DurationSinceUnixEpoch) -> Vec<(String, u16)> {
        if self.routing.num_nodes() >= BOOTSTRAP_COMPLETE_NODES {
            if self.contacts.take().is_some() {
                info!(nodes = self.routing.num_nodes(), "dht bootstrap complete");
            }
            return Vec::new();
        }

        let Some(contacts) = &mut self.contacts else {
            return Vec::new();
        };

        // Newest contacts first.
        let take = contacts.len().min(BOOTSTRAP_CONTACTS_PER_ROUND);
        let to_resolve: Vec<(String, u16)> = (0..take).filter_map(|_| contacts.pop_back()).collect();

        if self.routing.num_nodes() == 0 {
            return to_resolve;
        }

        // Search for our own neighborhood and aggressively weed out the
        // questionable nodes of our own bucket.
        self.bootstrap_bucket(self.routing.own_bucket(), now);

        let own_bucket_pings: Vec<(NodeId, SocketAddrV4)> = self
            .routing
            .bucket(self.routing.own_bucket())
            .members()
            .iter()
            .filter_map(|id| {
                let node = self.routing.node(id).expect("bucket member must exist");
                (!node.is_good()).then(|| (*id, node.addr()))
            })
            .collect();

        for (id, addr) in own_bucket_pings {
            self.ping(id, addr, now);
        }

        // Also refresh one other random bucket, if there are others.
        if self.routing.num_buckets() > 1 {
            let index = rand::thread_rng().gen_range(0..self.routing.num_buckets());
            let bucket = BucketId(index);

            if bucket != self.routing.own_bucket() {
                self.bootstrap_bucket(bucket, now);
            }
        }

        to_resolve
    }

    /// Searches for a random id in the bucket's range, or for an id next
    /// to our own for our own bucket. We don't search for our exact id:
    /// nodes that already know us would return just our record instead of
    /// their closest nodes.
    fn bootstrap_bucket(&mut self, bucket: BucketId, now: DurationSinceUnixEpoch) {
        let target = if bucket == self.routing.own_bucket() {
            let mut target = self.routing.own_id();
            target.0[19] ^= 1;
            target
        } else {
            self.routing.bucket(bucket).random_id(&mut rand::thread_rng())
        };

        self.start_refresh(target, now);
    }

    /// 15 minute housekeeping: rotates the announce token secret,
    /// refreshes node quality and idle buckets, prunes stale peers and
    /// resets the network-up detector.
    pub fn housekeeping(&mut self, now: DurationSinceUnixEpoch) {
        self.tokens.rotate(&mut rand::thread_rng());

        let work = self.routing.housekeeping(now);

        for (id, addr) in work.pings {
            self.ping(id, addr, now);
        }

        for bucket in work.bootstrap_buckets {
            self.bootstrap_bucket(bucket, now);
        }

        for store in self.peer_stores.values_mut() {
            store.prune(REANNOUNCE_WINDOW, now);
        }
        self.peer_stores.retain(|_, store| !store.is_empty());

        // Reset every period; any valid packet sets it back. This detects
        // the whole network going down and stops us from removing all
        // nodes as unresponsive.
        self.network_up = false;
    }

    /// Fresh buckets created by splits want a refresh search.
    pub fn refresh_pending_buckets(&mut self, now: DurationSinceUnixEpoch) {
        for bucket in self.routing.take_pending_bootstrap() {
            self.bootstrap_bucket(bucket, now);
        }
    }

    #[must_use]
    pub fn make_token(&self, addr: &SocketAddrV4) -> Vec<u8> {
        self.tokens.make_token(addr).to_vec()
    }

    #[must_use]
    pub fn token_valid(&self, token: &[u8], addr: &SocketAddrV4) -> bool {
        self.tokens.token_valid(token, addr)
    }

    #[must_use]
    pub fn peer_store(&self, info_hash: &InfoHash) -> Option<&PeerStore> {
        self.peer_stores.get(info_hash)
    }

    /// Serializes the routing table (plus unresolved bootstrap contacts)
    /// for the next run.
    #[must_use]
    pub fn store_cache(&self) -> Vec<u8> {
        let contacts: Option<Vec<(String, u16)>> = self.contacts.as_ref().map(|c| c.iter().cloned().collect());

        super::cache::encode_cache(&self.routing, contacts.as_deref())
    }

    /// Builds a server from a persisted cache, generating a fresh node id
    /// when the cache does not carry one.
    ///
    /// # Errors
    ///
    /// Will return an error when the cache bytes are malformed.
    pub fn from_cache(
        bytes: &[u8],
        listen_port: u16,
        now: DurationSinceUnixEpoch,
    ) -> Result<DhtServer, super::cache::CacheError> {
        let loaded = super::cache::decode_cache(bytes)?;

        let own_id = loaded.self_id.unwrap_or_else(generate_node_id);
        let mut server = DhtServer::new(own_id, listen_port, now);

        for (id, addr, last_seen) in loaded.nodes {
            server.routing.add_cached_node(id, addr, last_seen, now);
        }

        for (host, port) in loaded.contacts {
            server.add_contact(host, port);
        }

        // With enough cached nodes there is nothing left to bootstrap.
        if server.routing.num_nodes() >= BOOTSTRAP_COMPLETE_NODES {
            server.contacts = None;
        }

        Ok(server)
    }
}

/// A fresh node id: the SHA-1 of locally gathered entropy, so the id is
/// uniformly spread over the id space.
#[must_use]
pub fn generate_node_id() -> NodeId {
    use sha1::{Digest, Sha1};

    let seed: [u8; 32] = rand::thread_rng().gen();

    let digest = Sha1::digest(seed);
    NodeId::try_from(digest.as_slice()).expect("SHA-1 digests are 20 bytes")
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use swarm_discovery_primitives::info_hash::InfoHash;
    use swarm_discovery_primitives::node_id::NodeId;

    use super::{AnnounceTicket, DhtEvent, DhtServer};
    use crate::dht::message::{self, DhtMessage, QueryArgs, ResponseValues};

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

    fn server() -> DhtServer {
        DhtServer::new(id(0x10), 6881, at(T0))
    }

    /// Shuttles queued packets between two servers until both go quiet.
    /// Packets addressed to anyone else are dropped on the floor.
    fn exchange(
        a: &mut DhtServer,
        a_addr: SocketAddrV4,
        b: &mut DhtServer,
        b_addr: SocketAddrV4,
        now: Duration,
    ) {
        loop {
            let mut moved = false;

            while let Some(packet) = a.pop_packet(now) {
                if packet.addr == b_addr {
                    b.handle_packet(&packet.data, a_addr, now);
                }
                moved = true;
            }

            while let Some(packet) = b.pop_packet(now) {
                if packet.addr == a_addr {
                    a.handle_packet(&packet.data, b_addr, now);
                }
                moved = true;
            }

            if !moved {
                return;
            }
        }
    }

    #[test]
    fn it_should_answer_a_ping_with_its_own_id() {
        let mut server = server();

        let ping = message::build_query(7, &id(0xAA), &QueryArgs::Ping);
        server.handle_packet(&ping, addr(1), at(T0));

        let reply = server.pop_packet(at(T0)).expect("a reply should be queued");
        assert_eq!(reply.addr, addr(1));

        let parsed = DhtMessage::read(&reply.data).unwrap();
        assert_eq!(parsed.message_type(), Some(b'r'));
        assert_eq!(parsed.node_id(), Some(id(0x10)));
        assert_eq!(parsed.transaction(), Some(&[7][..]));
    }

    #[test]
    fn it_should_reject_find_node_on_an_empty_table_with_a_generic_error() {
        let mut server = server();

        let query = message::build_query(1, &id(0xAA), &QueryArgs::FindNode { target: id(0x55) });
        server.handle_packet(&query, addr(1), at(T0));

        let mut saw_error = false;
        while let Some(packet) = server.pop_packet(at(T0)) {
            let parsed = DhtMessage::read(&packet.data).unwrap();
            if parsed.message_type() == Some(b'e') {
                saw_error = true;
                assert!(packet.data.windows(5).any(|w| w == b"i201e"));
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn it_should_answer_find_node_with_compact_node_info() {
        let mut server = server();
        server.routing_mut().add_node(id(0x55), addr(5), at(T0));

        let query = message::build_query(1, &id(0xAA), &QueryArgs::FindNode { target: id(0x55) });
        server.handle_packet(&query, addr(1), at(T0));

        let mut nodes = None;
        while let Some(packet) = server.pop_packet(at(T0)) {
            let parsed = DhtMessage::read(&packet.data).unwrap();
            if parsed.message_type() == Some(b'r') {
                nodes = parsed.nodes().map(<[u8]>::to_vec);
            }
        }

        let nodes = nodes.expect("the reply should carry nodes");
        assert_eq!(nodes.len(), 26);
        assert_eq!(&nodes[..20], &id(0x55).0);
    }

    #[test]
    fn it_should_reject_an_announce_with_an_invalid_token() {
        let mut server = server();

        let query = message::build_query(
            3,
            &id(0xAA),
            &QueryArgs::AnnouncePeer {
                info_hash: InfoHash([1; 20]),
                token: b"bogus tk",
                port: 7000,
            },
        );
        server.handle_packet(&query, addr(1), at(T0));

        let mut saw_protocol_error = false;
        while let Some(packet) = server.pop_packet(at(T0)) {
            if packet.data.windows(5).any(|w| w == b"i203e") {
                saw_protocol_error = true;
                assert!(packet.data.windows(14).any(|w| w == b"Token invalid."));
            }
        }
        assert!(saw_protocol_error);
        assert_eq!(server.tracked_torrents(), 0);
    }

    #[test]
    fn it_should_store_a_peer_for_a_valid_announce() {
        let mut server = server();
        let info_hash = InfoHash([1; 20]);

        let token = server.make_token(&addr(1));
        let query = message::build_query(
            3,
            &id(0xAA),
            &QueryArgs::AnnouncePeer {
                info_hash,
                token: &token,
                port: 7000,
            },
        );
        server.handle_packet(&query, addr(1), at(T0));

        let store = server.peer_store(&info_hash).expect("the torrent should be tracked");
        assert_eq!(store.len(), 1);

        // The stored peer is the sender's IP with the announced port.
        let peers = store.get_peers(32, &mut rand::thread_rng());
        assert_eq!(peers, vec![SocketAddrV4::new(*addr(1).ip(), 7000)]);
    }

    #[test]
    fn it_should_silently_drop_non_bencode_noise() {
        let mut server = server();

        server.handle_packet(b"\x00\x01\x02 definitely not bencode", addr(1), at(T0));

        assert!(server.pop_packet(at(T0)).is_none());
    }

    #[test]
    fn it_should_learn_a_node_from_a_bootstrap_contact() {
        let mut server = server();
        server.add_contact("router.example.com".to_string(), 6881);

        let to_resolve = server.bootstrap_round(at(T0));
        assert_eq!(to_resolve, vec![("router.example.com".to_string(), 6881)]);

        // The driver resolved the contact; we ping it without knowing its
        // id.
        server.contact(addr(9), at(T0));
        let ping = server.pop_packet(at(T0)).expect("a ping should be queued");
        let transaction = DhtMessage::read(&ping.data).unwrap().transaction().unwrap().to_vec();

        // The contact answers, identifying itself.
        let reply = message::build_response(&transaction, &id(0x99), ResponseValues::default());
        server.handle_packet(&reply, addr(9), at(T0 + 1));

        assert_eq!(server.routing().num_nodes(), 1);
        assert!(server.routing().node(&id(0x99)).unwrap().is_good());
    }

    #[test]
    fn it_should_clean_up_timed_out_transactions() {
        let mut server = server();

        server.ping(id(0x99), addr(9), at(T0));
        assert_eq!(server.num_transactions(), 1);

        // Flush the packet so the node is blameable, and mark the network
        // alive.
        let _ = server.pop_packet(at(T0));

        server.sweep_transactions(at(T0 + 31));

        assert_eq!(server.num_transactions(), 0);
    }

    #[test]
    fn it_should_not_ping_an_address_it_is_already_talking_to() {
        let mut server = server();

        server.ping(id(0x99), addr(9), at(T0));
        server.ping(id(0x99), addr(9), at(T0));

        assert_eq!(server.num_transactions(), 1);
    }

    #[test]
    fn it_should_fail_an_announce_without_any_usable_nodes() {
        let mut server = server();

        server.announce(InfoHash([7; 20]), AnnounceTicket(1), at(T0));

        let events = server.take_events();
        assert!(events.contains(&DhtEvent::AnnounceCompleted {
            ticket: AnnounceTicket(1),
            result: Err("No DHT nodes available for peer search."),
        }));
    }

    #[test]
    fn it_should_run_a_full_announce_against_another_server() {
        let info_hash = InfoHash([0x77; 20]);

        let a_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        let b_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6882);

        let mut a = DhtServer::new(id(0x10), 6881, at(T0));
        let mut b = DhtServer::new(id(0x80), 6882, at(T0));

        // A knows B; B knows a third node that will never answer.
        a.routing_mut().add_node(id(0x80), b_addr, at(T0));
        b.routing_mut().add_node(id(0x70), addr(9), at(T0));

        // B already tracks one peer for the torrent, announced by someone
        // else with a valid token.
        let peer_x = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), 7003);
        let token = b.make_token(&peer_x);
        let announce_x = message::build_query(
            1,
            &id(0xEE),
            &QueryArgs::AnnouncePeer {
                info_hash,
                token: &token,
                port: 7003,
            },
        );
        b.handle_packet(&announce_x, peer_x, at(T0));
        while b.pop_packet(at(T0)).is_some() {}

        // Phase 1: the lookup. A queries B, learns about the third node,
        // and queries it in vain.
        a.announce(info_hash, AnnounceTicket(42), at(T0));
        exchange(&mut a, a_addr, &mut b, b_addr, at(T0));

        // Phase 2: the quick timeout stalls the unanswered query, the full
        // timeout fails it; the lookup settles on B and the announce phase
        // begins.
        a.sweep_transactions(at(T0 + 5));
        a.sweep_transactions(at(T0 + 31));
        exchange(&mut a, a_addr, &mut b, b_addr, at(T0 + 31));

        // A's announce completed with the peer B knew about.
        let events = a.take_events();
        let completed = events.iter().find_map(|event| match event {
            DhtEvent::AnnounceCompleted { ticket, result } => Some((ticket, result)),
            DhtEvent::AnnounceProgress { .. } => None,
        });

        let (ticket, result) = completed.expect("the announce should have completed");
        assert_eq!(*ticket, AnnounceTicket(42));
        assert_eq!(result.as_ref().unwrap(), &vec![peer_x]);

        // And B now tracks A as a peer for the torrent, under A's listen
        // port.
        let store = b.peer_store(&info_hash).expect("B should track the torrent");
        let peers = store.get_peers(32, &mut rand::thread_rng());
        assert!(peers.contains(&SocketAddrV4::new(*a_addr.ip(), 6881)));
        assert!(peers.contains(&peer_x));
    }
}
