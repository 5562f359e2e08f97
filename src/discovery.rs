//! The per-torrent discovery task: one [`TrackerController`] plus the
//! protocol clients that execute its request tickets.
//!
//! All controller state is owned by this task; requests run as spawned
//! futures that post their outcome back through a channel, tagged with the
//! tracker's request generation. The controller drops outcomes whose
//! generation is stale, which is what makes close/disown work without
//! locks.
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use rand::Rng;
use swarm_discovery_clock::clock::Time;
use swarm_discovery_configuration::Configuration;
use swarm_discovery_primitives::info_hash::InfoHash;
use swarm_discovery_primitives::peer::PeerId;
use swarm_discovery_primitives::DurationSinceUnixEpoch;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::http::HttpTrackerClient;
use crate::clients::udp::UdpTrackerClient;
use crate::clients::AnnounceQuery;
use crate::core::controller::TrackerController;
use crate::core::tracker::TrackerKind;
use crate::core::tracker_list::TrackerList;
use crate::core::{AnnounceReply, AnnounceStats, RequestKind, RequestTicket, ScrapeReply};
use crate::dht::service::DhtHandle;
use crate::CurrentClock;

/// What the discovery reports upward to the download engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// An announce succeeded; here is the (deduplicated) peer list.
    Peers(Vec<SocketAddrV4>),
    /// An announce attempt failed with this message.
    Failure(String),
}

enum Command {
    Start,
    Stop,
    Completed,
    Update,
    StartRequesting,
    StopRequesting,
    ManualRequest { force: bool },
    Scrape { delay: u64 },
    UpdateStats(AnnounceStats),
    Shutdown,
}

/// Cheap-to-clone handle to a running discovery task.
#[derive(Clone)]
pub struct DiscoveryHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DiscoveryHandle {
    pub fn send_start_event(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn send_stop_event(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn send_completed_event(&self) {
        let _ = self.commands.send(Command::Completed);
    }

    pub fn send_update_event(&self) {
        let _ = self.commands.send(Command::Update);
    }

    pub fn start_requesting(&self) {
        let _ = self.commands.send(Command::StartRequesting);
    }

    pub fn stop_requesting(&self) {
        let _ = self.commands.send(Command::StopRequesting);
    }

    pub fn manual_request(&self, force: bool) {
        let _ = self.commands.send(Command::ManualRequest { force });
    }

    pub fn scrape_request(&self, delay_seconds: u64) {
        let _ = self.commands.send(Command::Scrape { delay: delay_seconds });
    }

    /// Keeps the transfer progress current; it is sent with every
    /// announce.
    pub fn update_stats(&self, stats: AnnounceStats) {
        let _ = self.commands.send(Command::UpdateStats(stats));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Outcome {
    seq: u64,
    kind: OutcomeKind,
}

enum OutcomeKind {
    Announce(Result<AnnounceReply, String>),
    Scrape(Result<ScrapeReply, String>),
}

pub struct Discovery {
    controller: TrackerController,

    http: HttpTrackerClient,
    dht: Option<DhtHandle>,

    info_hash: InfoHash,
    peer_id: PeerId,
    listen_port: u16,
    key: u32,
    numwant: Option<i32>,
    stats: AnnounceStats,

    udp_timeout: Duration,
    udp_tries: u32,

    commands: mpsc::UnboundedReceiver<Command>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    outcome_sender: mpsc::UnboundedSender<Outcome>,

    /// In-flight request tasks keyed by request generation.
    inflight: HashMap<u64, JoinHandle<()>>,
}

impl Discovery {
    /// Builds the tracker list from the torrent's announce URLs, wires the
    /// controller and spawns the discovery task.
    ///
    /// `trackers` carries `(group, url)` pairs; URLs with unsupported
    /// schemes are skipped with a warning. The returned receiver delivers
    /// the [`SwarmEvent`]s.
    ///
    /// # Errors
    ///
    /// Will return an error when the HTTP client cannot be built.
    pub fn start(
        configuration: &Configuration,
        info_hash: InfoHash,
        trackers: &[(u32, String)],
        dht: Option<DhtHandle>,
    ) -> Result<(DiscoveryHandle, mpsc::UnboundedReceiver<SwarmEvent>, JoinHandle<()>), crate::clients::http::Error> {
        let mut list = TrackerList::new();

        for (group, url) in trackers {
            if let Err(err) = list.insert_url(*group, url) {
                warn!(%err, "skipping tracker");
            }
        }

        if dht.is_some() {
            let _ = list.insert_url(u32::MAX, "dht://");
            list.set_dht_available(true);
        }

        // Spread the load over each group's mirrors.
        list.randomize_group_entries();

        let mut controller = TrackerController::new(list);

        let (event_sender, events) = mpsc::unbounded_channel();

        let success_events = event_sender.clone();
        controller.set_slot_success(Box::new(move |peers| {
            let _ = success_events.send(SwarmEvent::Peers(peers.to_vec()));
        }));
        controller.set_slot_failure(Box::new(move |msg| {
            let _ = event_sender.send(SwarmEvent::Failure(msg.to_string()));
        }));

        let mut entropy = [0u8; 12];
        rand::thread_rng().fill(&mut entropy);

        let key = if configuration.core.key == 0 {
            rand::thread_rng().gen()
        } else {
            configuration.core.key
        };

        let (command_sender, commands) = mpsc::unbounded_channel();
        let (outcome_sender, outcomes) = mpsc::unbounded_channel();

        let discovery = Discovery {
            controller,
            http: HttpTrackerClient::new(Duration::from_secs(u64::from(configuration.core.udp_timeout)))?,
            dht,
            info_hash,
            peer_id: PeerId::from_prefix_and_entropy(configuration.core.peer_id_prefix.as_bytes(), &entropy),
            listen_port: configuration.core.listen_port,
            key,
            numwant: (configuration.core.numwant >= 0).then_some(configuration.core.numwant),
            stats: AnnounceStats::default(),
            udp_timeout: Duration::from_secs(u64::from(configuration.core.udp_timeout)),
            udp_tries: configuration.core.udp_tries,
            commands,
            outcomes,
            outcome_sender,
            inflight: HashMap::new(),
        };

        let join = tokio::spawn(discovery.run());

        Ok((DiscoveryHandle { commands: command_sender }, events, join))
    }

    async fn run(mut self) {
        info!(info_hash = %self.info_hash, "peer discovery starting");

        self.controller.enable(CurrentClock::now(), 0);

        loop {
            self.reconcile_requests();

            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    let now = CurrentClock::now();

                    match command {
                        Some(Command::Start) => self.controller.send_start_event(now),
                        Some(Command::Stop) => self.controller.send_stop_event(now),
                        Some(Command::Completed) => self.controller.send_completed_event(now),
                        Some(Command::Update) => self.controller.send_update_event(now),
                        Some(Command::StartRequesting) => self.controller.start_requesting(now),
                        Some(Command::StopRequesting) => self.controller.stop_requesting(),
                        Some(Command::ManualRequest { force }) => self.controller.manual_request(now, force),
                        Some(Command::Scrape { delay }) => self.controller.scrape_request(now, delay),
                        Some(Command::UpdateStats(stats)) => self.stats = stats,
                        Some(Command::Shutdown) | None => break,
                    }
                }

                outcome = self.outcomes.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_outcome(outcome);
                    }
                }

                () = sleep_until_deadline(deadline), if deadline.is_some() => {
                    let now = CurrentClock::now();

                    if self.controller.next_timeout().is_some_and(|due| due <= now) {
                        self.controller.do_timeout(now);
                    }
                    if self.controller.next_scrape().is_some_and(|due| due <= now) {
                        self.controller.do_scrape(now);
                    }
                }
            }
        }

        self.controller.disable();
        self.reconcile_requests();

        info!(info_hash = %self.info_hash, "peer discovery stopped");
    }

    fn next_deadline(&self) -> Option<DurationSinceUnixEpoch> {
        match (self.controller.next_timeout(), self.controller.next_scrape()) {
            (Some(timeout), Some(scrape)) => Some(timeout.min(scrape)),
            (timeout, scrape) => timeout.or(scrape),
        }
    }

    /// Launches freshly queued requests and aborts cancelled ones.
    fn reconcile_requests(&mut self) {
        let cancellations = self.controller.tracker_list_mut().take_cancellations();
        for ticket in cancellations {
            if let Some(task) = self.inflight.remove(&ticket.seq) {
                debug!(tracker = ticket.tracker, "aborting cancelled tracker request");
                task.abort();
            }
        }

        let tickets = self.controller.tracker_list_mut().take_requests();
        for ticket in tickets {
            let task = self.launch(ticket);
            self.inflight.insert(ticket.seq, task);
        }
    }

    fn launch(&self, ticket: RequestTicket) -> JoinHandle<()> {
        let tracker = self.controller.tracker_list().get(ticket.tracker);
        let url = tracker.url().to_string();
        let kind = tracker.kind();

        let query = AnnounceQuery {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.listen_port,
            stats: self.stats,
            event: match ticket.kind {
                RequestKind::Announce(event) => event,
                RequestKind::Scrape => swarm_discovery_primitives::announce_event::AnnounceEvent::None,
            },
            numwant: self.numwant,
            key: Some(self.key),
            tracker_id: (!tracker.tracker_id().is_empty()).then(|| tracker.tracker_id().to_string()),
        };

        let outcome_sender = self.outcome_sender.clone();
        let http = self.http.clone();
        let dht = self.dht.clone();
        let udp_timeout = self.udp_timeout;
        let udp_tries = self.udp_tries;

        tokio::spawn(async move {
            let kind = match (kind, ticket.kind) {
                (TrackerKind::Http, RequestKind::Announce(_)) => {
                    OutcomeKind::Announce(http.announce(&url, &query).await.map_err(|err| err.to_string()))
                }
                (TrackerKind::Http, RequestKind::Scrape) => {
                    OutcomeKind::Scrape(http.scrape(&url, &query.info_hash).await.map_err(|err| err.to_string()))
                }
                (TrackerKind::Udp, _) => udp_request(&url, &query, ticket.kind, udp_timeout, udp_tries).await,
                (TrackerKind::Dht, _) => dht_announce(dht, query.info_hash).await,
            };

            let _ = outcome_sender.send(Outcome { seq: ticket.seq, kind });
        })
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        let now = CurrentClock::now();

        self.inflight.remove(&outcome.seq);

        match outcome.kind {
            OutcomeKind::Announce(Ok(reply)) => {
                self.controller.receive_success(outcome.seq, reply, now);
            }
            OutcomeKind::Announce(Err(msg)) => {
                self.controller.receive_failure(outcome.seq, &msg, now);
            }
            OutcomeKind::Scrape(Ok(reply)) => {
                self.controller.receive_scrape_success(outcome.seq, reply, now);
            }
            OutcomeKind::Scrape(Err(msg)) => {
                self.controller.receive_scrape_failed(outcome.seq, &msg);
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<DurationSinceUnixEpoch>) {
    let Some(deadline) = deadline else {
        return std::future::pending().await;
    };

    let wait = deadline.saturating_sub(CurrentClock::now());

    tokio::time::sleep(wait).await;
}

/// One BEP-15 exchange: resolve the tracker address, connect and announce
/// or scrape.
async fn udp_request(url: &str, query: &AnnounceQuery, kind: RequestKind, timeout: Duration, tries: u32) -> OutcomeKind {
    let result = async {
        let parsed = Url::parse(url).map_err(|err| err.to_string())?;
        let host = parsed.host_str().ok_or("udp tracker url has no host")?;
        let port = parsed.port().ok_or("udp tracker url has no port")?;

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| err.to_string())?
            .next()
            .ok_or("udp tracker hostname did not resolve")?;

        let mut client = UdpTrackerClient::bind(timeout, tries).await.map_err(|err| err.to_string())?;

        match kind {
            RequestKind::Announce(_) => {
                let response = client.announce(addr, query).await.map_err(|err| err.to_string())?;

                Ok(OutcomeKind::Announce(Ok(AnnounceReply {
                    interval: Some(response.interval),
                    complete: Some(response.seeders),
                    incomplete: Some(response.leechers),
                    peers: response.peers,
                    ..AnnounceReply::default()
                })))
            }
            RequestKind::Scrape => {
                let response = client.scrape(addr, &query.info_hash).await.map_err(|err| err.to_string())?;

                Ok(OutcomeKind::Scrape(Ok(ScrapeReply {
                    complete: response.seeders,
                    incomplete: response.leechers,
                    downloaded: response.completed,
                })))
            }
        }
    }
    .await;

    match (result, kind) {
        (Ok(outcome), _) => outcome,
        (Err(msg), RequestKind::Scrape) => OutcomeKind::Scrape(Err(msg)),
        (Err(msg), RequestKind::Announce(_)) => OutcomeKind::Announce(Err(msg)),
    }
}

/// The DHT tracker entry delegates to the DHT service.
async fn dht_announce(dht: Option<DhtHandle>, info_hash: InfoHash) -> OutcomeKind {
    let Some(dht) = dht else {
        return OutcomeKind::Announce(Err("DHT server not active.".to_string()));
    };

    match dht.announce(info_hash).await {
        Ok(Ok(peers)) => OutcomeKind::Announce(Ok(AnnounceReply {
            // BEP-5 has no tracker intervals; reannounce at the DHT's own
            // cadence.
            interval: Some(20 * 60),
            peers,
            ..AnnounceReply::default()
        })),
        Ok(Err(msg)) => OutcomeKind::Announce(Err(msg)),
        Err(_) => OutcomeKind::Announce(Err("DHT announce cancelled.".to_string())),
    }
}
