//! UDP tracker client (BEP-15): connect, announce and scrape.
//!
//! Each exchange is a single request datagram answered by a single response
//! datagram, matched on a random 32-bit transaction id. Every request after
//! the handshake carries the connection id the tracker handed out, which
//! stays valid for one minute.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::Rng;
use swarm_discovery_primitives::compact;
use swarm_discovery_primitives::info_hash::InfoHash;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::AnnounceQuery;

/// Magic constant for the UDP tracker protocol handshake.
pub const PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// How long a connection id handed out by a tracker stays valid.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

const CONNECT_REQUEST_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const SCRAPE_REQUEST_LEN: usize = 36;

#[derive(Error, Debug)]
pub enum Error {
    #[error("udp socket error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("unable to connect to UDP tracker after {tries} attempts")]
    NoReply { tries: u32 },

    #[error("tracker error: {message}")]
    Tracker { message: String },
}

#[derive(Debug, PartialEq, Eq)]
pub struct UdpAnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UdpScrapeResponse {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

fn build_connect_request(transaction_id: u32) -> [u8; CONNECT_REQUEST_LEN] {
    let mut buffer = [0u8; CONNECT_REQUEST_LEN];
    buffer[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    buffer[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buffer[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buffer
}

fn build_announce_request(connection_id: u64, transaction_id: u32, query: &AnnounceQuery) -> [u8; ANNOUNCE_REQUEST_LEN] {
    let mut buffer = [0u8; ANNOUNCE_REQUEST_LEN];
    buffer[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buffer[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buffer[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buffer[16..36].copy_from_slice(&query.info_hash.0);
    buffer[36..56].copy_from_slice(&query.peer_id.0);
    buffer[56..64].copy_from_slice(&query.stats.downloaded.to_be_bytes());
    buffer[64..72].copy_from_slice(&query.stats.left.to_be_bytes());
    buffer[72..80].copy_from_slice(&query.stats.uploaded.to_be_bytes());
    buffer[80..84].copy_from_slice(&query.event.to_i32().to_be_bytes());
    // ip address 0: announce from the source address of this datagram.
    buffer[84..88].copy_from_slice(&0u32.to_be_bytes());
    buffer[88..92].copy_from_slice(&query.key.unwrap_or(0).to_be_bytes());
    buffer[92..96].copy_from_slice(&query.numwant.unwrap_or(-1).to_be_bytes());
    buffer[96..98].copy_from_slice(&query.port.to_be_bytes());
    buffer
}

fn build_scrape_request(connection_id: u64, transaction_id: u32, info_hash: &InfoHash) -> [u8; SCRAPE_REQUEST_LEN] {
    let mut buffer = [0u8; SCRAPE_REQUEST_LEN];
    buffer[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buffer[8..12].copy_from_slice(&ACTION_SCRAPE.to_be_bytes());
    buffer[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buffer[16..36].copy_from_slice(&info_hash.0);
    buffer
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// The action/transaction header every response starts with. `None` for
/// packets too short to carry one.
fn read_header(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 8 {
        return None;
    }

    Some((read_u32(bytes, 0), read_u32(bytes, 4)))
}

fn parse_error_response(bytes: &[u8]) -> Error {
    Error::Tracker {
        message: String::from_utf8_lossy(&bytes[8..]).into_owned(),
    }
}

fn parse_connect_response(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < 16 {
        return None;
    }

    Some(u64::from_be_bytes([
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ]))
}

fn parse_announce_response(bytes: &[u8]) -> Option<UdpAnnounceResponse> {
    if bytes.len() < 20 {
        return None;
    }

    Some(UdpAnnounceResponse {
        interval: read_u32(bytes, 8),
        leechers: read_u32(bytes, 12),
        seeders: read_u32(bytes, 16),
        peers: compact::decode_peers(&bytes[20..]),
    })
}

fn parse_scrape_response(bytes: &[u8]) -> Option<UdpScrapeResponse> {
    if bytes.len() < 20 {
        return None;
    }

    Some(UdpScrapeResponse {
        seeders: read_u32(bytes, 8),
        completed: read_u32(bytes, 12),
        leechers: read_u32(bytes, 16),
    })
}

/// UDP tracker client holding one local socket and the last connection id
/// per use.
pub struct UdpTrackerClient {
    socket: UdpSocket,
    request_timeout: Duration,
    tries: u32,
    connection: Option<(SocketAddr, u64, Instant)>,
}

impl UdpTrackerClient {
    /// Binds a local socket for tracker exchanges.
    ///
    /// # Errors
    ///
    /// Will return an error when the local socket cannot be bound.
    pub async fn bind(request_timeout: Duration, tries: u32) -> Result<UdpTrackerClient, Error> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;

        Ok(UdpTrackerClient {
            socket,
            request_timeout,
            tries,
            connection: None,
        })
    }

    /// Announces to the tracker at `addr`, connecting first when needed.
    ///
    /// # Errors
    ///
    /// Will return an error when the tracker never replies within the retry
    /// budget, replies with an error action, or the transport fails.
    pub async fn announce(&mut self, addr: SocketAddr, query: &AnnounceQuery) -> Result<UdpAnnounceResponse, Error> {
        let connection_id = self.obtain_connection_id(addr).await?;

        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = build_announce_request(connection_id, transaction_id, query);

        debug!(%addr, transaction_id, "udp announce");

        let response = self.exchange(addr, &request, transaction_id).await?;

        match read_header(&response) {
            Some((ACTION_ANNOUNCE, _)) => parse_announce_response(&response).ok_or(Error::NoReply { tries: self.tries }),
            Some((ACTION_ERROR, _)) => Err(parse_error_response(&response)),
            _ => Err(Error::NoReply { tries: self.tries }),
        }
    }

    /// Scrapes a single torrent from the tracker at `addr`.
    ///
    /// # Errors
    ///
    /// Same failure cases as announcing.
    pub async fn scrape(&mut self, addr: SocketAddr, info_hash: &InfoHash) -> Result<UdpScrapeResponse, Error> {
        let connection_id = self.obtain_connection_id(addr).await?;

        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = build_scrape_request(connection_id, transaction_id, info_hash);

        debug!(%addr, transaction_id, "udp scrape");

        let response = self.exchange(addr, &request, transaction_id).await?;

        match read_header(&response) {
            Some((ACTION_SCRAPE, _)) => parse_scrape_response(&response).ok_or(Error::NoReply { tries: self.tries }),
            Some((ACTION_ERROR, _)) => Err(parse_error_response(&response)),
            _ => Err(Error::NoReply { tries: self.tries }),
        }
    }

    /// A cached connection id is reused within its one minute lifetime;
    /// otherwise a connect handshake is performed first.
    async fn obtain_connection_id(&mut self, addr: SocketAddr) -> Result<u64, Error> {
        if let Some((cached_addr, id, obtained)) = self.connection {
            if cached_addr == addr && obtained.elapsed() < CONNECTION_ID_LIFETIME {
                return Ok(id);
            }
        }

        let transaction_id = rand::thread_rng().gen::<u32>();
        let request = build_connect_request(transaction_id);

        debug!(%addr, transaction_id, "udp connect");

        let response = self.exchange(addr, &request, transaction_id).await?;

        match read_header(&response) {
            Some((ACTION_CONNECT, _)) => {
                let id = parse_connect_response(&response).ok_or(Error::NoReply { tries: self.tries })?;
                self.connection = Some((addr, id, Instant::now()));
                Ok(id)
            }
            Some((ACTION_ERROR, _)) => Err(parse_error_response(&response)),
            _ => Err(Error::NoReply { tries: self.tries }),
        }
    }

    /// Sends the request and waits for the matching response, retrying the
    /// full timeout per attempt. Responses with a foreign transaction id
    /// are dropped without consuming the attempt's remaining time budget.
    async fn exchange(&self, addr: SocketAddr, request: &[u8], transaction_id: u32) -> Result<Vec<u8>, Error> {
        let mut buffer = [0u8; 4096];

        for _attempt in 0..self.tries {
            self.socket.send_to(request, addr).await?;

            let deadline = Instant::now() + self.request_timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let Ok(received) = timeout(remaining, self.socket.recv_from(&mut buffer)).await else {
                    break;
                };

                let (len, from) = received?;
                if from != addr {
                    continue;
                }

                match read_header(&buffer[..len]) {
                    Some((_, txn)) if txn == transaction_id => return Ok(buffer[..len].to_vec()),
                    _ => continue,
                }
            }
        }

        Err(Error::NoReply { tries: self.tries })
    }
}

#[cfg(test)]
mod tests {
    use swarm_discovery_primitives::announce_event::AnnounceEvent;
    use swarm_discovery_primitives::info_hash::InfoHash;
    use swarm_discovery_primitives::peer::PeerId;

    use super::{
        build_announce_request, build_connect_request, build_scrape_request, parse_announce_response, parse_connect_response,
        parse_error_response, read_header,
    };
    use crate::clients::AnnounceQuery;
    use crate::core::AnnounceStats;

    fn query() -> AnnounceQuery {
        AnnounceQuery {
            info_hash: InfoHash([0xAB; 20]),
            peer_id: PeerId(*b"-SD0010-000000000000"),
            port: 6881,
            stats: AnnounceStats {
                uploaded: 1,
                downloaded: 2,
                left: 3,
            },
            event: AnnounceEvent::Started,
            numwant: None,
            key: Some(0xDEAD_BEEF),
            tracker_id: None,
        }
    }

    #[test]
    fn it_should_build_the_connect_handshake() {
        let request = build_connect_request(0x0102_0304);

        assert_eq!(
            request,
            [0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn it_should_build_an_announce_request_of_exactly_98_bytes() {
        let request = build_announce_request(0x1122_3344_5566_7788, 7, &query());

        assert_eq!(request.len(), 98);
        assert_eq!(&request[0..8], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&request[8..12], &[0, 0, 0, 1]);
        assert_eq!(&request[16..36], &[0xAB; 20]);
        assert_eq!(&request[56..64], &2u64.to_be_bytes());
        assert_eq!(&request[64..72], &3u64.to_be_bytes());
        assert_eq!(&request[72..80], &1u64.to_be_bytes());
        // started = 2
        assert_eq!(&request[80..84], &[0, 0, 0, 2]);
        assert_eq!(&request[88..92], &0xDEAD_BEEFu32.to_be_bytes());
        // default numwant is -1
        assert_eq!(&request[92..96], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&request[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn it_should_build_a_scrape_request_of_exactly_36_bytes() {
        let request = build_scrape_request(1, 2, &InfoHash([0xCD; 20]));

        assert_eq!(request.len(), 36);
        assert_eq!(&request[8..12], &[0, 0, 0, 2]);
        assert_eq!(&request[16..36], &[0xCD; 20]);
    }

    #[test]
    fn it_should_parse_a_connect_response() {
        let mut response = Vec::new();
        response.extend_from_slice(&[0, 0, 0, 0]);
        response.extend_from_slice(&42u32.to_be_bytes());
        response.extend_from_slice(&0xAA55_AA55_AA55_AA55u64.to_be_bytes());

        assert_eq!(read_header(&response), Some((0, 42)));
        assert_eq!(parse_connect_response(&response), Some(0xAA55_AA55_AA55_AA55));
    }

    #[test]
    fn it_should_parse_an_announce_response_with_peers() {
        let mut response = Vec::new();
        response.extend_from_slice(&[0, 0, 0, 1]);
        response.extend_from_slice(&7u32.to_be_bytes());
        response.extend_from_slice(&600u32.to_be_bytes());
        response.extend_from_slice(&2u32.to_be_bytes());
        response.extend_from_slice(&3u32.to_be_bytes());
        response.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);
        response.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);

        let parsed = parse_announce_response(&response).unwrap();

        assert_eq!(parsed.interval, 600);
        assert_eq!(parsed.leechers, 2);
        assert_eq!(parsed.seeders, 3);
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[1].port(), 6882);
    }

    #[test]
    fn it_should_parse_an_error_response() {
        let mut response = Vec::new();
        response.extend_from_slice(&[0, 0, 0, 3]);
        response.extend_from_slice(&7u32.to_be_bytes());
        response.extend_from_slice(b"torrent not registered");

        let err = parse_error_response(&response);

        assert!(matches!(err, super::Error::Tracker { message } if message == "torrent not registered"));
    }

    #[test]
    fn it_should_reject_truncated_responses() {
        assert_eq!(read_header(&[0, 0, 0]), None);
        assert_eq!(parse_connect_response(&[0u8; 12]), None);
        assert!(parse_announce_response(&[0u8; 19]).is_none());
    }
}
