//! HTTP tracker client: announce and scrape over GET requests.
//!
//! The query string is built by hand because the raw 20-byte `info_hash`
//! and `peer_id` values are not valid UTF-8 and cannot go through a typed
//! query serializer.
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bencode::{BDecodeOpt, BRefAccess, BencodeRef};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use swarm_discovery_primitives::announce_event::AnnounceEvent;
use swarm_discovery_primitives::compact;
use swarm_discovery_primitives::info_hash::InfoHash;
use thiserror::Error;
use tracing::debug;

use super::AnnounceQuery;
use crate::core::tracker::scrape_url_from;
use crate::core::{AnnounceReply, ScrapeReply};

#[derive(Error, Debug)]
pub enum Error {
    #[error("http request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("tracker response is not valid bencode: {source}")]
    Bencode {
        #[from]
        source: bencode::BencodeParseError,
    },

    #[error("tracker response has an unexpected shape: {reason}")]
    InvalidResponse { reason: &'static str },

    #[error("tracker failure: {reason}")]
    TrackerFailure { reason: String },

    #[error("tracker url does not support scraping: {url}")]
    ScrapeNotSupported { url: String },
}

#[must_use]
pub fn percent_encode_byte_array(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

impl fmt::Display for AnnounceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode_byte_array(&self.info_hash.0),
            percent_encode_byte_array(&self.peer_id.0),
            self.port,
            self.stats.uploaded,
            self.stats.downloaded,
            self.stats.left,
        )?;

        if self.event != AnnounceEvent::None {
            write!(f, "&event={}", self.event)?;
        }
        if let Some(numwant) = self.numwant {
            write!(f, "&numwant={numwant}")?;
        }
        if let Some(key) = self.key {
            write!(f, "&key={key:08x}")?;
        }
        if let Some(tracker_id) = &self.tracker_id {
            write!(f, "&trackerid={}", percent_encode_byte_array(tracker_id.as_bytes()))?;
        }

        Ok(())
    }
}

/// HTTP tracker client shared by every HTTP tracker in the list.
#[derive(Clone)]
pub struct HttpTrackerClient {
    reqwest: reqwest::Client,
}

impl HttpTrackerClient {
    /// # Errors
    ///
    /// This method fails if the client builder fails.
    pub fn new(timeout: std::time::Duration) -> Result<HttpTrackerClient, Error> {
        let reqwest = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTrackerClient { reqwest })
    }

    /// Sends one announce and parses the reply.
    ///
    /// # Errors
    ///
    /// Will return an error for transport failures, malformed responses and
    /// tracker-level failures (`failure reason`).
    pub async fn announce(&self, announce_url: &str, query: &AnnounceQuery) -> Result<AnnounceReply, Error> {
        let url = append_query(announce_url, &query.to_string());

        debug!(%url, "http announce");

        let body = self.reqwest.get(url).send().await?.bytes().await?;
        parse_announce_response(&body)
    }

    /// Sends one scrape for a single torrent and parses the reply.
    ///
    /// # Errors
    ///
    /// Will return an error when the URL cannot be rewritten to a scrape
    /// URL, plus the same failure cases as announcing.
    pub async fn scrape(&self, announce_url: &str, info_hash: &InfoHash) -> Result<ScrapeReply, Error> {
        let scrape_url = scrape_url_from(announce_url).ok_or_else(|| Error::ScrapeNotSupported {
            url: announce_url.to_string(),
        })?;

        let url = append_query(&scrape_url, &format!("info_hash={}", percent_encode_byte_array(&info_hash.0)));

        debug!(%url, "http scrape");

        let body = self.reqwest.get(url).send().await?.bytes().await?;
        parse_scrape_response(&body, info_hash)
    }
}

fn append_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceReply, Error> {
    let bencode = BencodeRef::decode(bytes, BDecodeOpt::default())?;
    let dict = bencode.dict().ok_or(Error::InvalidResponse {
        reason: "response is not a dictionary",
    })?;

    if let Some(reason) = dict.lookup(b"failure reason".as_slice()) {
        return Err(Error::TrackerFailure {
            reason: reason.str().unwrap_or("unreadable failure reason").to_string(),
        });
    }

    let lookup_u32 = |key: &[u8]| -> Option<u32> { dict.lookup(key)?.int().and_then(|v| u32::try_from(v).ok()) };

    let peers = match dict.lookup(b"peers".as_slice()) {
        None => Vec::new(),
        Some(peers) => {
            if let Some(compact) = peers.bytes() {
                compact::decode_peers(compact)
            } else if let Some(list) = peers.list() {
                decode_peer_dicts(list)
            } else {
                return Err(Error::InvalidResponse {
                    reason: "peers is neither a compact string nor a list",
                });
            }
        }
    };

    Ok(AnnounceReply {
        interval: lookup_u32(b"interval"),
        min_interval: lookup_u32(b"min interval"),
        tracker_id: dict.lookup(b"tracker id".as_slice()).and_then(|v| v.str()).map(String::from),
        complete: lookup_u32(b"complete"),
        incomplete: lookup_u32(b"incomplete"),
        peers,
    })
}

/// The non-compact `peers` model: a list of dicts with `ip` and `port`.
/// IPv6 and unparsable entries are skipped.
fn decode_peer_dicts(list: &dyn bencode::BListAccess<BencodeRef<'_>>) -> Vec<SocketAddrV4> {
    let mut peers = Vec::new();

    for index in 0..list.len() {
        let Some(peer) = list.get(index).and_then(BRefAccess::dict) else {
            continue;
        };

        let ip = peer.lookup(b"ip".as_slice()).and_then(|v| v.str()).and_then(|v| v.parse::<Ipv4Addr>().ok());
        let port = peer
            .lookup(b"port".as_slice())
            .and_then(|v| v.int())
            .and_then(|v| u16::try_from(v).ok());

        if let (Some(ip), Some(port)) = (ip, port) {
            peers.push(SocketAddrV4::new(ip, port));
        }
    }

    peers
}

fn parse_scrape_response(bytes: &[u8], info_hash: &InfoHash) -> Result<ScrapeReply, Error> {
    let bencode = BencodeRef::decode(bytes, BDecodeOpt::default())?;
    let dict = bencode.dict().ok_or(Error::InvalidResponse {
        reason: "response is not a dictionary",
    })?;

    if let Some(reason) = dict.lookup(b"failure reason".as_slice()) {
        return Err(Error::TrackerFailure {
            reason: reason.str().unwrap_or("unreadable failure reason").to_string(),
        });
    }

    let files = dict.lookup(b"files".as_slice()).and_then(|v| v.dict()).ok_or(Error::InvalidResponse {
        reason: "scrape response has no files dictionary",
    })?;

    let entry = files.lookup(&info_hash.0).and_then(|v| v.dict()).ok_or(Error::InvalidResponse {
        reason: "scrape response does not cover the requested torrent",
    })?;

    let lookup_u32 =
        |key: &[u8]| -> u32 { entry.lookup(key).and_then(|v| v.int()).and_then(|v| u32::try_from(v).ok()).unwrap_or(0) };

    Ok(ScrapeReply {
        complete: lookup_u32(b"complete"),
        incomplete: lookup_u32(b"incomplete"),
        downloaded: lookup_u32(b"downloaded"),
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use swarm_discovery_primitives::announce_event::AnnounceEvent;
    use swarm_discovery_primitives::info_hash::InfoHash;
    use swarm_discovery_primitives::peer::PeerId;

    use super::{parse_announce_response, parse_scrape_response, percent_encode_byte_array};
    use crate::clients::AnnounceQuery;
    use crate::core::AnnounceStats;

    fn query() -> AnnounceQuery {
        AnnounceQuery {
            info_hash: InfoHash([
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12,
                0x13, 0x14,
            ]),
            peer_id: PeerId(*b"-SD0010-abcdefghijkl"),
            port: 6881,
            stats: AnnounceStats::default(),
            event: AnnounceEvent::Started,
            numwant: None,
            key: None,
            tracker_id: None,
        }
    }

    #[test]
    fn it_should_percent_encode_raw_hashes() {
        assert_eq!(
            percent_encode_byte_array(&query().info_hash.0),
            "%01%02%03%04%05%06%07%08%09%0A%0B%0C%0D%0E%0F%10%11%12%13%14"
        );
    }

    #[test]
    fn it_should_build_the_announce_query_string() {
        let query = query();

        assert_eq!(
            query.to_string(),
            "info_hash=%01%02%03%04%05%06%07%08%09%0A%0B%0C%0D%0E%0F%10%11%12%13%14\
             &peer_id=%2DSD0010%2Dabcdefghijkl&port=6881&uploaded=0&downloaded=0&left=0&compact=1&event=started"
        );
    }

    #[test]
    fn it_should_include_the_optional_parameters_when_set() {
        let mut query = query();
        query.event = AnnounceEvent::None;
        query.numwant = Some(50);
        query.key = Some(0xCAFE);
        query.tracker_id = Some("abc".to_string());

        let built = query.to_string();

        assert!(!built.contains("&event="));
        assert!(built.ends_with("&numwant=50&key=0000cafe&trackerid=abc"));
    }

    #[test]
    fn it_should_parse_a_compact_announce_response() {
        let body = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";

        let reply = parse_announce_response(body).unwrap();

        assert_eq!(reply.interval, Some(1800));
        assert_eq!(reply.peers, vec![SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881)]);
    }

    #[test]
    fn it_should_parse_a_peer_dict_announce_response() {
        let body = b"d8:intervali900e5:peersld2:ip9:10.0.0.114:porti6881eeee";

        let reply = parse_announce_response(body).unwrap();

        assert_eq!(reply.interval, Some(900));
        assert_eq!(reply.peers, vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 11), 6881)]);
    }

    #[test]
    fn it_should_surface_the_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";

        let err = parse_announce_response(body).unwrap_err();

        assert!(matches!(err, super::Error::TrackerFailure { reason } if reason == "torrent unknown"));
    }

    #[test]
    fn it_should_parse_a_scrape_response() {
        let info_hash = InfoHash([0x61; 20]);
        // The files dict is keyed by the raw 20-byte hash.
        let mut body = Vec::new();
        body.extend_from_slice(b"d5:filesd20:");
        body.extend_from_slice(&info_hash.0);
        body.extend_from_slice(b"d8:completei3e10:downloadedi9e10:incompletei2eeee");

        let reply = parse_scrape_response(&body, &info_hash).unwrap();

        assert_eq!(reply.complete, 3);
        assert_eq!(reply.incomplete, 2);
        assert_eq!(reply.downloaded, 9);
    }
}
