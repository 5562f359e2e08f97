//! A single announce endpoint and its per-endpoint bookkeeping.
use std::time::Duration;

use swarm_discovery_primitives::DurationSinceUnixEpoch;
use thiserror::Error;
use tracing::warn;

use super::TrackerEvent;

/// How long a failed tracker backs off at most: `5 * 2^6` seconds.
const FAILED_BACKOFF_MAX_SHIFT: u32 = 6;

/// Width of the request-counter safeguard window.
const REQUEST_WINDOW: Duration = Duration::from_secs(10);

/// Requests inside one window at which the safeguard trips.
const REQUEST_LIMIT: u32 = 10;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrackerKind {
    Http,
    Udp,
    Dht,
}

#[derive(Error, Debug)]
pub enum UrlError {
    #[error("unsupported tracker protocol (url: {url})")]
    UnsupportedProtocol { url: String },
}

/// One announce endpoint: an HTTP or UDP tracker, or the DHT.
///
/// Holds the endpoint's counters and timestamps; the timing policy derived
/// from them lives here too (`activity_time_next` and friends), while the
/// decision *when* to act on it belongs to the controller.
#[derive(Debug, Clone)]
pub struct Tracker {
    kind: TrackerKind,
    url: String,
    group: u32,

    enabled: bool,
    service_available: bool,
    can_scrape: bool,

    busy: bool,
    seq: u64,
    latest_event: TrackerEvent,

    tracker_id: String,
    normal_interval: u32,
    min_interval: u32,

    latest_sum_peers: u32,

    success_time_last: DurationSinceUnixEpoch,
    success_counter: u32,

    failed_time_last: DurationSinceUnixEpoch,
    failed_counter: u32,

    scrape_time_last: DurationSinceUnixEpoch,
    scrape_counter: u32,

    scrape_complete: u32,
    scrape_incomplete: u32,
    scrape_downloaded: u32,

    request_time_last: DurationSinceUnixEpoch,
    request_counter: u32,
}

impl Tracker {
    #[must_use]
    pub fn new(kind: TrackerKind, url: String, group: u32) -> Tracker {
        let can_scrape = kind == TrackerKind::Http && scrape_url_from(&url).is_some() || kind == TrackerKind::Udp;

        Tracker {
            kind,
            url,
            group,
            enabled: true,
            // DHT trackers only work once the DHT service reports active.
            service_available: kind != TrackerKind::Dht,
            can_scrape,
            busy: false,
            seq: 0,
            latest_event: TrackerEvent::None,
            tracker_id: String::new(),
            normal_interval: 1800,
            min_interval: 600,
            latest_sum_peers: 0,
            success_time_last: DurationSinceUnixEpoch::ZERO,
            success_counter: 0,
            failed_time_last: DurationSinceUnixEpoch::ZERO,
            failed_counter: 0,
            scrape_time_last: DurationSinceUnixEpoch::ZERO,
            scrape_counter: 0,
            scrape_complete: 0,
            scrape_incomplete: 0,
            scrape_downloaded: 0,
            request_time_last: DurationSinceUnixEpoch::ZERO,
            request_counter: 0,
        }
    }

    /// Builds a tracker from its announce URL, deriving the kind from the
    /// URL scheme.
    ///
    /// # Errors
    ///
    /// Will return an error for URL schemes no client exists for.
    pub fn from_url(url: &str, group: u32) -> Result<Tracker, UrlError> {
        let kind = if url.starts_with("http://") || url.starts_with("https://") {
            TrackerKind::Http
        } else if url.starts_with("udp://") {
            TrackerKind::Udp
        } else if url.starts_with("dht://") {
            TrackerKind::Dht
        } else {
            return Err(UrlError::UnsupportedProtocol { url: url.to_string() });
        };

        Ok(Tracker::new(kind, url.to_string(), group))
    }

    #[must_use]
    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn group(&self) -> u32 {
        self.group
    }

    pub(super) fn set_group(&mut self, group: u32) {
        self.group = group;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// DHT trackers are unusable while the DHT service is down.
    pub fn set_service_available(&mut self, available: bool) {
        self.service_available = available;
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && self.service_available
    }

    /// A tracker is in use once it has ever answered an announce; stop and
    /// completed events are only worth sending to those.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.enabled && self.success_counter != 0
    }

    #[must_use]
    pub fn can_scrape(&self) -> bool {
        self.can_scrape
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    #[must_use]
    pub fn is_busy_not_scrape(&self) -> bool {
        self.busy && self.latest_event != TrackerEvent::Scrape
    }

    #[must_use]
    pub fn can_request_state(&self) -> bool {
        !self.is_busy_not_scrape() && self.is_usable()
    }

    #[must_use]
    pub fn latest_event(&self) -> TrackerEvent {
        self.latest_event
    }

    #[must_use]
    pub fn latest_sum_peers(&self) -> u32 {
        self.latest_sum_peers
    }

    #[must_use]
    pub fn tracker_id(&self) -> &str {
        &self.tracker_id
    }

    pub fn set_tracker_id(&mut self, id: String) {
        self.tracker_id = id;
    }

    #[must_use]
    pub fn normal_interval(&self) -> u32 {
        self.normal_interval
    }

    #[must_use]
    pub fn min_interval(&self) -> u32 {
        self.min_interval
    }

    pub fn set_normal_interval(&mut self, seconds: u32) {
        self.normal_interval = seconds.clamp(600, 3600);
    }

    pub fn set_min_interval(&mut self, seconds: u32) {
        self.min_interval = seconds.clamp(300, 1800);
    }

    #[must_use]
    pub fn success_counter(&self) -> u32 {
        self.success_counter
    }

    #[must_use]
    pub fn success_time_last(&self) -> DurationSinceUnixEpoch {
        self.success_time_last
    }

    #[must_use]
    pub fn success_time_next(&self) -> DurationSinceUnixEpoch {
        self.success_time_last + Duration::from_secs(u64::from(self.normal_interval))
    }

    #[must_use]
    pub fn failed_counter(&self) -> u32 {
        self.failed_counter
    }

    #[must_use]
    pub fn failed_time_last(&self) -> DurationSinceUnixEpoch {
        self.failed_time_last
    }

    /// Exponential backoff after failures: 5, 10, ... up to 320 seconds.
    #[must_use]
    pub fn failed_time_next(&self) -> DurationSinceUnixEpoch {
        let shift = self.failed_counter.saturating_sub(1).min(FAILED_BACKOFF_MAX_SHIFT);
        self.failed_time_last + Duration::from_secs(5u64 << shift)
    }

    #[must_use]
    pub fn activity_time_last(&self) -> DurationSinceUnixEpoch {
        if self.failed_counter != 0 {
            self.failed_time_last
        } else {
            self.success_time_last
        }
    }

    #[must_use]
    pub fn activity_time_next(&self) -> DurationSinceUnixEpoch {
        if self.failed_counter != 0 {
            self.failed_time_next()
        } else {
            self.success_time_next()
        }
    }

    #[must_use]
    pub fn scrape_time_last(&self) -> DurationSinceUnixEpoch {
        self.scrape_time_last
    }

    #[must_use]
    pub fn scrape_counter(&self) -> u32 {
        self.scrape_counter
    }

    #[must_use]
    pub fn scrape_complete(&self) -> u32 {
        self.scrape_complete
    }

    #[must_use]
    pub fn scrape_incomplete(&self) -> u32 {
        self.scrape_incomplete
    }

    #[must_use]
    pub fn scrape_downloaded(&self) -> u32 {
        self.scrape_downloaded
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn clear_stats(&mut self) {
        self.latest_sum_peers = 0;
        self.success_time_last = DurationSinceUnixEpoch::ZERO;
        self.success_counter = 0;
        self.failed_time_last = DurationSinceUnixEpoch::ZERO;
        self.failed_counter = 0;
        self.scrape_time_last = DurationSinceUnixEpoch::ZERO;
        self.scrape_counter = 0;
    }

    /// Safeguard against bugs that lead to hammering a tracker: more than
    /// `REQUEST_LIMIT` requests within one window indicate a scheduling bug.
    ///
    /// Debug builds abort; release builds refuse the request and keep going,
    /// since losing one update beats hammering a public tracker.
    pub(super) fn inc_request_counter(&mut self, now: DurationSinceUnixEpoch) -> bool {
        if now.saturating_sub(self.request_time_last) >= REQUEST_WINDOW {
            self.request_counter = 0;
            self.request_time_last = now;
        }

        self.request_counter += 1;

        if self.request_counter >= REQUEST_LIMIT {
            debug_assert!(
                false,
                "tracker request safeguard tripped (url: {}, requests: {})",
                self.url, self.request_counter
            );
            warn!(url = %self.url, requests = self.request_counter, "tracker request safeguard tripped, dropping request");
            return false;
        }

        true
    }

    /// Marks the tracker busy with a new outgoing request under the given
    /// request generation. Generations are unique across the whole list,
    /// so a result can be traced back to its tracker even after the list
    /// reordered.
    pub(super) fn mark_sent(&mut self, event: TrackerEvent, seq: u64) {
        self.busy = true;
        self.seq = seq;
        self.latest_event = event;
    }

    /// Result for `seq` is still wanted: the tracker is busy and no newer
    /// request has been issued.
    pub(super) fn accepts_result(&self, seq: u64) -> bool {
        self.busy && self.seq == seq
    }

    pub(super) fn clear_busy(&mut self) {
        self.busy = false;
    }

    pub(super) fn record_success(&mut self, now: DurationSinceUnixEpoch, sum_peers: u32) {
        self.busy = false;
        self.success_time_last = now;
        self.success_counter += 1;
        self.failed_counter = 0;
        self.latest_sum_peers = sum_peers;
    }

    pub(super) fn record_failure(&mut self, now: DurationSinceUnixEpoch) {
        self.busy = false;
        self.failed_time_last = now;
        self.failed_counter += 1;
    }

    /// Swarm sizes piggybacked on an announce reply; scrape timing is not
    /// affected.
    pub(super) fn record_scrape_counts(&mut self, complete: u32, incomplete: u32) {
        self.scrape_complete = complete;
        self.scrape_incomplete = incomplete;
    }

    pub(super) fn record_scrape(&mut self, now: DurationSinceUnixEpoch, complete: u32, incomplete: u32, downloaded: u32) {
        self.busy = false;
        self.scrape_time_last = now;
        self.scrape_counter += 1;
        self.scrape_complete = complete;
        self.scrape_incomplete = incomplete;
        self.scrape_downloaded = downloaded;
    }

    pub(super) fn apply_announce_intervals(&mut self, interval: Option<u32>, min_interval: Option<u32>) {
        if let Some(interval) = interval {
            self.set_normal_interval(interval);
        }
        if let Some(min_interval) = min_interval {
            self.set_min_interval(min_interval);
        }
    }
}

/// Derives the scrape URL per BEP-48: the `announce` prefix of the last
/// path segment is replaced by `scrape`. Returns `None` when the URL has no
/// such segment and therefore does not support scraping.
#[must_use]
pub fn scrape_url_from(url: &str) -> Option<String> {
    let last_slash = url.rfind('/')?;
    let segment = &url[last_slash + 1..];

    segment
        .strip_prefix("announce")
        .map(|rest| format!("{}/scrape{}", &url[..last_slash], rest))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{scrape_url_from, Tracker, TrackerKind};
    use crate::core::TrackerEvent;

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn it_should_derive_the_kind_from_the_url_scheme() {
        assert_eq!(Tracker::from_url("http://x/announce", 0).unwrap().kind(), TrackerKind::Http);
        assert_eq!(Tracker::from_url("udp://y:6969", 0).unwrap().kind(), TrackerKind::Udp);
        assert_eq!(Tracker::from_url("dht://", 0).unwrap().kind(), TrackerKind::Dht);
        assert!(Tracker::from_url("wss://z", 0).is_err());
    }

    #[test]
    fn it_should_rewrite_the_announce_url_for_scraping() {
        assert_eq!(
            scrape_url_from("http://x/announce").unwrap(),
            "http://x/scrape".to_string()
        );
        assert_eq!(
            scrape_url_from("http://x/announce.php?key=1").unwrap(),
            "http://x/scrape.php?key=1".to_string()
        );
        assert_eq!(scrape_url_from("http://x/a/announce").unwrap(), "http://x/a/scrape".to_string());
        assert!(scrape_url_from("http://x/peers").is_none());
    }

    #[test]
    fn it_should_clamp_intervals_from_the_tracker() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        tracker.set_normal_interval(10);
        assert_eq!(tracker.normal_interval(), 600);

        tracker.set_normal_interval(100_000);
        assert_eq!(tracker.normal_interval(), 3600);

        tracker.set_min_interval(10);
        assert_eq!(tracker.min_interval(), 300);

        tracker.set_min_interval(100_000);
        assert_eq!(tracker.min_interval(), 1800);
    }

    #[test]
    fn it_should_back_off_exponentially_after_failures() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        tracker.record_failure(at(1000));
        assert_eq!(tracker.failed_time_next(), at(1005));

        for _ in 0..2 {
            tracker.record_failure(at(1000));
        }
        assert_eq!(tracker.failed_time_next(), at(1020));

        // The backoff is capped at 5 * 2^6 = 320 seconds.
        for _ in 0..20 {
            tracker.record_failure(at(1000));
        }
        assert_eq!(tracker.failed_time_next(), at(1320));
    }

    #[test]
    fn it_should_report_activity_from_the_failed_side_only_while_failing() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        tracker.record_failure(at(500));
        assert_eq!(tracker.activity_time_last(), at(500));

        tracker.record_success(at(900), 0);
        assert_eq!(tracker.activity_time_last(), at(900));
        assert_eq!(tracker.activity_time_next(), at(900 + 1800));
    }

    #[test]
    fn it_should_drop_results_from_a_stale_request_generation() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        tracker.mark_sent(TrackerEvent::None, 1);
        assert!(tracker.accepts_result(1));

        tracker.clear_busy();
        assert!(!tracker.accepts_result(1));

        tracker.mark_sent(TrackerEvent::None, 2);
        assert!(!tracker.accepts_result(1));
        assert!(tracker.accepts_result(2));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn it_should_refuse_requests_past_the_safeguard_limit() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        for _ in 0..9 {
            assert!(tracker.inc_request_counter(at(100)));
        }
        assert!(!tracker.inc_request_counter(at(100)));

        // A new window resets the counter.
        assert!(tracker.inc_request_counter(at(111)));
    }

    #[test]
    fn it_should_allow_spread_out_requests_through_the_safeguard() {
        let mut tracker = Tracker::from_url("http://x/announce", 0).unwrap();

        for round in 0..20u64 {
            assert!(tracker.inc_request_counter(at(100 + round * 10)));
        }
    }
}
