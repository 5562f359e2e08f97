//! Ordered, grouped collection of trackers.
//!
//! Trackers are addressed by index; group numbers are stable and groups
//! occupy contiguous index ranges. A "group" is a failover set: the entries
//! of one group back each other up, and a successful tracker is promoted to
//! the front of its group.
use std::net::SocketAddrV4;
use std::time::Duration;

use rand::seq::SliceRandom;
use swarm_discovery_primitives::announce_event::AnnounceEvent;
use swarm_discovery_primitives::DurationSinceUnixEpoch;
use tracing::{debug, info, warn};

use super::tracker::{Tracker, UrlError};
use super::{AnnounceReply, RequestKind, RequestTicket, ScrapeReply, TrackerEvent};

/// A second scrape to the same tracker within this window is suppressed.
const SCRAPE_SUPPRESSION: Duration = Duration::from_secs(10 * 60);

#[derive(Default)]
pub struct TrackerList {
    trackers: Vec<Tracker>,

    /// Source of list-wide unique request generations.
    next_seq: u64,

    send_queue: Vec<RequestTicket>,
    cancels: Vec<RequestTicket>,
}

impl TrackerList {
    #[must_use]
    pub fn new() -> TrackerList {
        TrackerList::default()
    }

    /// The tracker currently busy with the request generation `seq`, if
    /// any. Generations are unique, so this survives list reordering.
    #[must_use]
    pub fn find_by_seq(&self, seq: u64) -> Option<usize> {
        self.trackers.iter().position(|tracker| tracker.accepts_result(seq))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> &Tracker {
        &self.trackers[index]
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> &mut Tracker {
        &mut self.trackers[index]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tracker> {
        self.trackers.iter()
    }

    #[must_use]
    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy)
    }

    #[must_use]
    pub fn has_active_not_scrape(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy_not_scrape)
    }

    #[must_use]
    pub fn has_active_in_group(&self, group: u32) -> bool {
        self.group_range(group).any(|i| self.trackers[i].is_busy())
    }

    #[must_use]
    pub fn has_active_not_scrape_in_group(&self, group: u32) -> bool {
        self.group_range(group).any(|i| self.trackers[i].is_busy_not_scrape())
    }

    #[must_use]
    pub fn has_usable(&self) -> bool {
        self.trackers.iter().any(Tracker::is_usable)
    }

    #[must_use]
    pub fn count_usable(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_usable()).count()
    }

    #[must_use]
    pub fn count_active(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_busy()).count()
    }

    /// Inserts a tracker at the end of its group, keeping groups contiguous.
    pub fn insert(&mut self, group: u32, mut tracker: Tracker) -> usize {
        tracker.set_group(group);

        let index = self.end_group(group);
        self.trackers.insert(index, tracker);
        index
    }

    /// Parses the URL and inserts the matching tracker kind.
    ///
    /// # Errors
    ///
    /// Will return an error for URL schemes no client exists for.
    pub fn insert_url(&mut self, group: u32, url: &str) -> Result<usize, UrlError> {
        let tracker = Tracker::from_url(url, group)?;

        info!(group, url, "added tracker");
        Ok(self.insert(group, tracker))
    }

    /// Index of the first tracker of `group`, or where it would start.
    #[must_use]
    pub fn begin_group(&self, group: u32) -> usize {
        self.trackers.iter().position(|t| t.group() >= group).unwrap_or(self.trackers.len())
    }

    /// Index one past the last tracker of `group`.
    #[must_use]
    pub fn end_group(&self, group: u32) -> usize {
        self.trackers.iter().position(|t| t.group() > group).unwrap_or(self.trackers.len())
    }

    fn group_range(&self, group: u32) -> std::ops::Range<usize> {
        self.begin_group(group)..self.end_group(group)
    }

    #[must_use]
    pub fn find_usable_from(&self, from: usize) -> Option<usize> {
        (from..self.trackers.len()).find(|&i| self.trackers[i].is_usable())
    }

    /// The next tracker worth contacting: the first non-busy usable one,
    /// except that among failed trackers the one whose retry is due soonest
    /// wins, and a healthy tracker further down the list beats a failed one
    /// whose retry is later.
    #[must_use]
    pub fn find_next_to_request(&self, from: usize) -> Option<usize> {
        let mut candidates = (from..self.trackers.len()).filter(|&i| self.trackers[i].can_request_state());

        let mut preferred = candidates.next()?;

        if self.trackers[preferred].failed_counter() == 0 {
            return Some(preferred);
        }

        for i in candidates {
            let tracker = &self.trackers[i];

            if tracker.failed_counter() != 0 {
                if tracker.failed_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
            } else {
                if tracker.success_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
                break;
            }
        }

        Some(preferred)
    }

    /// Rotates the group so its current head goes last. Used to try
    /// alternates of a group without forgetting the previous head.
    pub fn cycle_group(&mut self, group: u32) {
        let range = self.group_range(group);

        if range.len() > 1 {
            self.trackers[range].rotate_left(1);
        }
    }

    /// Moves the tracker to the front of its group and returns its new
    /// index.
    pub fn promote(&mut self, index: usize) -> usize {
        let first = self.begin_group(self.trackers[index].group());

        self.trackers.swap(first, index);
        first
    }

    /// Shuffles the entries within each group. Done once at startup so that
    /// all clients together do not hammer the first URL of each group.
    pub fn randomize_group_entries(&mut self) {
        let mut start = 0;

        while start < self.trackers.len() {
            let end = self.end_group(self.trackers[start].group());
            self.trackers[start..end].shuffle(&mut rand::thread_rng());
            start = end;
        }
    }

    /// Queues an announce with the given event on the tracker.
    ///
    /// No-op when the tracker is unusable or busy with another announce; a
    /// tracker busy with a scrape has the scrape cancelled first.
    pub fn send_state(&mut self, index: usize, event: TrackerEvent, now: DurationSinceUnixEpoch) {
        let Some(announce_event) = event.announce_event() else {
            return;
        };

        if !self.trackers[index].is_usable() {
            return;
        }

        if self.trackers[index].is_busy() {
            if self.trackers[index].latest_event() != TrackerEvent::Scrape {
                return;
            }

            self.close(index);
        }

        if !self.trackers[index].inc_request_counter(now) {
            return;
        }

        self.next_seq += 1;
        let seq = self.next_seq;

        self.trackers[index].mark_sent(event, seq);
        self.send_queue.push(RequestTicket {
            tracker: index,
            seq,
            kind: RequestKind::Announce(announce_event),
        });

        info!(group = self.trackers[index].group(), url = self.trackers[index].url(), ?event, "sending announce");
    }

    /// Queues a scrape, unless one was sent recently or the tracker is
    /// busy.
    pub fn send_scrape(&mut self, index: usize, now: DurationSinceUnixEpoch) {
        let tracker = &mut self.trackers[index];

        if tracker.is_busy() || !tracker.is_usable() || !tracker.can_scrape() {
            return;
        }

        if now.saturating_sub(tracker.scrape_time_last()) < SCRAPE_SUPPRESSION {
            return;
        }

        if !tracker.inc_request_counter(now) {
            return;
        }

        self.next_seq += 1;
        let seq = self.next_seq;

        self.trackers[index].mark_sent(TrackerEvent::Scrape, seq);
        self.send_queue.push(RequestTicket {
            tracker: index,
            seq,
            kind: RequestKind::Scrape,
        });

        info!(group = self.trackers[index].group(), url = self.trackers[index].url(), "sending scrape");
    }

    /// Cancels the tracker's in-flight request; its result will not be
    /// delivered.
    pub fn close(&mut self, index: usize) {
        if !self.trackers[index].is_busy() {
            return;
        }

        let seq = self.trackers[index].seq();
        let kind = match self.trackers[index].latest_event() {
            TrackerEvent::Scrape => RequestKind::Scrape,
            other => RequestKind::Announce(other.announce_event().unwrap_or(AnnounceEvent::None)),
        };

        self.trackers[index].clear_busy();
        self.cancels.push(RequestTicket {
            tracker: index,
            seq,
            kind,
        });
    }

    /// Stops tracking the in-flight request without cancelling it: it keeps
    /// running in the background and its result is dropped on arrival.
    pub fn disown(&mut self, index: usize) {
        if self.trackers[index].is_busy() {
            debug!(url = self.trackers[index].url(), "tracker request disowned");
            self.trackers[index].clear_busy();
        }
    }

    pub fn close_all(&mut self) {
        for index in 0..self.trackers.len() {
            self.close(index);
        }
    }

    /// Closes every busy tracker whose latest event bit is not in
    /// `event_bitmap`.
    pub fn close_all_excluding(&mut self, event_bitmap: u32) {
        for index in 0..self.trackers.len() {
            if self.trackers[index].latest_event().bit() & event_bitmap == 0 {
                self.close(index);
            }
        }
    }

    /// Disowns every busy tracker whose latest event bit is in
    /// `event_bitmap`.
    pub fn disown_all_including(&mut self, event_bitmap: u32) {
        for index in 0..self.trackers.len() {
            if self.trackers[index].latest_event().bit() & event_bitmap != 0 {
                self.disown(index);
            }
        }
    }

    pub fn clear_stats(&mut self) {
        for tracker in &mut self.trackers {
            tracker.clear_stats();
        }
    }

    pub fn set_dht_available(&mut self, available: bool) {
        for tracker in &mut self.trackers {
            if tracker.kind() == super::tracker::TrackerKind::Dht {
                tracker.set_service_available(available);
            }
        }
    }

    /// Requests queued since the last call, for the driver to execute.
    pub fn take_requests(&mut self) -> Vec<RequestTicket> {
        std::mem::take(&mut self.send_queue)
    }

    /// Requests cancelled since the last call, for the driver to abort.
    pub fn take_cancellations(&mut self) -> Vec<RequestTicket> {
        std::mem::take(&mut self.cancels)
    }

    /// Books a successful announce: promotes the tracker within its group,
    /// sorts and dedupes the peers and updates the counters. Returns the
    /// accepted peer list, or `None` when the result is stale.
    pub fn receive_success(
        &mut self,
        index: usize,
        seq: u64,
        reply: AnnounceReply,
        now: DurationSinceUnixEpoch,
    ) -> Option<Vec<SocketAddrV4>> {
        if !self.trackers[index].accepts_result(seq) {
            return None;
        }

        let index = self.promote(index);

        let mut peers = reply.peers;
        peers.sort_unstable();
        peers.dedup();

        info!(peers = peers.len(), url = self.trackers[index].url(), "received announce reply");

        let tracker = &mut self.trackers[index];
        #[allow(clippy::cast_possible_truncation)]
        tracker.record_success(now, peers.len() as u32);
        tracker.apply_announce_intervals(reply.interval, reply.min_interval);

        if let Some(id) = reply.tracker_id {
            tracker.set_tracker_id(id);
        }
        if let (Some(complete), Some(incomplete)) = (reply.complete, reply.incomplete) {
            tracker.record_scrape_counts(complete, incomplete);
        }

        Some(peers)
    }

    /// Books a failed announce. Returns false when the result is stale.
    pub fn receive_failed(&mut self, index: usize, seq: u64, msg: &str, now: DurationSinceUnixEpoch) -> bool {
        if !self.trackers[index].accepts_result(seq) {
            return false;
        }

        warn!(url = self.trackers[index].url(), msg, "tracker request failed");

        self.trackers[index].record_failure(now);
        true
    }

    /// Books a finished scrape. Returns false when the result is stale.
    pub fn receive_scrape_success(&mut self, index: usize, seq: u64, reply: ScrapeReply, now: DurationSinceUnixEpoch) -> bool {
        if !self.trackers[index].accepts_result(seq) {
            return false;
        }

        info!(url = self.trackers[index].url(), "received scrape reply");

        self.trackers[index].record_scrape(now, reply.complete, reply.incomplete, reply.downloaded);
        true
    }

    /// Books a failed scrape. Returns false when the result is stale.
    pub fn receive_scrape_failed(&mut self, index: usize, seq: u64, msg: &str) -> bool {
        if !self.trackers[index].accepts_result(seq) {
            return false;
        }

        warn!(url = self.trackers[index].url(), msg, "tracker scrape failed");

        self.trackers[index].clear_busy();
        true
    }
}
