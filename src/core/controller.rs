//! Scheduling brain over a [`TrackerList`].
//!
//! The controller tracks four mode bits (active, requesting, promiscuous,
//! failure) plus one pending event, and owns the two timer deadlines: one
//! for announces and one for scrapes. A driver task asks for the earliest
//! deadline, sleeps, and calls [`TrackerController::do_timeout`] /
//! [`TrackerController::do_scrape`] when due.
//!
//! `started` goes promiscuous: the event is broadcast group by group until
//! the first success. `stopped` and `completed` go to every tracker that is
//! in use and are disowned by default on close, so a shutdown does not wait
//! for (or cancel) those courtesy notifications.
use std::net::SocketAddrV4;
use std::time::Duration;

use swarm_discovery_primitives::DurationSinceUnixEpoch;
use tracing::{debug, info};

use super::tracker::{Tracker, TrackerKind};
use super::tracker_list::TrackerList;
use super::{AnnounceReply, ScrapeReply, TrackerEvent};

/// Not scheduled / no candidate sentinel for relative timeouts.
const NEVER: u64 = u64::MAX;

type SuccessSlot = Box<dyn FnMut(&[SocketAddrV4]) + Send>;
type FailureSlot = Box<dyn FnMut(&str) + Send>;

pub struct TrackerController {
    flags: u32,
    tracker_list: TrackerList,

    task_timeout: Option<DurationSinceUnixEpoch>,
    task_scrape: Option<DurationSinceUnixEpoch>,

    /// Announce attempts that failed since the last success, across the
    /// whole list; drives the backoff once every candidate was tried.
    failed_requests: u32,
    num_requests: u32,

    slot_success: Option<SuccessSlot>,
    slot_failure: Option<FailureSlot>,
}

impl TrackerController {
    pub const FLAG_SEND_UPDATE: u32 = 0x1;
    pub const FLAG_SEND_COMPLETED: u32 = 0x2;
    pub const FLAG_SEND_START: u32 = 0x4;
    pub const FLAG_SEND_STOP: u32 = 0x8;

    pub const FLAG_ACTIVE: u32 = 0x10;
    pub const FLAG_REQUESTING: u32 = 0x20;
    pub const FLAG_FAILURE_MODE: u32 = 0x40;
    pub const FLAG_PROMISCUOUS_MODE: u32 = 0x80;

    pub const MASK_SEND: u32 = Self::FLAG_SEND_UPDATE | Self::FLAG_SEND_START | Self::FLAG_SEND_STOP | Self::FLAG_SEND_COMPLETED;

    pub const ENABLE_DONT_RESET_STATS: u32 = 0x1;

    #[must_use]
    pub fn new(tracker_list: TrackerList) -> TrackerController {
        TrackerController {
            flags: 0,
            tracker_list,
            task_timeout: None,
            task_scrape: None,
            failed_requests: 0,
            num_requests: 0,
            slot_success: None,
            slot_failure: None,
        }
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flags & Self::FLAG_ACTIVE != 0
    }

    #[must_use]
    pub fn is_requesting(&self) -> bool {
        self.flags & Self::FLAG_REQUESTING != 0
    }

    #[must_use]
    pub fn is_failure_mode(&self) -> bool {
        self.flags & Self::FLAG_FAILURE_MODE != 0
    }

    #[must_use]
    pub fn is_promiscuous_mode(&self) -> bool {
        self.flags & Self::FLAG_PROMISCUOUS_MODE != 0
    }

    #[must_use]
    pub fn tracker_list(&self) -> &TrackerList {
        &self.tracker_list
    }

    #[must_use]
    pub fn tracker_list_mut(&mut self) -> &mut TrackerList {
        &mut self.tracker_list
    }

    #[must_use]
    pub fn next_timeout(&self) -> Option<DurationSinceUnixEpoch> {
        self.task_timeout
    }

    #[must_use]
    pub fn next_scrape(&self) -> Option<DurationSinceUnixEpoch> {
        self.task_scrape
    }

    pub fn set_slot_success(&mut self, slot: SuccessSlot) {
        self.slot_success = Some(slot);
    }

    pub fn set_slot_failure(&mut self, slot: FailureSlot) {
        self.slot_failure = Some(slot);
    }

    fn update_timeout(&mut self, now: DurationSinceUnixEpoch, seconds_to_next: u64) {
        assert!(self.is_active(), "cannot set timeout when inactive");

        self.task_timeout = Some(now + Duration::from_secs(seconds_to_next));
    }

    fn current_send_state(&self) -> TrackerEvent {
        match self.flags & Self::MASK_SEND {
            Self::FLAG_SEND_START => TrackerEvent::Started,
            Self::FLAG_SEND_STOP => TrackerEvent::Stopped,
            Self::FLAG_SEND_COMPLETED => TrackerEvent::Completed,
            _ => TrackerEvent::None,
        }
    }

    /// Asks for peers as soon as allowed: immediately when `force`, else
    /// no earlier than the last connection plus the minimum interval.
    pub fn manual_request(&mut self, now: DurationSinceUnixEpoch, force: bool) {
        if self.task_timeout.is_none() || !self.is_active() {
            return;
        }

        let seconds = if force { 0 } else { self.seconds_to_min_interval(now) };

        self.update_timeout(now, seconds);
    }

    fn seconds_to_min_interval(&self, now: DurationSinceUnixEpoch) -> u64 {
        let mut earliest = NEVER;

        for tracker in self.tracker_list.iter().filter(|t| t.is_usable()) {
            let allowed = tracker.activity_time_last() + Duration::from_secs(u64::from(tracker.min_interval()));
            earliest = earliest.min(allowed.saturating_sub(now).as_secs());
        }

        if earliest == NEVER {
            0
        } else {
            earliest
        }
    }

    /// Schedules a scrape round after the given delay.
    pub fn scrape_request(&mut self, now: DurationSinceUnixEpoch, seconds_to_request: u64) {
        self.task_scrape = Some(now + Duration::from_secs(seconds_to_request));
    }

    pub fn send_start_event(&mut self, now: DurationSinceUnixEpoch) {
        self.flags &= !Self::MASK_SEND;
        self.flags |= Self::FLAG_SEND_START;

        if !self.is_active() || !self.tracker_list.has_usable() {
            info!("queueing started event");
            return;
        }

        info!("sending started event");

        self.close(now, TrackerEvent::Stopped.bit() | TrackerEvent::Completed.bit());

        if let Some(first) = self.tracker_list.find_usable_from(0) {
            self.tracker_list.send_state(first, TrackerEvent::Started, now);
        }

        if self.tracker_list.count_usable() > 1 {
            self.flags |= Self::FLAG_PROMISCUOUS_MODE;
            self.update_timeout(now, 3);
        }
    }

    pub fn send_stop_event(&mut self, now: DurationSinceUnixEpoch) {
        self.flags &= !Self::MASK_SEND;

        if !self.is_active() || !self.tracker_list.has_usable() {
            info!("skipping stopped event as no tracker needs it");
            return;
        }

        self.flags |= Self::FLAG_SEND_STOP;

        info!("sending stopped event");

        self.close(now, TrackerEvent::Stopped.bit() | TrackerEvent::Completed.bit());

        for index in 0..self.tracker_list.len() {
            if self.tracker_list.get(index).is_in_use() {
                self.tracker_list.send_state(index, TrackerEvent::Stopped, now);
            }
        }
    }

    pub fn send_completed_event(&mut self, now: DurationSinceUnixEpoch) {
        self.flags &= !Self::MASK_SEND;
        self.flags |= Self::FLAG_SEND_COMPLETED;

        if !self.is_active() || !self.tracker_list.has_usable() {
            info!("queueing completed event");
            return;
        }

        info!("sending completed event");

        self.close(now, TrackerEvent::Stopped.bit() | TrackerEvent::Completed.bit());

        for index in 0..self.tracker_list.len() {
            if self.tracker_list.get(index).is_in_use() {
                self.tracker_list.send_state(index, TrackerEvent::Completed, now);
            }
        }
    }

    pub fn send_update_event(&mut self, now: DurationSinceUnixEpoch) {
        if !self.is_active() || !self.tracker_list.has_usable() {
            return;
        }

        if self.flags & Self::MASK_SEND != 0 && self.tracker_list.has_active() {
            return;
        }

        if self.flags & Self::MASK_SEND == 0 {
            self.flags |= Self::FLAG_SEND_UPDATE;
        }

        info!("sending update event");

        if let Some(first) = self.tracker_list.find_usable_from(0) {
            self.tracker_list.send_state(first, TrackerEvent::None, now);
        }
    }

    /// Stops requesting and cancels in-flight announces. Pending stop and
    /// completed notifications named in `disown_bitmap` are left running in
    /// the background instead of being cancelled.
    pub fn close(&mut self, _now: DurationSinceUnixEpoch, disown_bitmap: u32) {
        self.flags &= !(Self::FLAG_REQUESTING | Self::FLAG_PROMISCUOUS_MODE);

        if disown_bitmap != 0 {
            self.tracker_list.disown_all_including(disown_bitmap);
        }

        self.tracker_list.close_all();
        self.task_timeout = None;
    }

    pub fn enable(&mut self, now: DurationSinceUnixEpoch, enable_flags: u32) {
        if self.is_active() {
            return;
        }

        // Clearing send stop here in case we cycle disable/enable too fast.
        self.flags |= Self::FLAG_ACTIVE;
        self.flags &= !Self::FLAG_SEND_STOP;

        self.tracker_list.close_all_excluding(TrackerEvent::Completed.bit());

        if enable_flags & Self::ENABLE_DONT_RESET_STATS == 0 {
            self.tracker_list.clear_stats();
        }

        info!(trackers = self.tracker_list.len(), "tracker controller enabled");

        self.update_timeout(now, 0);
    }

    pub fn disable(&mut self) {
        if !self.is_active() {
            return;
        }

        self.flags &= !(Self::FLAG_ACTIVE | Self::FLAG_REQUESTING | Self::FLAG_PROMISCUOUS_MODE);

        self.tracker_list
            .close_all_excluding(TrackerEvent::Stopped.bit() | TrackerEvent::Completed.bit());
        self.task_timeout = None;

        info!(trackers = self.tracker_list.len(), "tracker controller disabled");
    }

    /// The caller wants more peers: harvest alternates at a faster cadence.
    pub fn start_requesting(&mut self, now: DurationSinceUnixEpoch) {
        if self.is_requesting() {
            return;
        }

        self.flags |= Self::FLAG_REQUESTING;

        if self.is_active() {
            self.update_timeout(now, 0);
        }

        debug!("start requesting");
    }

    pub fn stop_requesting(&mut self) {
        if !self.is_requesting() {
            return;
        }

        self.flags &= !Self::FLAG_REQUESTING;

        debug!("stop requesting");
    }

    pub fn do_timeout(&mut self, now: DurationSinceUnixEpoch) {
        if !self.is_active() || !self.tracker_list.has_usable() {
            return;
        }

        self.task_timeout = None;

        let send_event = self.current_send_state();

        if self.flags & (Self::FLAG_PROMISCUOUS_MODE | Self::FLAG_REQUESTING) != 0 {
            self.do_timeout_promiscuous(now, send_event);
        } else {
            self.do_timeout_normal(now, send_event);
        }
    }

    /// One announce per group to the preferred candidate whose own timeout
    /// has expired, rescheduling at the earliest not-yet-due candidate.
    fn do_timeout_promiscuous(&mut self, now: DurationSinceUnixEpoch, send_event: TrackerEvent) {
        let mut next_timeout = NEVER;
        let mut index = 0;

        while index < self.tracker_list.len() {
            let group = self.tracker_list.get(index).group();
            let group_end = self.tracker_list.end_group(group);

            if self.tracker_list.has_active_not_scrape_in_group(group) {
                index = group_end;
                continue;
            }

            let head = self.tracker_list.get(index);
            let mut preferred = index;

            if !head.is_usable() || head.failed_counter() != 0 {
                // The head of the group is disabled or unreachable; pick the
                // least recently active alternate that is due.
                preferred = self.find_preferred(index, group_end, now, &mut next_timeout);
            } else {
                let tracker_timeout = tracker_next_timeout_promiscuous(head, now);

                if tracker_timeout != 0 {
                    next_timeout = next_timeout.min(tracker_timeout);
                    preferred = group_end;
                }
            }

            if preferred != group_end {
                self.tracker_list.send_state(preferred, send_event, now);
            }

            index = group_end;
        }

        if next_timeout != NEVER {
            let floor = if self.is_requesting() && !self.is_promiscuous_mode() {
                30
            } else {
                0
            };
            self.update_timeout(now, next_timeout.max(floor));
        }
    }

    fn find_preferred(&self, first: usize, last: usize, now: DurationSinceUnixEpoch, next_timeout: &mut u64) -> usize {
        let mut preferred = last;
        let mut preferred_time_last = DurationSinceUnixEpoch::MAX;

        for index in first..last {
            let tracker = self.tracker_list.get(index);
            let tracker_timeout = tracker_next_timeout_promiscuous(tracker, now);

            if tracker_timeout != 0 {
                *next_timeout = (*next_timeout).min(tracker_timeout);
                continue;
            }

            if tracker.activity_time_last() < preferred_time_last {
                preferred = index;
                preferred_time_last = tracker.activity_time_last();
            }
        }

        preferred
    }

    fn do_timeout_normal(&mut self, now: DurationSinceUnixEpoch, send_event: TrackerEvent) {
        match self.tracker_list.find_next_to_request(0) {
            None => {
                // Every candidate has been tried since the last success;
                // back off before walking the list again.
                let backoff = (3 + 20 * u64::from(self.failed_requests)).min(300);
                self.update_timeout(now, backoff);
            }
            Some(index) => {
                let next = self.tracker_list.get(index).activity_time_next();

                if next <= now {
                    self.tracker_list.send_state(index, send_event, now);
                } else {
                    // Round up so a sub-second remainder cannot reschedule
                    // at the current instant.
                    let wait = next.saturating_sub(now);
                    self.update_timeout(now, wait.as_secs() + u64::from(wait.subsec_nanos() > 0));
                }
            }
        }
    }

    /// One scrape per group that has no request running.
    pub fn do_scrape(&mut self, now: DurationSinceUnixEpoch) {
        self.task_scrape = None;

        let mut index = 0;

        while index < self.tracker_list.len() {
            let group = self.tracker_list.get(index).group();
            let group_end = self.tracker_list.end_group(group);

            if self.tracker_list.has_active_in_group(group) {
                index = group_end;
                continue;
            }

            for candidate in index..group_end {
                let tracker = self.tracker_list.get(candidate);
                if tracker.can_scrape() && tracker.is_usable() {
                    self.tracker_list.send_scrape(candidate, now);
                    break;
                }
            }

            index = group_end;
        }
    }

    /// Books a successful announce and relays the peers to the success
    /// slot. Results are routed by their request generation, so they find
    /// their tracker even after promotions reordered the list; stale
    /// results are dropped silently.
    pub fn receive_success(&mut self, seq: u64, reply: AnnounceReply, now: DurationSinceUnixEpoch) {
        let Some(index) = self.tracker_list.find_by_seq(seq) else {
            return;
        };

        let group = self.tracker_list.get(index).group();

        let Some(peers) = self.tracker_list.receive_success(index, seq, reply, now) else {
            return;
        };

        if !self.is_active() {
            self.deliver_success(&peers);
            return;
        }

        self.flags &= !(Self::MASK_SEND | Self::FLAG_PROMISCUOUS_MODE | Self::FLAG_FAILURE_MODE);
        self.failed_requests = 0;

        self.num_requests = if self.is_requesting() { self.num_requests + 1 } else { 1 };

        if self.is_requesting() {
            self.update_timeout(now, 30);
        } else if !self.tracker_list.has_active() {
            // The replying tracker sits at the front of its group now.
            let promoted = self.tracker_list.begin_group(group);
            let interval = self.tracker_list.get(promoted).normal_interval();
            self.update_timeout(now, u64::from(interval));
        }

        self.deliver_success(&peers);
    }

    /// Books a failed announce, enters failure mode when a previously
    /// healthy tracker turned bad, and immediately tries the next
    /// candidate.
    pub fn receive_failure(&mut self, seq: u64, msg: &str, now: DurationSinceUnixEpoch) {
        let Some(index) = self.tracker_list.find_by_seq(seq) else {
            return;
        };

        if !self.tracker_list.receive_failed(index, seq, msg, now) {
            return;
        }

        if !self.is_active() {
            self.deliver_failure(msg);
            return;
        }

        let tracker = self.tracker_list.get(index);

        if tracker.failed_counter() == 1 && tracker.success_counter() > 0 {
            self.flags |= Self::FLAG_FAILURE_MODE;
        }

        if tracker.kind() != TrackerKind::Dht {
            self.failed_requests += 1;
        }

        self.do_timeout(now);
        self.deliver_failure(msg);
    }

    pub fn receive_scrape_success(&mut self, seq: u64, reply: ScrapeReply, now: DurationSinceUnixEpoch) {
        if let Some(index) = self.tracker_list.find_by_seq(seq) {
            self.tracker_list.receive_scrape_success(index, seq, reply, now);
        }
    }

    pub fn receive_scrape_failed(&mut self, seq: u64, msg: &str) {
        if let Some(index) = self.tracker_list.find_by_seq(seq) {
            self.tracker_list.receive_scrape_failed(index, seq, msg);
        }
    }

    fn deliver_success(&mut self, peers: &[SocketAddrV4]) {
        if let Some(slot) = &mut self.slot_success {
            slot(peers);
        }
    }

    fn deliver_failure(&mut self, msg: &str) {
        if let Some(slot) = &mut self.slot_failure {
            slot(msg);
        }
    }
}

/// Seconds until the tracker may be contacted in promiscuous or requesting
/// mode, `NEVER` when it cannot be contacted at all.
fn tracker_next_timeout_promiscuous(tracker: &Tracker, now: DurationSinceUnixEpoch) -> u64 {
    if tracker.is_busy_not_scrape() || !tracker.is_usable() {
        return NEVER;
    }

    let interval = if tracker.failed_counter() != 0 {
        5u64 << tracker.failed_counter().saturating_sub(1).min(6)
    } else {
        u64::from(tracker.normal_interval())
    };

    let min_interval = u64::from(tracker.min_interval()).max(300);
    let use_interval = interval.min(min_interval);

    let since_last = now.saturating_sub(tracker.activity_time_last()).as_secs();

    use_interval.saturating_sub(since_last)
}
