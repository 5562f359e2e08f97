//! Token-bucket rate gate for the DHT's UDP traffic.
use swarm_discovery_primitives::DurationSinceUnixEpoch;

/// Byte budget refilled once per second up to one second's worth of rate.
///
/// A rate of zero disables the gate entirely. When the quota runs out the
/// caller leaves its packets queued and retries after the next refill.
#[derive(Debug)]
pub struct Throttle {
    rate: u32,
    quota: u32,
    last_refill: DurationSinceUnixEpoch,
}

impl Throttle {
    #[must_use]
    pub fn new(rate: u32, now: DurationSinceUnixEpoch) -> Throttle {
        Throttle {
            rate,
            quota: rate,
            last_refill: now,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Adds the seconds elapsed since the last refill to the quota, capped
    /// at one second's worth of rate.
    pub fn refill(&mut self, now: DurationSinceUnixEpoch) {
        if self.is_unlimited() {
            return;
        }

        let elapsed = now.saturating_sub(self.last_refill).as_secs();
        if elapsed == 0 {
            return;
        }

        self.last_refill = now;

        let refilled = u64::from(self.rate).saturating_mul(elapsed);
        self.quota = u64::from(self.quota).saturating_add(refilled).min(u64::from(self.rate)) as u32;
    }

    /// Takes `bytes` from the quota, or refuses without consuming anything.
    pub fn try_consume(&mut self, bytes: u32) -> bool {
        if self.is_unlimited() {
            return true;
        }

        if bytes > self.quota {
            return false;
        }

        self.quota -= bytes;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Throttle;

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn it_should_not_limit_with_a_zero_rate() {
        let mut throttle = Throttle::new(0, at(0));

        assert!(throttle.try_consume(u32::MAX));
        assert!(throttle.try_consume(u32::MAX));
    }

    #[test]
    fn it_should_refuse_once_the_quota_is_spent() {
        let mut throttle = Throttle::new(1000, at(0));

        assert!(throttle.try_consume(800));
        assert!(!throttle.try_consume(300));
        // The refused consume took nothing.
        assert!(throttle.try_consume(200));
    }

    #[test]
    fn it_should_refill_once_per_second_up_to_the_rate() {
        let mut throttle = Throttle::new(1000, at(10));
        assert!(throttle.try_consume(1000));

        // Within the same second nothing comes back.
        throttle.refill(at(10));
        assert!(!throttle.try_consume(1));

        throttle.refill(at(11));
        assert!(throttle.try_consume(1000));

        // A long idle period does not accumulate beyond one second's worth.
        throttle.refill(at(60));
        assert!(throttle.try_consume(1000));
        assert!(!throttle.try_consume(1));
    }
}
