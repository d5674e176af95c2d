//! See [`RttEstimator`].

use web_time::Duration;

/// Retry delay used before any RTT sample exists.
const DEFAULT_RETRY: Duration = Duration::from_millis(50);

/// Floor on the retry delay, so a very fast link does not spin resends.
const MIN_RETRY: Duration = Duration::from_millis(10);

/// Round-trip time estimate for one connection, fed by heartbeat echoes.
///
/// Keeps the latest raw sample and an exponential moving average weighted
/// 0.7 on history, 0.3 on the new sample. The first sample seeds the average
/// directly.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    latest: Option<Duration>,
    smoothed: Option<Duration>,
}

impl RttEstimator {
    /// Latest raw sample, if any heartbeat has completed.
    #[must_use]
    pub const fn latest(&self) -> Option<Duration> {
        self.latest
    }

    /// Smoothed estimate, if any heartbeat has completed.
    #[must_use]
    pub const fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    /// Latest sample in whole milliseconds, clamped to the 16-bit field that
    /// heartbeats carry.
    #[must_use]
    pub fn latest_ms(&self) -> u16 {
        self.latest
            .map_or(0, |rtt| rtt.as_millis().min(u128::from(u16::MAX)) as u16)
    }

    /// Feeds one round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        self.latest = Some(sample);
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(smoothed) => (smoothed * 7 + sample * 3) / 10,
        });
    }

    /// Delay before retransmitting an unacknowledged reliable message:
    /// `max(10 ms, smooth_rtt * 1.2)`, or 50 ms with no estimate yet.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.smoothed
            .map_or(DEFAULT_RETRY, |rtt| (rtt * 6 / 5).max(MIN_RETRY))
    }

    /// Half the smoothed estimate; a resend firing within this of the
    /// previous send is deferred instead.
    #[must_use]
    pub fn half_rtt(&self) -> Duration {
        self.smoothed.unwrap_or(DEFAULT_RETRY) / 2
    }
}
