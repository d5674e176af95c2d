//! Per-connection rolling counters and loss estimation.

/// Counters for one connection, updated on every datagram that crosses it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Payload bytes handed to the transport.
    pub bytes_sent: u64,
    /// Payload bytes received from the transport.
    pub bytes_recv: u64,
    /// Unreliable user messages sent.
    pub unreliable_sent: u64,
    /// Unreliable user messages received.
    pub unreliable_recv: u64,
    /// Reliable user messages sent (first attempts only).
    pub reliable_sent: u64,
    /// Reliable user messages delivered to the application.
    pub reliable_recv: u64,
    /// Retransmissions of reliable messages.
    pub resends: u64,
    /// Notify messages sent.
    pub notify_sent: u64,
    /// Notify messages delivered to the application.
    pub notify_recv: u64,
    /// Sent notifies resolved as delivered.
    pub notify_delivered: u64,
    /// Sent notifies resolved as lost.
    pub notify_lost: u64,
    loss: RollingLoss,
}

impl ConnectionMetrics {
    /// Records one notify resolution into the rolling loss window.
    pub fn record_notify_fate(&mut self, lost: bool) {
        if lost {
            self.notify_lost += 1;
        } else {
            self.notify_delivered += 1;
        }
        self.loss.push(lost);
    }

    /// Fraction of the last up-to-64 resolved notify messages that were
    /// lost, in `0.0..=1.0`. Returns 0 before any resolution.
    #[must_use]
    pub fn loss_rate(&self) -> f32 {
        self.loss.rate()
    }
}

/// Loss tracker over the most recent 64 notify resolutions: one bit per
/// resolution plus two counters, per the wire-level bookkeeping style used
/// everywhere else in the reliability engine.
#[derive(Debug, Clone, Default)]
struct RollingLoss {
    bits: u64,
    filled: u32,
    lost: u32,
}

impl RollingLoss {
    fn push(&mut self, lost: bool) {
        if self.filled == 64 {
            if self.bits >> 63 != 0 {
                self.lost -= 1;
            }
        } else {
            self.filled += 1;
        }
        self.bits = (self.bits << 1) | u64::from(lost);
        if lost {
            self.lost += 1;
        }
    }

    fn rate(&self) -> f32 {
        if self.filled == 0 {
            0.0
        } else {
            self.lost as f32 / self.filled as f32
        }
    }
}
