//! Sliding-window acknowledgement state for the reliable sub-protocol.
//!
//! Both ends of a connection track two windows over the 16-bit sequence
//! space:
//!
//! * [`ReceiveWindow`] - what *we* have received. Holds the newest received
//!   sequence ID, a 16-bit ack bitfield covering the 16 IDs immediately
//!   before it, and a 64-bit duplicate filter covering the 64 IDs before
//!   those. Together they suppress duplicates up to 80 IDs of re-ordering
//!   and supply the fields for outbound ack datagrams.
//! * [`SendWindow`] - the remote's view of what we sent, rebuilt from inbound
//!   ack datagrams. It reports which sequence IDs became newly delivered so
//!   pending retransmission records can be dropped exactly once.
//!
//! The strategy is the Gaffer-on-Games packet-level ack scheme extended with
//! the second, wider filter window. Bit `k` of a 16-bit field means "ID
//! `last - (k + 1)` seen"; bit `k` of the duplicate filter means
//! "ID `last - (17 + k)` seen".

use tracing::warn;

use crate::seq::Seq;

/// Width of the ack bitfield window.
pub const ACK_WINDOW: i16 = 16;

/// Total filtered re-ordering distance: ack window plus duplicate filter.
pub const FILTER_WINDOW: i16 = 16 + 64;

/// Re-ordering distance at which a warning is logged, before filtering
/// actually degrades at [`FILTER_WINDOW`].
const WARN_GAP: i16 = 64;

const fn shl64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value << shift
    }
}

/// What to do with an inbound reliable message, as decided by
/// [`ReceiveWindow::receive`].
///
/// An ack is sent in every case; only delivery to the application differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvDecision {
    /// First sighting: hand the message to the application.
    Handle,
    /// Already seen within the filter window: ack again, do not deliver.
    Duplicate,
}

/// Receiver-side reliable window. See the [module docs](self).
#[derive(Debug, Clone, Default)]
pub struct ReceiveWindow {
    last_recv: Seq,
    ack_bits: u16,
    dup_bits: u64,
}

impl ReceiveWindow {
    /// Newest received sequence ID, as sent in ack datagrams.
    #[must_use]
    pub const fn last_recv(&self) -> Seq {
        self.last_recv
    }

    /// The 16-bit ack bitfield, as sent in ack datagrams.
    #[must_use]
    pub const fn ack_bits(&self) -> u16 {
        self.ack_bits
    }

    /// Whether `seq` has been seen, for any ID within the filter window.
    #[must_use]
    pub fn is_received(&self, seq: Seq) -> bool {
        let gap = self.last_recv.gap_since(seq);
        match gap {
            0 => true,
            g if (1..=ACK_WINDOW).contains(&g) => self.ack_bits & (1 << (g - 1)) != 0,
            g if (ACK_WINDOW + 1..=FILTER_WINDOW).contains(&g) => {
                self.dup_bits & (1 << (g - ACK_WINDOW - 1)) != 0
            }
            _ => false,
        }
    }

    /// Records an inbound reliable sequence ID and decides whether to deliver
    /// it.
    pub fn receive(&mut self, seq: Seq) -> RecvDecision {
        let gap = seq.gap_since(self.last_recv);

        if gap > WARN_GAP {
            warn!(
                %seq,
                last_recv = %self.last_recv,
                gap,
                "large forward sequence gap, duplicate filtering degraded"
            );
        }

        if gap > 0 {
            self.advance(gap as u32);
            self.last_recv = seq;
            return RecvDecision::Handle;
        }

        let dist = -gap;
        if dist == 0 {
            return RecvDecision::Duplicate;
        }
        if dist <= ACK_WINDOW {
            let bit = 1u16 << (dist - 1);
            if self.ack_bits & bit != 0 {
                return RecvDecision::Duplicate;
            }
            self.ack_bits |= bit;
            return RecvDecision::Handle;
        }
        if dist <= FILTER_WINDOW {
            let bit = 1u64 << (dist - ACK_WINDOW - 1);
            if self.dup_bits & bit != 0 {
                return RecvDecision::Duplicate;
            }
            self.dup_bits |= bit;
            return RecvDecision::Handle;
        }

        // older than anything we still track; cannot tell a duplicate from a
        // fresh message that took the long way around
        warn!(
            %seq,
            last_recv = %self.last_recv,
            gap,
            "sequence older than filter window, accepting"
        );
        RecvDecision::Handle
    }

    /// Slides both windows forward by `gap`, moving ack bits that fall off
    /// the 16-bit window into the duplicate filter.
    fn advance(&mut self, gap: u32) {
        if gap > FILTER_WINDOW as u32 {
            self.ack_bits = 0;
            self.dup_bits = 0;
            return;
        }

        self.dup_bits = shl64(self.dup_bits, gap);
        if gap <= ACK_WINDOW as u32 {
            // widen so the bits pushed past 16 survive the shift, then fold
            // them into the low end of the duplicate filter
            let ext = (u32::from(self.ack_bits) << gap) | (1 << (gap - 1));
            self.ack_bits = (ext & 0xFFFF) as u16;
            self.dup_bits |= u64::from(ext >> 16);
        } else {
            let into_filter = gap - ACK_WINDOW as u32;
            self.dup_bits |= shl64(u64::from(self.ack_bits), into_filter);
            self.dup_bits |= shl64(1, into_filter - 1);
            self.ack_bits = 0;
        }
    }
}

/// Sender-side view of which of our reliable sequence IDs the remote has
/// acknowledged. See the [module docs](self).
#[derive(Debug, Clone, Default)]
pub struct SendWindow {
    last_acked: Seq,
    acked_bits: u16,
}

impl SendWindow {
    /// Newest sequence ID the remote has acknowledged.
    #[must_use]
    pub const fn last_acked(&self) -> Seq {
        self.last_acked
    }

    /// Bitfield of acknowledged IDs before [`SendWindow::last_acked`].
    #[must_use]
    pub const fn acked_bits(&self) -> u16 {
        self.acked_bits
    }

    /// Folds one inbound ack (`remote_last`, `remote_bits`) into the window,
    /// returning every sequence ID that became newly acknowledged.
    ///
    /// IDs that have slid more than [`ACK_WINDOW`] behind `remote_last`
    /// without appearing here are the caller's signal to treat a still
    /// pending message as lost.
    #[must_use]
    pub fn on_ack(&mut self, remote_last: Seq, remote_bits: u16) -> Vec<Seq> {
        let mut delivered = Vec::new();
        if self.mark(remote_last) {
            delivered.push(remote_last);
        }
        for k in 0..16u16 {
            if remote_bits & (1 << k) != 0 {
                let seq = remote_last - (k + 1);
                if self.mark(seq) {
                    delivered.push(seq);
                }
            }
        }
        delivered
    }

    /// Marks a single explicitly acked ID (the `AckExtra` variant), returning
    /// whether it was newly acknowledged.
    pub fn mark(&mut self, seq: Seq) -> bool {
        let gap = seq.gap_since(self.last_acked);
        if gap > 0 {
            let gap = gap as u32;
            if gap <= ACK_WINDOW as u32 {
                let ext = (u32::from(self.acked_bits) << gap) | (1 << (gap - 1));
                self.acked_bits = (ext & 0xFFFF) as u16;
            } else {
                self.acked_bits = 0;
            }
            self.last_acked = seq;
            return true;
        }

        let dist = -gap;
        if dist == 0 {
            return false;
        }
        if dist <= ACK_WINDOW {
            let bit = 1u16 << (dist - 1);
            let newly = self.acked_bits & bit == 0;
            self.acked_bits |= bit;
            return newly;
        }
        // slid out of the window; resolution already happened (or the caller
        // will treat the message as lost)
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_all(window: &mut ReceiveWindow, seqs: &[u16]) -> Vec<RecvDecision> {
        seqs.iter().map(|&s| window.receive(Seq(s))).collect()
    }

    #[test]
    fn in_order_stream_is_handled() {
        let mut window = ReceiveWindow::default();
        for seq in 1..=100u16 {
            assert_eq!(window.receive(Seq(seq)), RecvDecision::Handle);
        }
        assert_eq!(window.last_recv(), Seq(100));
        assert_eq!(window.ack_bits(), u16::MAX);
    }

    #[test]
    fn exact_duplicate_is_suppressed() {
        let mut window = ReceiveWindow::default();
        assert_eq!(window.receive(Seq(42)), RecvDecision::Handle);
        assert_eq!(window.receive(Seq(42)), RecvDecision::Duplicate);
    }

    #[test]
    fn out_of_order_then_fill() {
        let mut window = ReceiveWindow::default();
        let decisions = recv_all(&mut window, &[3, 5, 4, 6]);
        assert!(decisions.iter().all(|d| *d == RecvDecision::Handle));
        assert_eq!(window.last_recv(), Seq(6));
        // bits for 5, 4, 3 at offsets 1, 2, 3
        assert_eq!(window.ack_bits() & 0b111, 0b111);

        assert_eq!(window.receive(Seq(4)), RecvDecision::Duplicate);
        assert_eq!(window.receive(Seq(5)), RecvDecision::Duplicate);
    }

    #[test]
    fn duplicate_behind_ack_window_hits_filter() {
        let mut window = ReceiveWindow::default();
        assert_eq!(window.receive(Seq(1)), RecvDecision::Handle);
        // jump far enough that seq 1 is past the ack window but inside the
        // duplicate filter
        assert_eq!(window.receive(Seq(41)), RecvDecision::Handle);
        assert_eq!(window.receive(Seq(1)), RecvDecision::Duplicate);
        // a never-seen ID in the same region is still handled
        assert_eq!(window.receive(Seq(2)), RecvDecision::Handle);
        assert_eq!(window.receive(Seq(2)), RecvDecision::Duplicate);
    }

    #[test]
    fn filter_tracks_across_gradual_slide() {
        let mut window = ReceiveWindow::default();
        for seq in 1..=20u16 {
            window.receive(Seq(seq));
        }
        // slide seq 1..=4 out of the ack window one step at a time
        for seq in 21..=24u16 {
            window.receive(Seq(seq));
        }
        for seq in 1..=24u16 {
            assert!(window.is_received(Seq(seq)), "seq {seq}");
        }
        assert_eq!(window.receive(Seq(2)), RecvDecision::Duplicate);
    }

    #[test]
    fn ancient_seq_is_accepted() {
        let mut window = ReceiveWindow::default();
        window.receive(Seq(200));
        // 119 IDs behind: outside the 80-wide filter
        assert_eq!(window.receive(Seq(81)), RecvDecision::Handle);
    }

    #[test]
    fn forward_jump_past_filter_resets_windows() {
        let mut window = ReceiveWindow::default();
        window.receive(Seq(1));
        window.receive(Seq(200));
        assert_eq!(window.last_recv(), Seq(200));
        assert_eq!(window.ack_bits(), 0);
        // seq 1 slid out entirely, so it is no longer filtered
        assert_eq!(window.receive(Seq(1)), RecvDecision::Handle);
    }

    #[test]
    fn works_across_wraparound() {
        let mut window = ReceiveWindow::default();
        window.receive(Seq(u16::MAX - 1));
        window.receive(Seq(u16::MAX));
        window.receive(Seq(0));
        window.receive(Seq(1));
        assert_eq!(window.last_recv(), Seq(1));
        assert!(window.is_received(Seq(u16::MAX)));
        assert_eq!(window.receive(Seq(u16::MAX)), RecvDecision::Duplicate);
    }

    #[test]
    fn send_window_cumulative_ack() {
        let mut window = SendWindow::default();
        let delivered = window.on_ack(Seq(3), 0b011);
        let mut sorted = delivered.clone();
        sorted.sort();
        assert_eq!(sorted, vec![Seq(1), Seq(2), Seq(3)]);

        // replaying the same ack resolves nothing new
        assert!(window.on_ack(Seq(3), 0b011).is_empty());
    }

    #[test]
    fn send_window_ack_extra() {
        let mut window = SendWindow::default();
        assert!(window.on_ack(Seq(5), 0).contains(&Seq(5)));
        // explicit ack for an older ID
        assert!(window.mark(Seq(3)));
        assert!(!window.mark(Seq(3)));
    }

    #[test]
    fn send_window_stale_ack_is_inert() {
        let mut window = SendWindow::default();
        let _ = window.on_ack(Seq(50), u16::MAX);
        assert!(window.on_ack(Seq(49), u16::MAX).is_empty());
    }
}
