//! Tracking state for the notify send mode.
//!
//! Notify trades retransmission away for ordering plus fate reporting: a
//! notify message is sent exactly once, the receiver delivers notifies in
//! strictly increasing sequence order (dropping anything older than the
//! newest seen), and every notify datagram piggybacks the receiver's state so
//! the sender can resolve each outstanding message as *delivered* or *lost*.
//!
//! On the wire the piggybacked state is 24 bits: the 16-bit newest received
//! notify sequence ID, then an 8-bit bitfield where bit `k` means
//! "`last - (k + 1)` was received".

use std::collections::VecDeque;

use crate::seq::Seq;

const fn shl64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value << shift
    }
}

/// Receiver-side notify state: the newest delivered sequence ID and a 64-bit
/// window of prior receipts (of which the low 8 bits travel on the wire).
#[derive(Debug, Clone, Default)]
pub struct NotifyRecv {
    last_recv: Seq,
    recv_bits: u64,
}

impl NotifyRecv {
    /// Newest received notify sequence ID.
    #[must_use]
    pub const fn last_recv(&self) -> Seq {
        self.last_recv
    }

    /// The 8 bits of receipt history that travel in each notify datagram.
    #[must_use]
    pub const fn wire_bits(&self) -> u8 {
        (self.recv_bits & 0xFF) as u8
    }

    /// Records an inbound notify sequence ID, returning whether to deliver
    /// it.
    ///
    /// Anything not strictly newer than the newest seen is dropped, which is
    /// what makes delivered notifies strictly increasing.
    pub fn receive(&mut self, seq: Seq) -> bool {
        let gap = seq.gap_since(self.last_recv);
        if gap <= 0 {
            return false;
        }
        self.recv_bits = shl64(self.recv_bits, gap as u32) | shl64(1, gap as u32 - 1);
        self.last_recv = seq;
        true
    }
}

/// How a sent notify message was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyFate {
    /// The receiver reported it delivered.
    Delivered,
    /// The receiver moved past it without delivering it.
    Lost,
}

/// Sender-side notify state: outstanding sequence IDs awaiting resolution.
#[derive(Debug, Clone, Default)]
pub struct NotifySend {
    /// Unresolved sent notify sequence IDs, oldest first. Sends happen in
    /// sequence order so this stays sorted by construction.
    outstanding: VecDeque<Seq>,
}

impl NotifySend {
    /// Records a freshly sent notify sequence ID.
    pub fn sent(&mut self, seq: Seq) {
        self.outstanding.push_back(seq);
    }

    /// Number of sent notifies not yet resolved.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Resolves outstanding notifies against the receiver state carried in an
    /// inbound notify datagram, reporting each resolution oldest-first.
    ///
    /// Everything at or before `remote_last` is resolvable: `remote_last`
    /// itself was delivered, an ID within the 8-bit window is delivered iff
    /// its bit is set, and anything else the receiver has moved past without
    /// acknowledging is lost. IDs newer than `remote_last` stay outstanding.
    pub fn on_ack(&mut self, remote_last: Seq, remote_bits: u8) -> Vec<(Seq, NotifyFate)> {
        let mut resolved = Vec::new();
        while let Some(&seq) = self.outstanding.front() {
            let dist = remote_last.gap_since(seq);
            if dist < 0 {
                break;
            }
            self.outstanding.pop_front();

            let fate = if dist == 0 {
                NotifyFate::Delivered
            } else if dist <= 8 && remote_bits & (1 << (dist - 1)) != 0 {
                NotifyFate::Delivered
            } else {
                NotifyFate::Lost
            };
            resolved.push((seq, fate));
        }
        resolved
    }
}
