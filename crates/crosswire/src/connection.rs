//! See [`Connection`].

use ahash::AHashMap;
use tracing::{trace, warn};
use web_time::{Duration, Instant};

use crate::{
    ack::{ReceiveWindow, RecvDecision, SendWindow},
    header::{HeaderKind, SendMode, KIND_BITS},
    metrics::ConnectionMetrics,
    msg::Message,
    notify::{NotifyFate, NotifyRecv, NotifySend},
    rtt::RttEstimator,
    seq::Seq,
    transport::EndpointId,
};

/// Bit position of the 16-bit sequence ID in a reliable datagram.
pub(crate) const RELIABLE_SEQ_BIT: u32 = KIND_BITS;
/// Bit positions of the notify header fields: newest received notify seq,
/// 8-bit receipt bitfield, then this datagram's own sequence ID.
pub(crate) const NOTIFY_LAST_RECV_BIT: u32 = KIND_BITS;
pub(crate) const NOTIFY_RECV_BITS_BIT: u32 = KIND_BITS + 16;
pub(crate) const NOTIFY_SEQ_BIT: u32 = KIND_BITS + 24;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; also the terminal state after any disconnect.
    NotConnected,
    /// Handshake in progress. Client side: sending `Connect` attempts.
    /// Server side: waiting for the `Welcome` echo.
    Connecting,
    /// Handshake deferred: the server's application has not yet accepted or
    /// rejected this connection.
    Pending,
    /// Fully connected; heartbeats and user traffic flow.
    Connected,
}

/// An outbound reliable datagram awaiting acknowledgement.
#[derive(Debug)]
struct PendingMessage {
    payload: Vec<u8>,
    last_send: Instant,
    attempts: u32,
}

/// A datagram prepared for the transport by [`Connection::prepare_send`].
#[derive(Debug)]
pub(crate) struct Prepared {
    pub payload: Vec<u8>,
    /// Sequence ID assigned, for reliable (schedule a resend) and notify
    /// (fate is reported against it) sends.
    pub seq: Option<Seq>,
}

/// Outcome of a retransmission attempt.
#[derive(Debug)]
pub(crate) enum Retry {
    /// Send this payload again and schedule the next retry.
    Resend(Vec<u8>),
    /// Too soon after the previous send; re-check at the returned time.
    Defer(Instant),
    /// The message exceeded its send attempts.
    Undeliverable,
    /// The message was acknowledged (or the connection cleared) in the
    /// meantime.
    Cleared,
}

/// State for one remote peer: reliability windows, pending retransmissions,
/// notify trackers, RTT estimate, and lifecycle bookkeeping.
///
/// The owning peer is the only mutator; everything here is driven from its
/// `update` tick.
#[derive(Debug)]
pub struct Connection {
    endpoint: EndpointId,
    /// Server-assigned client ID; 0 until the handshake assigns one.
    id: u16,
    state: ConnectionState,
    /// Last time any datagram arrived from this endpoint.
    last_heard: Instant,
    /// When the current state was entered, for handshake timeouts.
    state_since: Instant,
    rtt: RttEstimator,

    // reliable + notify share one outbound ID space; 0 is never assigned so
    // that fresh windows (which start at 0) never collide with a real ID
    next_out_seq: Seq,
    recv_window: ReceiveWindow,
    send_window: SendWindow,
    pending: AHashMap<u16, PendingMessage>,

    notify_recv: NotifyRecv,
    notify_send: NotifySend,

    next_ping_id: u8,
    outstanding_ping: Option<(u8, Instant)>,

    metrics: ConnectionMetrics,
}

impl Connection {
    pub(crate) fn new(endpoint: EndpointId, now: Instant) -> Self {
        Self {
            endpoint,
            id: 0,
            state: ConnectionState::Connecting,
            last_heard: now,
            state_since: now,
            rtt: RttEstimator::default(),
            next_out_seq: Seq(1),
            recv_window: ReceiveWindow::default(),
            send_window: SendWindow::default(),
            pending: AHashMap::new(),
            notify_recv: NotifyRecv::default(),
            notify_send: NotifySend::default(),
            next_ping_id: 0,
            outstanding_ping: None,
            metrics: ConnectionMetrics::default(),
        }
    }

    /// Transport endpoint this connection talks to.
    #[must_use]
    pub const fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Server-assigned client ID, or 0 if none has been assigned yet.
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            self.state = state;
            self.state_since = now;
        }
    }

    /// When the current state was entered.
    pub(crate) const fn state_since(&self) -> Instant {
        self.state_since
    }

    /// Round-trip time estimate.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Rolling traffic counters.
    #[must_use]
    pub const fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut ConnectionMetrics {
        &mut self.metrics
    }

    /// Sent reliable messages not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn note_heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    pub(crate) const fn last_heard(&self) -> Instant {
        self.last_heard
    }

    pub(crate) fn note_recv_bytes(&mut self, len: usize) {
        self.metrics.bytes_recv += len as u64;
    }

    //
    // outbound
    //

    /// Serializes a user message for this connection, assigning a sequence ID
    /// and registering retransmission state as the send mode requires.
    pub(crate) fn prepare_send(&mut self, msg: &mut Message, now: Instant) -> Prepared {
        let Some(mode) = msg.send_mode() else {
            warn!(kind = %msg.kind(), "prepare_send on a protocol datagram, sending raw");
            return Prepared {
                payload: self.prepare_raw(msg),
                seq: None,
            };
        };
        match mode {
            SendMode::Unreliable => {
                let payload = msg.to_wire();
                self.metrics.unreliable_sent += 1;
                self.metrics.bytes_sent += payload.len() as u64;
                Prepared { payload, seq: None }
            }
            SendMode::Reliable => {
                let seq = self.next_out_seq.next();
                msg.set_bits(u64::from(seq.0), 16, RELIABLE_SEQ_BIT);
                let payload = msg.to_wire();
                self.metrics.reliable_sent += 1;
                self.metrics.bytes_sent += payload.len() as u64;
                self.pending.insert(
                    seq.0,
                    PendingMessage {
                        payload: payload.clone(),
                        last_send: now,
                        attempts: 1,
                    },
                );
                Prepared {
                    payload,
                    seq: Some(seq),
                }
            }
            SendMode::Notify => {
                let seq = self.next_out_seq.next();
                msg.set_bits(
                    u64::from(self.notify_recv.last_recv().0),
                    16,
                    NOTIFY_LAST_RECV_BIT,
                );
                msg.set_bits(u64::from(self.notify_recv.wire_bits()), 8, NOTIFY_RECV_BITS_BIT);
                msg.set_bits(u64::from(seq.0), 16, NOTIFY_SEQ_BIT);
                let payload = msg.to_wire();
                self.metrics.notify_sent += 1;
                self.metrics.bytes_sent += payload.len() as u64;
                self.notify_send.sent(seq);
                Prepared {
                    payload,
                    seq: Some(seq),
                }
            }
        }
    }

    /// Serializes a protocol datagram (no sequence bookkeeping).
    pub(crate) fn prepare_raw(&mut self, msg: &Message) -> Vec<u8> {
        let payload = msg.to_wire();
        self.metrics.bytes_sent += payload.len() as u64;
        payload
    }

    /// Delay before the next retransmission of a pending message.
    pub(crate) fn retry_delay(&self) -> Duration {
        self.rtt.retry_delay()
    }

    /// Attempts to retransmit the pending message with this sequence ID.
    ///
    /// No-ops if the message was acknowledged in the meantime, or if
    /// `enqueued_at` predates a send that already happened (a stale event).
    pub(crate) fn retry_send(
        &mut self,
        seq: Seq,
        enqueued_at: Option<Instant>,
        now: Instant,
        max_attempts: u32,
    ) -> Retry {
        let Some(pending) = self.pending.get_mut(&seq.0) else {
            return Retry::Cleared;
        };
        if enqueued_at.is_some_and(|at| pending.last_send > at) {
            // another resend fired between scheduling and now; that resend
            // scheduled its own follow-up
            return Retry::Cleared;
        }
        if now.saturating_duration_since(pending.last_send) < self.rtt.half_rtt() {
            return Retry::Defer(now + self.rtt.retry_delay());
        }
        if pending.attempts >= max_attempts {
            warn!(
                endpoint = ?self.endpoint,
                %seq,
                attempts = pending.attempts,
                "reliable message exceeded send attempts"
            );
            self.pending.remove(&seq.0);
            return Retry::Undeliverable;
        }

        pending.attempts += 1;
        pending.last_send = now;
        self.metrics.resends += 1;
        self.metrics.bytes_sent += pending.payload.len() as u64;
        trace!(endpoint = ?self.endpoint, %seq, attempts = pending.attempts, "resending");
        Retry::Resend(pending.payload.clone())
    }

    /// Drops all retransmission state, e.g. on disconnect. Any resend event
    /// still in flight for these IDs will find nothing and no-op.
    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    //
    // inbound: reliable
    //

    /// Records an inbound reliable sequence ID and decides delivery.
    pub(crate) fn receive_reliable(&mut self, seq: Seq) -> RecvDecision {
        let decision = self.recv_window.receive(seq);
        if decision == RecvDecision::Handle {
            self.metrics.reliable_recv += 1;
        }
        decision
    }

    /// Builds the ack datagram for an inbound reliable sequence ID: plain
    /// `Ack` when `seq` is the newest received, `AckExtra` carrying `seq`
    /// otherwise.
    pub(crate) fn build_ack(&mut self, seq: Seq, capacity: usize) -> Vec<u8> {
        let last = self.recv_window.last_recv();
        let kind = if seq == last {
            HeaderKind::Ack
        } else {
            HeaderKind::AckExtra
        };
        let mut msg = Message::create_kind(kind, capacity);
        // header-sized writes cannot fail at any sane capacity
        let _ = msg.add_u16(last.0);
        let _ = msg.add_u16(self.recv_window.ack_bits());
        if kind == HeaderKind::AckExtra {
            let _ = msg.add_u16(seq.0);
        }
        self.prepare_raw(&msg)
    }

    /// Folds an inbound ack into the send window, dropping every pending
    /// message it newly acknowledges. Returns the sequence IDs that are still
    /// pending but have slid out of the remote's ack window - the caller
    /// treats those as lost and retries them.
    pub(crate) fn handle_ack(&mut self, last: Seq, bits: u16, extra: Option<Seq>) -> Vec<Seq> {
        let mut delivered = self.send_window.on_ack(last, bits);
        if let Some(extra) = extra {
            if self.send_window.mark(extra) {
                delivered.push(extra);
            }
        }
        for seq in &delivered {
            self.pending.remove(&seq.0);
        }

        let last_acked = self.send_window.last_acked();
        let mut lost: Vec<Seq> = self
            .pending
            .keys()
            .map(|&raw| Seq(raw))
            .filter(|&seq| last_acked.gap_since(seq) > 16)
            .collect();
        lost.sort();
        lost
    }

    //
    // inbound: notify
    //

    /// Resolves our outstanding notifies against the receiver state
    /// piggybacked on an inbound notify datagram.
    pub(crate) fn handle_notify_ack(
        &mut self,
        remote_last: Seq,
        remote_bits: u8,
    ) -> Vec<(Seq, NotifyFate)> {
        let resolved = self.notify_send.on_ack(remote_last, remote_bits);
        for (_, fate) in &resolved {
            self.metrics.record_notify_fate(*fate == NotifyFate::Lost);
        }
        resolved
    }

    /// Records an inbound notify sequence ID, returning whether to deliver.
    pub(crate) fn receive_notify(&mut self, seq: Seq) -> bool {
        let deliver = self.notify_recv.receive(seq);
        if deliver {
            self.metrics.notify_recv += 1;
        }
        deliver
    }

    //
    // heartbeats
    //

    /// Starts a heartbeat probe, returning the ping ID to send.
    pub(crate) fn begin_ping(&mut self, now: Instant) -> u8 {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.outstanding_ping = Some((ping_id, now));
        ping_id
    }

    /// Completes a heartbeat probe from its echo, feeding the RTT estimator.
    ///
    /// Only the latest probe counts; a late echo of an earlier one is
    /// dropped. The remote's self-reported RTT field is never fed in here -
    /// each side trusts only round trips it timed itself.
    pub(crate) fn complete_ping(&mut self, ping_id: u8, now: Instant) {
        if let Some((expected, sent_at)) = self.outstanding_ping {
            if expected == ping_id {
                self.rtt.update(now.saturating_duration_since(sent_at));
                self.outstanding_ping = None;
            }
        }
    }
}
