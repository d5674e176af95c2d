//! See [`Client`].

use ahash::AHashMap;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::{
    ack::RecvDecision,
    config::Config,
    connection::{
        Connection, ConnectionState, Retry, NOTIFY_LAST_RECV_BIT, NOTIFY_RECV_BITS_BIT,
        NOTIFY_SEQ_BIT, RELIABLE_SEQ_BIT,
    },
    event::{ClientEvent, ClientHandler, HandlerAlreadyRegistered},
    header::{DisconnectReason, HeaderKind, RejectReason, SendMode},
    msg::{Message, MessagePool},
    notify::NotifyFate,
    peer::{DelayedEvent, EventQueue},
    seq::Seq,
    transport::{ClientTransport, EndpointId, LinkDrop, TransportEvent},
};

/// Client peer: connects to one server over a [`ClientTransport`] and drives
/// the handshake, heartbeats, and reliability engine from its
/// [`Client::update`] tick.
///
/// Single-threaded: all state is mutated only by the thread calling
/// `update`, which the application runs once per frame or tick.
pub struct Client<T: ClientTransport> {
    transport: T,
    config: Config,
    pool: MessagePool,
    queue: EventQueue,
    connection: Option<Connection>,
    connect_attempts: u32,
    connect_payload: Vec<u8>,
    welcome_payload: Vec<u8>,
    handlers: AHashMap<u64, ClientHandler>,
    events: Vec<ClientEvent>,
}

impl<T: ClientTransport> Client<T> {
    /// Creates a client over `transport` with default configuration.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Config::default())
    }

    /// Creates a client over `transport` with the given configuration.
    #[must_use]
    pub fn with_config(transport: T, config: Config) -> Self {
        let pool = MessagePool::new(config.max_payload_size, config.instances_per_peer);
        Self {
            transport,
            config,
            pool,
            queue: EventQueue::default(),
            connection: None,
            connect_attempts: 0,
            connect_payload: Vec::new(),
            welcome_payload: Vec::new(),
            handlers: AHashMap::new(),
            events: Vec::new(),
        }
    }

    /// Sets the application payload attached to the `Welcome` echo that
    /// completes the handshake, surfaced server-side on
    /// [`ServerEvent::ClientConnected`].
    ///
    /// Persists across connection attempts until set again.
    ///
    /// [`ServerEvent::ClientConnected`]: crate::event::ServerEvent::ClientConnected
    pub fn set_welcome_payload(&mut self, payload: &[u8]) {
        self.welcome_payload = payload.to_vec();
    }

    /// Registers the handler for one user message ID.
    ///
    /// # Errors
    ///
    /// Errors if the ID already has a handler.
    pub fn register_handler(
        &mut self,
        message_id: u64,
        handler: impl FnMut(&mut Message) + 'static,
    ) -> Result<(), HandlerAlreadyRegistered> {
        match self.handlers.entry(message_id) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HandlerAlreadyRegistered { message_id })
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::NotConnected, Connection::state)
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The connection to the server, if one exists.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// This client's server-assigned ID, or 0 before the handshake assigns
    /// one.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.connection.as_ref().map_or(0, Connection::id)
    }

    /// Draws a message with the header for `mode` installed from this peer's
    /// pool.
    #[must_use]
    pub fn message(&mut self, mode: SendMode) -> Message {
        self.pool.acquire_mode(mode)
    }

    /// As [`Client::message`], with the varuint message ID appended.
    #[must_use]
    pub fn message_with_id(&mut self, mode: SendMode, id: u64) -> Message {
        let mut msg = self.pool.acquire_mode(mode);
        let _ = msg.add_varuint(id);
        msg
    }

    /// Returns a message drawn from [`Client::message`] that was not sent.
    pub fn release(&mut self, msg: Message) {
        self.pool.release(msg);
    }

    /// Begins connecting to `target` (transport-defined address format).
    ///
    /// Progress arrives as events from [`Client::update`]: [`ClientEvent::Connected`]
    /// on success, [`ClientEvent::ConnectionFailed`] otherwise. Any existing
    /// connection is torn down first.
    ///
    /// # Errors
    ///
    /// Errors only if the transport cannot start the attempt at all.
    pub fn connect(&mut self, target: &str) -> Result<(), T::Error> {
        self.connect_with(target, &[])
    }

    /// As [`Client::connect`], attaching application payload bytes to the
    /// `Connect` datagram (surfaced to the server's accept gate).
    ///
    /// # Errors
    ///
    /// Errors only if the transport cannot start the attempt at all.
    pub fn connect_with(&mut self, target: &str, payload: &[u8]) -> Result<(), T::Error> {
        if self.connection.is_some() {
            self.disconnect();
        }
        let now = Instant::now();
        let endpoint = self.transport.connect(target)?;
        debug!(?endpoint, target, "connecting");

        self.connection = Some(Connection::new(endpoint, now));
        self.connect_attempts = 0;
        self.connect_payload = payload.to_vec();
        self.queue.clear();
        self.queue
            .schedule(now + self.config.heartbeat_interval, DelayedEvent::Heartbeat);
        Ok(())
    }

    /// Disconnects from the server: clears retransmission state, sends one
    /// best-effort `Disconnect` datagram, and transitions to
    /// [`ConnectionState::NotConnected`].
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            self.teardown(Some(DisconnectReason::Disconnected));
            self.events.push(ClientEvent::Disconnected {
                reason: DisconnectReason::Disconnected,
            });
        }
    }

    /// Sends a user message to the server, consuming it back into the pool.
    ///
    /// Returns the assigned sequence ID for reliable and notify sends (the
    /// key that notify fate events report against), [`None`] for unreliable
    /// sends - or [`None`] with a log if not connected.
    pub fn send(&mut self, mut msg: Message) -> Option<Seq> {
        let now = Instant::now();
        let is_reliable = msg.send_mode() == Some(SendMode::Reliable);
        let Some(conn) = self.connection.as_mut() else {
            warn!("send while not connected, dropping");
            self.pool.release(msg);
            return None;
        };
        if conn.state() != ConnectionState::Connected {
            warn!(state = ?conn.state(), "send before handshake completed, dropping");
            self.pool.release(msg);
            return None;
        }

        let prepared = conn.prepare_send(&mut msg, now);
        let endpoint = conn.endpoint();
        let retry_at = now + conn.retry_delay();
        self.transport.send(endpoint, &prepared.payload);
        if is_reliable {
            if let Some(seq) = prepared.seq {
                self.queue.schedule(
                    retry_at,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
        }
        self.pool.release(msg);
        prepared.seq
    }

    /// Runs one scheduler tick: fires due delayed events, polls the
    /// transport, dispatches every inbound datagram, and returns the events
    /// that surfaced.
    pub fn update(&mut self) -> Vec<ClientEvent> {
        let now = Instant::now();

        // two-phase drain so an event re-enqueued at `now` fires next tick,
        // not in an endless loop within this one
        let mut due = Vec::new();
        while let Some(event) = self.queue.pop_due(now) {
            due.push(event);
        }
        for event in due {
            match event {
                DelayedEvent::Heartbeat => self.heartbeat_tick(now),
                DelayedEvent::Resend {
                    endpoint,
                    seq,
                    enqueued_at,
                } => {
                    if self.connection.as_ref().map(Connection::endpoint) == Some(endpoint) {
                        self.run_retry(seq, Some(enqueued_at), now);
                    }
                }
            }
        }

        for event in self.transport.poll() {
            match event {
                TransportEvent::Connected { endpoint } => {
                    if self.connection.as_ref().map(Connection::endpoint) == Some(endpoint)
                        && self.state() == ConnectionState::Connecting
                    {
                        // channel is writable; first handshake attempt
                        self.send_connect(now);
                    }
                }
                TransportEvent::ConnectionFailed { endpoint } => {
                    if self.connection.as_ref().map(Connection::endpoint) == Some(endpoint) {
                        self.teardown(None);
                        self.events.push(ClientEvent::ConnectionFailed {
                            reason: RejectReason::NoConnection,
                            payload: None,
                        });
                    }
                }
                TransportEvent::DataReceived { endpoint, payload } => {
                    if self.connection.as_ref().map(Connection::endpoint) == Some(endpoint) {
                        self.handle_datagram(&payload, now);
                    }
                }
                TransportEvent::Disconnected { endpoint, cause } => {
                    if self.connection.as_ref().map(Connection::endpoint) == Some(endpoint) {
                        let reason = match cause {
                            LinkDrop::Closed => DisconnectReason::Disconnected,
                            LinkDrop::Error => DisconnectReason::TransportError,
                        };
                        self.teardown(None);
                        self.events.push(ClientEvent::Disconnected { reason });
                    }
                }
            }
        }

        std::mem::take(&mut self.events)
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match conn.state() {
            ConnectionState::Connecting => {
                if self.connect_attempts >= self.config.max_connection_attempts {
                    debug!("connection attempts exhausted");
                    self.teardown(None);
                    self.events.push(ClientEvent::ConnectionFailed {
                        reason: RejectReason::NoConnection,
                        payload: None,
                    });
                } else {
                    self.send_connect(now);
                }
            }
            ConnectionState::Pending => {
                if now.saturating_duration_since(conn.state_since()) > self.config.timeout {
                    debug!("gave up waiting for the server to accept");
                    self.teardown(None);
                    self.events.push(ClientEvent::ConnectionFailed {
                        reason: RejectReason::NoConnection,
                        payload: None,
                    });
                }
            }
            ConnectionState::Connected => {
                if now.saturating_duration_since(conn.last_heard()) > self.config.timeout {
                    debug!("server went silent");
                    self.teardown(None);
                    self.events.push(ClientEvent::Disconnected {
                        reason: DisconnectReason::TimedOut,
                    });
                } else {
                    let ping_id = conn.begin_ping(now);
                    let rtt_ms = conn.rtt().latest_ms();
                    let endpoint = conn.endpoint();
                    self.send_heartbeat(endpoint, ping_id, rtt_ms, false);
                }
            }
            ConnectionState::NotConnected => {}
        }

        if self.connection.is_some() {
            self.queue
                .schedule(now + self.config.heartbeat_interval, DelayedEvent::Heartbeat);
        }
    }

    fn send_connect(&mut self, _now: Instant) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let endpoint = conn.endpoint();
        let mut msg = self.pool.acquire_kind(HeaderKind::Connect);
        let _ = msg.add_bytes_without_len(&self.connect_payload);
        let payload = conn.prepare_raw(&msg);
        self.pool.release(msg);
        self.transport.send(endpoint, &payload);
        self.connect_attempts += 1;
        trace!(attempt = self.connect_attempts, "sent connect");
    }

    fn run_retry(&mut self, seq: Seq, enqueued_at: Option<Instant>, now: Instant) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let endpoint = conn.endpoint();
        let outcome = conn.retry_send(seq, enqueued_at, now, self.config.max_send_attempts);
        let retry_at = now + conn.retry_delay();
        match outcome {
            Retry::Resend(payload) => {
                self.transport.send(endpoint, &payload);
                self.queue.schedule(
                    retry_at,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
            Retry::Defer(due) => {
                self.queue.schedule(
                    due,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
            Retry::Undeliverable => {
                if self.config.disconnect_on_poor_connection {
                    self.teardown(Some(DisconnectReason::PoorConnection));
                    self.events.push(ClientEvent::Disconnected {
                        reason: DisconnectReason::PoorConnection,
                    });
                }
            }
            Retry::Cleared => {}
        }
    }

    fn handle_datagram(&mut self, payload: &[u8], now: Instant) {
        let Some(mut msg) = self.pool.acquire_payload(payload) else {
            warn!(len = payload.len(), "discarding unparseable datagram");
            return;
        };
        if let Some(conn) = self.connection.as_mut() {
            conn.note_heard(now);
            conn.note_recv_bytes(payload.len());
        }

        match msg.kind() {
            HeaderKind::Connect => {
                // the server's handshake ack; liveness was already noted
            }
            HeaderKind::Reject => self.on_reject(&mut msg, now),
            HeaderKind::Welcome => self.on_welcome(&mut msg, now),
            HeaderKind::Heartbeat => {
                let ping_id = msg.get_u8();
                // informational only; we trust no RTT we did not measure
                let _remote_rtt = msg.get_u16();
                let is_echo = msg.get_bool();
                if let Some(conn) = self.connection.as_mut() {
                    if is_echo {
                        conn.complete_ping(ping_id, now);
                    } else if conn.state() == ConnectionState::Connected {
                        let rtt_ms = conn.rtt().latest_ms();
                        let endpoint = conn.endpoint();
                        self.send_heartbeat(endpoint, ping_id, rtt_ms, true);
                    }
                }
            }
            HeaderKind::Disconnect => {
                let reason = DisconnectReason::from_u8(msg.get_u8())
                    .unwrap_or(DisconnectReason::Disconnected);
                debug!(%reason, "server disconnected us");
                self.teardown(None);
                self.events.push(ClientEvent::Disconnected { reason });
            }
            HeaderKind::ClientConnected => {
                let client_id = msg.get_u16();
                self.events.push(ClientEvent::ClientConnected { client_id });
            }
            HeaderKind::ClientDisconnected => {
                let client_id = msg.get_u16();
                self.events
                    .push(ClientEvent::ClientDisconnected { client_id });
            }
            HeaderKind::Ack | HeaderKind::AckExtra => self.on_ack(&mut msg, now),
            HeaderKind::Unreliable => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.metrics_mut().unreliable_recv += 1;
                }
                msg.set_read_bit(SendMode::Unreliable.header_bits());
                self.dispatch(&mut msg);
            }
            HeaderKind::Reliable => self.on_reliable(&mut msg),
            HeaderKind::Notify => self.on_notify(&mut msg),
        }
        self.pool.release(msg);
    }

    fn on_reject(&mut self, msg: &mut Message, now: Instant) {
        let reason = RejectReason::from_u8(msg.get_u8()).unwrap_or(RejectReason::Rejected);
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Pending
        ) {
            return;
        }

        if reason == RejectReason::Pending {
            if let Some(conn) = self.connection.as_mut() {
                conn.set_state(ConnectionState::Pending, now);
            }
            return;
        }

        let payload = if reason == RejectReason::Custom {
            let amount = msg.unread_bits() as usize / 8;
            Some(msg.get_bytes_amount(amount))
        } else {
            None
        };
        debug!(%reason, "connection rejected");
        self.teardown(None);
        self.events
            .push(ClientEvent::ConnectionFailed { reason, payload });
    }

    fn on_welcome(&mut self, msg: &mut Message, now: Instant) {
        let id = msg.get_u16();
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let endpoint = conn.endpoint();
        match conn.state() {
            ConnectionState::Connecting | ConnectionState::Pending => {
                conn.set_id(id);
                conn.set_state(ConnectionState::Connected, now);
                debug!(id, "connected");
                self.send_welcome_echo(endpoint, id);
                self.events.push(ClientEvent::Connected);
            }
            ConnectionState::Connected => {
                // our echo was lost; answer again
                self.send_welcome_echo(endpoint, id);
            }
            ConnectionState::NotConnected => {}
        }
    }

    fn send_welcome_echo(&mut self, endpoint: EndpointId, id: u16) {
        let mut msg = self.pool.acquire_kind(HeaderKind::Welcome);
        let _ = msg.add_u16(id);
        let _ = msg.add_bytes_without_len(&self.welcome_payload);
        let payload = msg.to_wire();
        self.transport.send(endpoint, &payload);
        self.pool.release(msg);
    }

    /// Sends one heartbeat datagram: ping ID, our latest measured RTT, and
    /// the flag separating fresh probes from echoes.
    fn send_heartbeat(&mut self, endpoint: EndpointId, ping_id: u8, rtt_ms: u16, echo: bool) {
        let mut msg = self.pool.acquire_kind(HeaderKind::Heartbeat);
        let _ = msg.add_u8(ping_id);
        let _ = msg.add_u16(rtt_ms);
        let _ = msg.add_bool(echo);
        let payload = msg.to_wire();
        self.transport.send(endpoint, &payload);
        self.pool.release(msg);
    }

    fn on_ack(&mut self, msg: &mut Message, now: Instant) {
        let last = Seq(msg.get_u16());
        let bits = msg.get_u16();
        let extra = (msg.kind() == HeaderKind::AckExtra).then(|| Seq(msg.get_u16()));
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let lost = conn.handle_ack(last, bits, extra);
        for seq in lost {
            self.run_retry(seq, None, now);
        }
    }

    fn on_reliable(&mut self, msg: &mut Message) {
        let seq = Seq(msg.peek_bits(16, RELIABLE_SEQ_BIT) as u16);
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let endpoint = conn.endpoint();
        let decision = conn.receive_reliable(seq);
        let ack = conn.build_ack(seq, self.config.max_payload_size);
        // the ack always goes out, and before the handler runs
        self.transport.send(endpoint, &ack);

        if decision == RecvDecision::Handle {
            msg.set_read_bit(SendMode::Reliable.header_bits());
            self.dispatch(msg);
        }
    }

    fn on_notify(&mut self, msg: &mut Message) {
        let remote_last = Seq(msg.peek_bits(16, NOTIFY_LAST_RECV_BIT) as u16);
        let remote_bits = msg.peek_bits(8, NOTIFY_RECV_BITS_BIT) as u8;
        let seq = Seq(msg.peek_bits(16, NOTIFY_SEQ_BIT) as u16);
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        for (resolved_seq, fate) in conn.handle_notify_ack(remote_last, remote_bits) {
            self.events.push(match fate {
                NotifyFate::Delivered => ClientEvent::NotifyDelivered { seq: resolved_seq },
                NotifyFate::Lost => ClientEvent::NotifyLost { seq: resolved_seq },
            });
        }
        if conn.receive_notify(seq) {
            msg.set_read_bit(SendMode::Notify.header_bits());
            self.dispatch(msg);
        }
    }

    fn dispatch(&mut self, msg: &mut Message) {
        let id = msg.get_varuint();
        if let Some(handler) = self.handlers.get_mut(&id) {
            handler(msg);
        } else {
            warn!(id, "no handler for message id, discarding");
        }
    }

    /// Tears down the connection; `notify_remote` carries the reason of a
    /// best-effort `Disconnect` datagram if the remote should hear about it.
    fn teardown(&mut self, notify_remote: Option<DisconnectReason>) {
        if let Some(mut conn) = self.connection.take() {
            let endpoint = conn.endpoint();
            if let Some(reason) = notify_remote {
                let mut msg = self.pool.acquire_kind(HeaderKind::Disconnect);
                let _ = msg.add_u8(reason as u8);
                self.transport.send(endpoint, &msg.to_wire());
                self.pool.release(msg);
            }
            conn.clear_pending();
            self.transport.close(endpoint);
        }
        self.queue.clear();
        self.connect_attempts = 0;
    }
}
