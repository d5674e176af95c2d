//! Abstract datagram transport contract.
//!
//! The core never touches sockets. A transport implementation owns the
//! underlying datagram channel (UDP, an in-memory pair, a relay service) and
//! exposes it through [`ClientTransport`] or [`ServerTransport`]: non-blocking
//! `poll`, best-effort `send`, and upward [`TransportEvent`]s. Transports may
//! receive on a background thread, but events must only surface from `poll`,
//! which the owning peer calls during its single-threaded `update`.

use std::error::Error;

use bytes::Bytes;

/// Opaque handle to one remote endpoint, minted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u64);

/// Why a transport-level link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDrop {
    /// The link was closed deliberately by either side.
    Closed,
    /// The link failed.
    Error,
}

/// Event surfaced by a transport's `poll`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The datagram channel to this endpoint is writable.
    ///
    /// Client side: the outcome of `connect`. Server side: a first datagram
    /// arrived from a new endpoint.
    Connected {
        /// The endpoint in question.
        endpoint: EndpointId,
    },
    /// A `connect` could not establish a channel.
    ConnectionFailed {
        /// The endpoint handed out by `connect`.
        endpoint: EndpointId,
    },
    /// One datagram arrived.
    DataReceived {
        /// Sender.
        endpoint: EndpointId,
        /// Raw payload.
        payload: Bytes,
    },
    /// The link to this endpoint is gone.
    Disconnected {
        /// The endpoint in question.
        endpoint: EndpointId,
        /// Transport-level cause.
        cause: LinkDrop,
    },
}

/// Client side of the transport contract.
pub trait ClientTransport {
    /// Error from [`ClientTransport::connect`].
    type Error: Error + Send + Sync + 'static;

    /// Begins establishing a datagram channel to `target` (format is
    /// transport-defined, e.g. `"127.0.0.1:7777"`).
    ///
    /// Non-blocking: success here only means the attempt started. A
    /// [`TransportEvent::Connected`] or [`TransportEvent::ConnectionFailed`]
    /// for the returned endpoint follows from a later `poll`.
    ///
    /// # Errors
    ///
    /// Errors if the attempt could not even start, e.g. an unparseable
    /// target.
    fn connect(&mut self, target: &str) -> Result<EndpointId, Self::Error>;

    /// Non-blocking pump; drains everything that happened since last poll.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Best-effort datagram send. Failures are not reported here; a dead link
    /// surfaces as [`TransportEvent::Disconnected`].
    fn send(&mut self, endpoint: EndpointId, payload: &[u8]);

    /// Tears down the channel to one endpoint.
    fn close(&mut self, endpoint: EndpointId);

    /// Tears down the whole transport.
    fn shutdown(&mut self);
}

/// Server side of the transport contract.
pub trait ServerTransport {
    /// Error from [`ServerTransport::start`].
    type Error: Error + Send + Sync + 'static;

    /// Starts listening on `port`. A [`TransportEvent::Connected`] is emitted
    /// from `poll` the first time a datagram arrives from a new endpoint.
    ///
    /// # Errors
    ///
    /// Errors if the listen socket (or equivalent) could not be set up.
    fn start(&mut self, port: u16) -> Result<(), Self::Error>;

    /// Non-blocking pump; drains everything that happened since last poll.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Best-effort datagram send. Failures are not reported here; a dead link
    /// surfaces as [`TransportEvent::Disconnected`].
    fn send(&mut self, endpoint: EndpointId, payload: &[u8]);

    /// Tears down the channel to one endpoint.
    fn close(&mut self, endpoint: EndpointId);

    /// Stops listening and tears down every channel.
    fn shutdown(&mut self);
}
