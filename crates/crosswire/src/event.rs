//! Events and handler registration.
//!
//! Lifecycle and notify-fate outcomes surface as [`ClientEvent`] /
//! [`ServerEvent`] values drained from each peer's `update`. User messages
//! instead dispatch through a handler map keyed on the varuint message ID
//! that follows the header - how that map is populated (explicit calls, code
//! generation) is the application's concern; the peers only expose
//! `register_handler`.

use crate::{
    header::{DisconnectReason, RejectReason},
    msg::Message,
    seq::Seq,
    transport::EndpointId,
};

/// A message ID was registered twice.
///
/// Raised at setup time from `register_handler`; never a runtime concern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler already registered for message id {message_id}")]
pub struct HandlerAlreadyRegistered {
    /// The contested message ID.
    pub message_id: u64,
}

/// Handler for user messages arriving at a client.
pub type ClientHandler = Box<dyn FnMut(&mut Message)>;

/// Handler for user messages arriving at a server; the first argument is the
/// sending client's ID.
pub type ServerHandler = Box<dyn FnMut(u16, &mut Message)>;

/// Event emitted by a [`Client`].
///
/// [`Client`]: crate::client::Client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed; this client is now connected.
    Connected,
    /// The connection attempt failed before ever connecting.
    ConnectionFailed {
        /// Why, as reported by the server - or
        /// [`RejectReason::NoConnection`] if attempts were exhausted without
        /// any answer.
        reason: RejectReason,
        /// Application payload attached to a [`RejectReason::Custom`]
        /// rejection.
        payload: Option<Vec<u8>>,
    },
    /// This client lost its connection.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// Another client joined the server.
    ClientConnected {
        /// Its assigned ID.
        client_id: u16,
    },
    /// Another client left the server.
    ClientDisconnected {
        /// Its assigned ID.
        client_id: u16,
    },
    /// A notify message this client sent was delivered.
    NotifyDelivered {
        /// Sequence ID returned from the send.
        seq: Seq,
    },
    /// A notify message this client sent was lost.
    NotifyLost {
        /// Sequence ID returned from the send.
        seq: Seq,
    },
}

/// Event emitted by a [`Server`].
///
/// [`Server`]: crate::server::Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// An endpoint wants to connect and `manual_accept` is on; answer with
    /// [`Server::accept`] or [`Server::reject`].
    ///
    /// [`Server::accept`]: crate::server::Server::accept
    /// [`Server::reject`]: crate::server::Server::reject
    ConnectionRequest {
        /// The endpoint asking.
        endpoint: EndpointId,
        /// Application payload attached to the `Connect` datagram.
        payload: Vec<u8>,
    },
    /// A client completed the handshake.
    ClientConnected {
        /// Its assigned ID.
        client_id: u16,
        /// Application payload the client attached to its `Welcome` echo;
        /// empty if it attached none.
        payload: Vec<u8>,
    },
    /// A client left, timed out, or was kicked.
    ClientDisconnected {
        /// Its assigned ID.
        client_id: u16,
        /// Why.
        reason: DisconnectReason,
    },
    /// A notify message sent to a client was delivered.
    NotifyDelivered {
        /// The client it was sent to.
        client_id: u16,
        /// Sequence ID returned from the send.
        seq: Seq,
    },
    /// A notify message sent to a client was lost.
    NotifyLost {
        /// The client it was sent to.
        client_id: u16,
        /// Sequence ID returned from the send.
        seq: Seq,
    },
}
