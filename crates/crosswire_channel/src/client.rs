//! See [`ChannelClient`].

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::trace;

use crosswire::{ClientTransport, EndpointId, LinkDrop, TransportEvent};

use crate::{copies_for, ChannelError, Condition, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Linked but `connect` has not been called.
    Idle,
    /// `connect` was called; `Connected` fires from the next poll.
    Connecting,
    /// Channel is open.
    Open,
    /// Closed locally or by the server; the link cannot be reused.
    Closed,
}

/// Client half of the in-memory channel transport; create one with
/// [`ChannelServer::link`].
///
/// A closed link cannot reconnect - make a fresh link instead, the way a UDP
/// client would open a fresh socket.
///
/// [`ChannelServer::link`]: crate::ChannelServer::link
pub struct ChannelClient {
    endpoint: EndpointId,
    send: Option<Sender<Bytes>>,
    recv: Option<Receiver<Bytes>>,
    state: LinkState,
    condition: Option<Condition>,
}

impl ChannelClient {
    pub(crate) fn new(endpoint: EndpointId, send: Sender<Bytes>, recv: Receiver<Bytes>) -> Self {
        Self {
            endpoint,
            send: Some(send),
            recv: Some(recv),
            state: LinkState::Idle,
            condition: None,
        }
    }

    /// Installs a conditioning hook over every outgoing datagram.
    pub fn set_condition(&mut self, condition: impl FnMut(&[u8]) -> Verdict + 'static) {
        self.condition = Some(Box::new(condition));
    }
}

impl ClientTransport for ChannelClient {
    type Error = ChannelError;

    fn connect(&mut self, _target: &str) -> Result<EndpointId, Self::Error> {
        match self.state {
            LinkState::Idle => {
                self.state = LinkState::Connecting;
                Ok(self.endpoint)
            }
            LinkState::Connecting | LinkState::Open => Err(ChannelError::AlreadyActive),
            LinkState::Closed => Err(ChannelError::Closed),
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if self.state == LinkState::Connecting {
            // an in-memory channel is always immediately writable
            self.state = LinkState::Open;
            events.push(TransportEvent::Connected {
                endpoint: self.endpoint,
            });
        }
        if self.state != LinkState::Open {
            return events;
        }

        loop {
            match self.recv.as_ref().map(Receiver::try_recv) {
                Some(Ok(payload)) => events.push(TransportEvent::DataReceived {
                    endpoint: self.endpoint,
                    payload,
                }),
                Some(Err(TryRecvError::Empty)) | None => break,
                Some(Err(TryRecvError::Disconnected)) => {
                    self.state = LinkState::Closed;
                    self.send = None;
                    self.recv = None;
                    events.push(TransportEvent::Disconnected {
                        endpoint: self.endpoint,
                        cause: LinkDrop::Closed,
                    });
                    break;
                }
            }
        }
        events
    }

    fn send(&mut self, _endpoint: EndpointId, payload: &[u8]) {
        let copies = copies_for(&mut self.condition, payload);
        if copies == 0 {
            trace!("conditioned drop");
        }
        if let Some(send) = &self.send {
            for _ in 0..copies {
                let _ = send.send(Bytes::copy_from_slice(payload));
            }
        }
    }

    fn close(&mut self, _endpoint: EndpointId) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the sender is what the server observes as a disconnect
        self.send = None;
        self.recv = None;
        self.state = LinkState::Closed;
    }
}
