//! See [`ChannelServer`].

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::trace;

use crosswire::{EndpointId, LinkDrop, ServerTransport, TransportEvent};

use crate::{copies_for, ChannelClient, Condition, Verdict};

#[derive(Debug)]
struct Link {
    send: Sender<Bytes>,
    recv: Receiver<Bytes>,
    /// Whether the `Connected` event for this endpoint has been emitted yet;
    /// it fires when the first datagram arrives.
    announced: bool,
}

/// Server half of the in-memory channel transport.
///
/// Each [`ChannelServer::link`] call wires up one [`ChannelClient`] over a
/// pair of unbounded channels, standing in for a remote endpoint. Datagrams
/// are never lost or reordered unless a condition says so, which makes the
/// end-to-end tests deterministic.
#[derive(Default)]
pub struct ChannelServer {
    started: bool,
    next_endpoint: u64,
    links: AHashMap<EndpointId, Link>,
    condition: Option<Condition>,
}

impl ChannelServer {
    /// Creates a server transport that is not yet listening.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client transport linked to this server, standing in for one
    /// remote endpoint.
    ///
    /// The returned client does nothing until its `connect` is called.
    pub fn link(&mut self) -> ChannelClient {
        self.next_endpoint += 1;
        let endpoint = EndpointId(self.next_endpoint);

        let (send_c2s, recv_c2s) = crossbeam_channel::unbounded();
        let (send_s2c, recv_s2c) = crossbeam_channel::unbounded();
        self.links.insert(
            endpoint,
            Link {
                send: send_s2c,
                recv: recv_c2s,
                announced: false,
            },
        );
        ChannelClient::new(endpoint, send_c2s, recv_s2c)
    }

    /// Installs a conditioning hook over every outgoing datagram.
    pub fn set_condition(&mut self, condition: impl FnMut(&[u8]) -> Verdict + 'static) {
        self.condition = Some(Box::new(condition));
    }
}

impl ServerTransport for ChannelServer {
    type Error = std::convert::Infallible;

    fn start(&mut self, _port: u16) -> Result<(), Self::Error> {
        self.started = true;
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        if !self.started {
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut dead = Vec::new();
        for (&endpoint, link) in &mut self.links {
            loop {
                match link.recv.try_recv() {
                    Ok(payload) => {
                        if !link.announced {
                            link.announced = true;
                            events.push(TransportEvent::Connected { endpoint });
                        }
                        events.push(TransportEvent::DataReceived { endpoint, payload });
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        dead.push(endpoint);
                        break;
                    }
                }
            }
        }
        for endpoint in dead {
            self.links.remove(&endpoint);
            events.push(TransportEvent::Disconnected {
                endpoint,
                cause: LinkDrop::Closed,
            });
        }
        events
    }

    fn send(&mut self, endpoint: EndpointId, payload: &[u8]) {
        let copies = copies_for(&mut self.condition, payload);
        if copies == 0 {
            trace!(?endpoint, "conditioned drop");
        }
        if let Some(link) = self.links.get(&endpoint) {
            for _ in 0..copies {
                // best effort: a dropped receiver surfaces from poll
                let _ = link.send.send(Bytes::copy_from_slice(payload));
            }
        }
    }

    fn close(&mut self, endpoint: EndpointId) {
        self.links.remove(&endpoint);
    }

    fn shutdown(&mut self) {
        self.links.clear();
        self.started = false;
    }
}
