#![doc = include_str!("../README.md")]

pub mod ack;
pub mod client;
pub mod config;
pub mod connection;
pub mod event;
pub mod header;
pub mod metrics;
pub mod msg;
pub mod notify;
mod peer;
pub mod rtt;
pub mod seq;
pub mod server;
pub mod transport;

pub use {
    client::Client,
    config::Config,
    connection::{Connection, ConnectionState},
    event::{ClientEvent, HandlerAlreadyRegistered, ServerEvent},
    header::{DisconnectReason, HeaderKind, RejectReason, SendMode},
    msg::{InsufficientCapacity, Message, MessagePool},
    seq::Seq,
    server::Server,
    transport::{ClientTransport, EndpointId, LinkDrop, ServerTransport, TransportEvent},
};
