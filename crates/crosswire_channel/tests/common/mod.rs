//! Shared harness for driving a real client/server pair over the channel
//! transport.
#![allow(dead_code)] // not every test binary uses every helper

use std::{thread, time::Duration};

use crosswire::{Client, ClientEvent, Config, Server, ServerEvent};
use crosswire_channel::{ChannelClient, ChannelServer, Condition};

/// Tick granularity of [`Pair::pump_until`].
pub const STEP: Duration = Duration::from_millis(2);

/// Config with timings scaled down for tests.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(15),
        timeout: Duration::from_millis(1000),
        ..Config::default()
    }
}

/// One server and one client wired over the channel transport, with event
/// logs accumulated across pumps.
pub struct Pair {
    pub server: Server<ChannelServer>,
    pub client: Client<ChannelClient>,
    pub server_events: Vec<ServerEvent>,
    pub client_events: Vec<ClientEvent>,
}

impl Pair {
    pub fn new(server_config: Config, client_config: Config) -> Self {
        Self::conditioned(server_config, client_config, None, None)
    }

    pub fn conditioned(
        server_config: Config,
        client_config: Config,
        server_condition: Option<Condition>,
        client_condition: Option<Condition>,
    ) -> Self {
        let mut server_io = ChannelServer::new();
        let mut client_io = server_io.link();
        if let Some(condition) = server_condition {
            server_io.set_condition(condition);
        }
        if let Some(condition) = client_condition {
            client_io.set_condition(condition);
        }

        let mut server = Server::with_config(server_io, server_config);
        server.start(0).expect("channel server always starts");
        Self {
            server,
            client: Client::with_config(client_io, client_config),
            server_events: Vec::new(),
            client_events: Vec::new(),
        }
    }

    pub fn tick(&mut self) {
        self.client_events.extend(self.client.update());
        self.server_events.extend(self.server.update());
        thread::sleep(STEP);
    }

    /// Pumps both peers until `done` returns true, panicking after
    /// `timeout_ms` of wall time.
    pub fn pump_until(&mut self, timeout_ms: u64, mut done: impl FnMut(&Self) -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        while !done(self) {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for condition;\n  server events: {:?}\n  client events: {:?}",
                self.server_events,
                self.client_events,
            );
            self.tick();
        }
    }

    /// Pumps both peers for a fixed duration.
    pub fn pump_for(&mut self, ms: u64) {
        let deadline = std::time::Instant::now() + Duration::from_millis(ms);
        while std::time::Instant::now() < deadline {
            self.tick();
        }
    }

    /// Connects the client and pumps until both sides agree it is connected.
    pub fn connect(&mut self) {
        self.client
            .connect("channel")
            .expect("fresh link accepts connect");
        self.pump_until(2000, |pair| {
            pair.client.is_connected() && pair.server.client_count() == 1
        });
    }
}

/// Header kind nibble of a raw datagram.
pub fn kind_of(payload: &[u8]) -> u8 {
    payload[0] & 0x0F
}
