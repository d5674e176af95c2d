//! End-to-end handshake and lifecycle scenarios over the channel transport.

mod common;

use std::{cell::RefCell, rc::Rc, time::Duration};

use assert_matches::assert_matches;
use crosswire::{
    Client, ClientEvent, Config, ConnectionState, DisconnectReason, RejectReason, Server,
    ServerEvent,
};
use crosswire_channel::{ChannelServer, Verdict};

use common::{fast_config, kind_of, Pair};

#[test]
fn happy_path_handshake() {
    let mut pair = Pair::new(fast_config(), fast_config());
    pair.client
        .connect_with("channel", &[0x01, 0x02])
        .expect("fresh link accepts connect");
    pair.pump_until(2000, |p| p.client_events.contains(&ClientEvent::Connected));

    assert!(pair.client.is_connected());
    assert_eq!(pair.client.id(), 1);
    assert_eq!(pair.server.client_count(), 1);
    assert_eq!(pair.server.client_ids().collect::<Vec<_>>(), vec![1]);
    assert!(pair
        .server_events
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientConnected { client_id: 1, .. })));
}

#[test]
fn welcome_echo_payload_reaches_the_server() {
    let mut pair = Pair::new(fast_config(), fast_config());
    pair.client.set_welcome_payload(b"squad-7");
    pair.connect();

    let payload = pair
        .server_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ClientConnected {
                client_id: 1,
                payload,
            } => Some(payload.clone()),
            _ => None,
        })
        .expect("client connected during Pair::connect");
    assert_eq!(payload, b"squad-7");
}

#[test]
fn both_sides_measure_rtt_from_their_own_probes() {
    let mut pair = Pair::new(fast_config(), fast_config());
    pair.connect();

    // a few heartbeat intervals of traffic in each direction
    pair.pump_until(2000, |p| {
        p.client
            .connection()
            .is_some_and(|conn| conn.rtt().latest().is_some())
            && p.server
                .connection(1)
                .is_some_and(|conn| conn.rtt().latest().is_some())
    });
}

#[test]
fn manual_accept_connects_after_the_gate() {
    let server_config = Config {
        manual_accept: true,
        ..fast_config()
    };
    let mut pair = Pair::new(server_config, fast_config());
    pair.client
        .connect_with("channel", &[7, 7])
        .expect("fresh link accepts connect");

    pair.pump_until(2000, |p| {
        p.server_events
            .iter()
            .any(|e| matches!(e, ServerEvent::ConnectionRequest { .. }))
    });
    // the client was parked while the application decides
    assert_eq!(pair.client.state(), ConnectionState::Pending);

    let endpoint = pair
        .server_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ConnectionRequest { endpoint, payload } => {
                assert_eq!(payload, &[7, 7]);
                Some(*endpoint)
            }
            _ => None,
        })
        .expect("request event observed above");

    pair.server.accept(endpoint);
    pair.pump_until(2000, |p| p.client.is_connected());
    assert_eq!(pair.server.client_count(), 1);
}

#[test]
fn manual_reject_carries_custom_payload() {
    let server_config = Config {
        manual_accept: true,
        ..fast_config()
    };
    let mut pair = Pair::new(server_config, fast_config());
    pair.client
        .connect("channel")
        .expect("fresh link accepts connect");

    pair.pump_until(2000, |p| {
        p.server_events
            .iter()
            .any(|e| matches!(e, ServerEvent::ConnectionRequest { .. }))
    });
    let endpoint = pair
        .server_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ConnectionRequest { endpoint, .. } => Some(*endpoint),
            _ => None,
        })
        .expect("request event observed above");

    pair.server.reject(endpoint, b"no room for you");
    pair.pump_until(2000, |p| {
        p.client_events
            .iter()
            .any(|e| matches!(e, ClientEvent::ConnectionFailed { .. }))
    });
    assert_matches!(
        pair.client_events
            .iter()
            .find(|e| matches!(e, ClientEvent::ConnectionFailed { .. })),
        Some(ClientEvent::ConnectionFailed {
            reason: RejectReason::Custom,
            payload: Some(payload),
        }) if payload == b"no room for you"
    );
    assert_eq!(pair.server.client_count(), 0);
}

#[test]
fn server_full_rejects_the_second_client() {
    let reject_count = Rc::new(RefCell::new(0usize));
    let counter = reject_count.clone();

    let mut server_io = ChannelServer::new();
    let first_io = server_io.link();
    let second_io = server_io.link();
    server_io.set_condition(move |payload| {
        // Reject datagrams carry the reason in the 8 bits after the header
        let is_server_full_reject =
            kind_of(payload) == 4 && (payload[0] >> 4) | ((payload[1] & 0x0F) << 4) == 3;
        if is_server_full_reject {
            *counter.borrow_mut() += 1;
        }
        Verdict::Pass
    });

    let server_config = Config {
        max_client_count: 1,
        ..fast_config()
    };
    let mut server = Server::with_config(server_io, server_config);
    server.start(0).expect("channel server always starts");
    let mut first = Client::with_config(first_io, fast_config());
    let mut second = Client::with_config(second_io, fast_config());

    first.connect("channel").expect("fresh link");
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !first.is_connected() {
        assert!(std::time::Instant::now() < deadline, "first client stuck");
        let _ = first.update();
        let _ = server.update();
        std::thread::sleep(common::STEP);
    }

    second.connect("channel").expect("fresh link");
    let mut failure = None;
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while failure.is_none() {
        assert!(std::time::Instant::now() < deadline, "second client stuck");
        for event in second.update() {
            if let ClientEvent::ConnectionFailed { reason, .. } = event {
                failure = Some(reason);
            }
        }
        let _ = server.update();
        std::thread::sleep(common::STEP);
    }

    assert_eq!(failure, Some(RejectReason::ServerFull));
    // the rejection went out three times for robustness
    assert_eq!(*reject_count.borrow(), 3);
    assert_eq!(server.client_count(), 1);
}

#[test]
fn join_and_leave_are_announced_to_other_clients() {
    let mut server_io = ChannelServer::new();
    let first_io = server_io.link();
    let second_io = server_io.link();
    let mut server = Server::with_config(server_io, fast_config());
    server.start(0).expect("channel server always starts");
    let mut first = Client::with_config(first_io, fast_config());
    let mut second = Client::with_config(second_io, fast_config());

    let mut first_events = Vec::new();
    fn pump(
        first: &mut Client<crosswire_channel::ChannelClient>,
        second: &mut Client<crosswire_channel::ChannelClient>,
        server: &mut Server<ChannelServer>,
        first_events: &mut Vec<ClientEvent>,
    ) {
        first_events.extend(first.update());
        let _ = second.update();
        let _ = server.update();
        std::thread::sleep(common::STEP);
    }

    first.connect("channel").expect("fresh link");
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !first.is_connected() {
        assert!(std::time::Instant::now() < deadline);
        pump(&mut first, &mut second, &mut server, &mut first_events);
    }

    second.connect("channel").expect("fresh link");
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !first_events.contains(&ClientEvent::ClientConnected { client_id: 2 }) {
        assert!(std::time::Instant::now() < deadline, "join never announced");
        pump(&mut first, &mut second, &mut server, &mut first_events);
    }

    second.disconnect();
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !first_events.contains(&ClientEvent::ClientDisconnected { client_id: 2 }) {
        assert!(std::time::Instant::now() < deadline, "leave never announced");
        pump(&mut first, &mut second, &mut server, &mut first_events);
    }
}

#[test]
fn kick_reaches_the_client() {
    let mut pair = Pair::new(fast_config(), fast_config());
    pair.connect();

    pair.server.kick(1, b"afk");
    pair.pump_until(2000, |p| {
        p.client_events.contains(&ClientEvent::Disconnected {
            reason: DisconnectReason::Kicked,
        })
    });
    assert_eq!(pair.server.client_count(), 0);
    assert_eq!(pair.client.state(), ConnectionState::NotConnected);
}

#[test]
fn client_disconnect_reaches_the_server() {
    let mut pair = Pair::new(fast_config(), fast_config());
    pair.connect();

    pair.client.disconnect();
    pair.pump_until(2000, |p| {
        p.server_events.contains(&ServerEvent::ClientDisconnected {
            client_id: 1,
            reason: DisconnectReason::Disconnected,
        })
    });
    assert_eq!(pair.server.client_count(), 0);
}

#[test]
fn silent_client_times_out() {
    let server_config = Config {
        timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let mut pair = Pair::new(server_config, fast_config());
    pair.connect();

    // only the server keeps ticking; the client goes dark
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    loop {
        assert!(std::time::Instant::now() < deadline, "timeout never fired");
        pair.server_events.extend(pair.server.update());
        if pair.server_events.contains(&ServerEvent::ClientDisconnected {
            client_id: 1,
            reason: DisconnectReason::TimedOut,
        }) {
            break;
        }
        std::thread::sleep(common::STEP);
    }
    assert_eq!(pair.server.client_count(), 0);
}

#[test]
fn silent_server_times_out() {
    let client_config = Config {
        timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let mut pair = Pair::new(fast_config(), client_config);
    pair.connect();

    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    loop {
        assert!(std::time::Instant::now() < deadline, "timeout never fired");
        pair.client_events.extend(pair.client.update());
        if pair.client_events.contains(&ClientEvent::Disconnected {
            reason: DisconnectReason::TimedOut,
        }) {
            break;
        }
        std::thread::sleep(common::STEP);
    }
    assert_eq!(pair.client.state(), ConnectionState::NotConnected);
}
