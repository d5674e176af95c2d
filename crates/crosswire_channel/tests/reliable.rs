//! End-to-end reliable delivery scenarios over the channel transport.

mod common;

use std::{cell::RefCell, rc::Rc, time::Duration};

use crosswire::{Client, Config, SendMode, Server};
use crosswire_channel::{ChannelServer, Condition, Verdict};

use common::{fast_config, kind_of, Pair};

const MSG_PING: u64 = 1;
const MSG_RELAYED: u64 = 42;

const RELIABLE_KIND: u8 = 10;
const ACK_KINDS: [u8; 2] = [1, 2];

#[test]
fn dropped_reliable_is_retransmitted() {
    // drop the first reliable datagram on the wire, client to server
    let dropped = Rc::new(RefCell::new(false));
    let trigger = dropped.clone();
    let client_condition: Condition = Box::new(move |payload: &[u8]| {
        if kind_of(payload) == RELIABLE_KIND && !*trigger.borrow() {
            *trigger.borrow_mut() = true;
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    });

    let mut pair = Pair::conditioned(fast_config(), fast_config(), None, Some(client_condition));
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    pair.server
        .register_handler(MSG_PING, move |from, msg| {
            assert_eq!(from, 1);
            sink.borrow_mut().push(msg.get_str());
        })
        .expect("first registration");
    pair.connect();

    let mut msg = pair.client.message_with_id(SendMode::Reliable, MSG_PING);
    msg.add_str("ping").expect("fits");
    pair.client.send(msg).expect("connected");
    assert_eq!(pair.client.connection().expect("connected").pending_count(), 1);

    // the first copy is dropped; the ~50 ms retry must get it through and
    // the returning ack must clear the pending slot
    pair.pump_until(2000, |p| {
        !received.borrow().is_empty()
            && p.client.connection().expect("connected").pending_count() == 0
    });
    assert_eq!(*received.borrow(), vec!["ping".to_owned()]);
    assert!(*dropped.borrow());
    assert!(pair.client.connection().expect("connected").metrics().resends >= 1);
}

#[test]
fn duplicated_reliable_is_delivered_once_and_acked_twice() {
    let duplicated = Rc::new(RefCell::new(false));
    let trigger = duplicated.clone();
    let client_condition: Condition = Box::new(move |payload: &[u8]| {
        if kind_of(payload) == RELIABLE_KIND && !*trigger.borrow() {
            *trigger.borrow_mut() = true;
            Verdict::Duplicate
        } else {
            Verdict::Pass
        }
    });

    let acks = Rc::new(RefCell::new(0usize));
    let counter = acks.clone();
    let server_condition: Condition = Box::new(move |payload: &[u8]| {
        if ACK_KINDS.contains(&kind_of(payload)) {
            *counter.borrow_mut() += 1;
        }
        Verdict::Pass
    });

    let mut pair = Pair::conditioned(
        fast_config(),
        fast_config(),
        Some(server_condition),
        Some(client_condition),
    );
    let count = Rc::new(RefCell::new(0u32));
    let sink = count.clone();
    pair.server
        .register_handler(MSG_PING, move |_, _| *sink.borrow_mut() += 1)
        .expect("first registration");
    pair.connect();

    let msg = pair.client.message_with_id(SendMode::Reliable, MSG_PING);
    pair.client.send(msg).expect("connected");

    pair.pump_until(2000, |_| *acks.borrow() >= 2);
    pair.pump_for(50);
    // both copies were acked, but the handler ran only once
    assert_eq!(*count.borrow(), 1);
    assert_eq!(*acks.borrow(), 2);
}

#[test]
fn unreliable_messages_flow_both_ways() {
    let mut pair = Pair::new(fast_config(), fast_config());
    let to_server = Rc::new(RefCell::new(Vec::new()));
    let sink = to_server.clone();
    pair.server
        .register_handler(MSG_PING, move |_, msg| sink.borrow_mut().push(msg.get_u32()))
        .expect("first registration");
    let to_client = Rc::new(RefCell::new(Vec::new()));
    let sink = to_client.clone();
    pair.client
        .register_handler(MSG_PING, move |msg| sink.borrow_mut().push(msg.get_u32()))
        .expect("first registration");
    pair.connect();

    let mut msg = pair.client.message_with_id(SendMode::Unreliable, MSG_PING);
    msg.add_u32(11).expect("fits");
    pair.client.send(msg);

    let mut msg = pair.server.message_with_id(SendMode::Unreliable, MSG_PING);
    msg.add_u32(22).expect("fits");
    pair.server.send(msg, 1);

    pair.pump_until(2000, |_| {
        !to_server.borrow().is_empty() && !to_client.borrow().is_empty()
    });
    assert_eq!(*to_server.borrow(), vec![11]);
    assert_eq!(*to_client.borrow(), vec![22]);
}

#[test]
fn relay_filter_forwards_to_other_clients() {
    let mut server_io = ChannelServer::new();
    let first_io = server_io.link();
    let second_io = server_io.link();
    let server_config = Config {
        relay_filter: vec![MSG_RELAYED],
        ..fast_config()
    };
    let mut server = Server::with_config(server_io, server_config);
    server.start(0).expect("channel server always starts");
    let mut first = Client::with_config(first_io, fast_config());
    let mut second = Client::with_config(second_io, fast_config());

    let relayed = Rc::new(RefCell::new(Vec::new()));
    let sink = relayed.clone();
    second
        .register_handler(MSG_RELAYED, move |msg| sink.borrow_mut().push(msg.get_str()))
        .expect("first registration");
    let echoed_back = Rc::new(RefCell::new(0u32));
    let sink = echoed_back.clone();
    first
        .register_handler(MSG_RELAYED, move |_| *sink.borrow_mut() += 1)
        .expect("first registration");

    let pump = |first: &mut Client<crosswire_channel::ChannelClient>,
                second: &mut Client<crosswire_channel::ChannelClient>,
                server: &mut Server<ChannelServer>| {
        let _ = first.update();
        let _ = second.update();
        let _ = server.update();
        std::thread::sleep(common::STEP);
    };

    first.connect("channel").expect("fresh link");
    second.connect("channel").expect("fresh link");
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !(first.is_connected() && second.is_connected()) {
        assert!(std::time::Instant::now() < deadline, "clients stuck");
        pump(&mut first, &mut second, &mut server);
    }

    let mut msg = first.message_with_id(SendMode::Reliable, MSG_RELAYED);
    msg.add_str("relayed hello").expect("fits");
    first.send(msg).expect("connected");

    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while relayed.borrow().is_empty() {
        assert!(std::time::Instant::now() < deadline, "relay never arrived");
        pump(&mut first, &mut second, &mut server);
    }
    assert_eq!(*relayed.borrow(), vec!["relayed hello".to_owned()]);
    // the sender does not get its own message back
    pump(&mut first, &mut second, &mut server);
    assert_eq!(*echoed_back.borrow(), 0);
}

#[test]
fn reliable_broadcast_reaches_every_client() {
    let mut server_io = ChannelServer::new();
    let first_io = server_io.link();
    let second_io = server_io.link();
    let mut server = Server::with_config(server_io, fast_config());
    server.start(0).expect("channel server always starts");
    let mut first = Client::with_config(first_io, fast_config());
    let mut second = Client::with_config(second_io, fast_config());

    let hits = Rc::new(RefCell::new(Vec::new()));
    for (tag, client) in [(1u32, &mut first), (2u32, &mut second)] {
        let sink = hits.clone();
        client
            .register_handler(MSG_PING, move |msg| {
                sink.borrow_mut().push((tag, msg.get_u32()));
            })
            .expect("first registration");
    }

    let pump = |first: &mut Client<crosswire_channel::ChannelClient>,
                second: &mut Client<crosswire_channel::ChannelClient>,
                server: &mut Server<ChannelServer>| {
        let _ = first.update();
        let _ = second.update();
        let _ = server.update();
        std::thread::sleep(common::STEP);
    };

    first.connect("channel").expect("fresh link");
    second.connect("channel").expect("fresh link");
    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while !(first.is_connected() && second.is_connected()) {
        assert!(std::time::Instant::now() < deadline, "clients stuck");
        pump(&mut first, &mut second, &mut server);
    }

    let mut msg = server.message_with_id(SendMode::Reliable, MSG_PING);
    msg.add_u32(99).expect("fits");
    server.broadcast(msg);

    let deadline = std::time::Instant::now() + Duration::from_millis(2000);
    while hits.borrow().len() < 2 {
        assert!(std::time::Instant::now() < deadline, "broadcast incomplete");
        pump(&mut first, &mut second, &mut server);
    }
    let mut got = hits.borrow().clone();
    got.sort_unstable();
    assert_eq!(got, vec![(1, 99), (2, 99)]);
}
