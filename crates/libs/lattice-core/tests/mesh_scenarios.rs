//! Multi-node routing, topology, sync, failover and queue scenarios.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{ManualPlatform, Net};
use lattice_core::{MeshConfig, Priority, QueueState, TransportError};

#[test]
fn two_node_broadcast_is_delivered_exactly_once() {
    let mut net = Net::new(&[100, 200]);
    let inbox_1 = net.attach_inbox(0);
    let inbox_2 = net.attach_inbox(1);
    net.link(0, 1);
    net.pump();

    net.node(0).send_broadcast("hello", false);
    net.pump();

    assert_eq!(inbox_2.borrow().as_slice(), &[(100, "hello".to_string())]);
    assert!(inbox_1.borrow().is_empty(), "origin must not re-receive its own broadcast");
}

#[test]
fn three_node_relay_delivers_single_to_destination_only() {
    // linear: 10 <-> 20 <-> 30
    let mut net = Net::new(&[10, 20, 30]);
    let inbox_mid = net.attach_inbox(1);
    let inbox_far = net.attach_inbox(2);
    net.link(0, 1);
    net.link(1, 2);
    net.pump();

    assert!(net.node(0).is_connected_to(30), "layout should converge through the relay");
    net.node(0).send_single(30, "x").expect("route exists");
    net.pump();

    assert_eq!(inbox_far.borrow().as_slice(), &[(10, "x".to_string())]);
    assert!(inbox_mid.borrow().is_empty(), "relay must not deliver in-transit payloads");
}

#[test]
fn broadcast_covers_every_node_exactly_once() {
    // line of four
    let mut net = Net::new(&[1, 2, 3, 4]);
    let inboxes: Vec<_> = (0..4).map(|i| net.attach_inbox(i)).collect();
    net.link(0, 1);
    net.link(1, 2);
    net.link(2, 3);
    net.pump();

    net.node(1).send_broadcast("wave", false);
    net.pump();

    assert!(inboxes[1].borrow().is_empty());
    for i in [0usize, 2, 3] {
        let inbox = inboxes[i].borrow();
        assert_eq!(inbox.len(), 1, "node index {i} saw {:?}", inbox.as_slice());
        assert_eq!(inbox[0], (2, "wave".to_string()));
    }
}

#[test]
fn node_list_and_subtree_views_converge() {
    let mut net = Net::new(&[1, 2, 3, 4]);
    net.link(0, 1);
    net.link(1, 2);
    net.link(1, 3);
    net.pump();

    let mut seen = net.node(0).get_node_list();
    seen.sort_unstable();
    assert_eq!(seen, vec![2, 3, 4]);
    assert_eq!(net.node(2).sub_connection_count(), 3);
    // no node's subtree ever contains the node itself
    for index in 0..4 {
        let tree = net.node(index).topology().clone();
        let own = tree.node_id;
        assert!(!tree.subs.iter().any(|sub| sub.contains(own)));
    }
}

#[test]
fn closing_a_redundant_link_on_loop_detection() {
    // triangle: the third link would create a routing cycle
    let mut net = Net::new(&[1, 2, 3]);
    net.link(0, 1);
    net.link(1, 2);
    net.pump();
    assert_eq!(net.node(0).connection_count(), 1);

    net.link(2, 0);
    net.pump();

    // the redundant direct link got dropped by at least one of its ends
    let direct_links = net.node(0).connection_count() + net.node(2).connection_count();
    assert!(direct_links <= 3, "loop link survived: {direct_links} ends");
    // the mesh still routes
    let inbox = net.attach_inbox(2);
    net.node(0).send_single(3, "after-loop").expect("route exists");
    net.pump();
    assert_eq!(inbox.borrow().len(), 1);
}

#[test]
fn dropped_link_fires_callbacks_and_shrinks_layout() {
    let mut net = Net::new(&[1, 2]);
    let dropped: Rc<RefCell<Vec<(u32, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let dropped = dropped.clone();
        net.node(0).on_dropped_connection(Box::new(move |peer, station| {
            dropped.borrow_mut().push((peer, station));
        }));
    }
    net.link(0, 1);
    net.pump();
    assert!(net.node(0).is_connected_to(2));

    // silence past the connection timeout
    net.advance(31_000);
    net.update_all();

    assert_eq!(dropped.borrow().as_slice(), &[(2, false)]);
    assert!(!net.node(0).is_connected_to(2));
    assert_eq!(net.node(0).get_node_list(), Vec::<u32>::new());
}

#[test]
fn time_sync_respects_authority() {
    let mut net = Net::new(&[7, 8]);
    let adjusted_auth: Rc<Cell<i64>> = Rc::new(Cell::new(i64::MIN));
    {
        let adjusted = adjusted_auth.clone();
        net.node(0).on_node_time_adjusted(Box::new(move |delta| adjusted.set(delta)));
    }
    let adjusted_plain: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    {
        let adjusted = adjusted_plain.clone();
        net.node(1).on_node_time_adjusted(Box::new(move |_| adjusted.set(true)));
    }
    net.node(0).set_time_authority(true);
    net.link(0, 1);
    net.pump();

    // several sync rounds
    net.run_for(30_000, 10_000);

    assert!(net.node(0).time_state().has_authority);
    assert!(!net.node(1).time_state().has_authority);
    // the authoritative side never adopted
    assert_eq!(adjusted_auth.get(), i64::MIN);
    assert!(adjusted_plain.get(), "non-authoritative side should adopt");
}

#[test]
fn delay_measurement_round_trips_through_a_relay() {
    let mut net = Net::new(&[10, 20, 30]);
    net.link(0, 1);
    net.link(1, 2);
    net.pump();

    let measured: Rc<RefCell<Vec<(u32, i64)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let measured = measured.clone();
        net.node(0).on_node_delay_received(Box::new(move |node, delay| {
            measured.borrow_mut().push((node, delay));
        }));
    }

    net.node(0).start_delay_measurement(30).expect("route exists");
    net.pump();

    let measured = measured.borrow();
    assert_eq!(measured.len(), 1);
    assert_eq!(measured[0].0, 30);
    assert!(measured[0].1 >= 0);
}

#[test]
fn failed_primary_triggers_election_takeover_and_lost_notification() {
    // node 1 is the bridge; 42 and 17 are candidates with equal uptime, so
    // RSSI decides
    let mut net = Net::empty();
    let clock = net.clock.clone();
    net.push_node(1, MeshConfig::default(), ManualPlatform::new(clock.clone()));
    for (id, rssi, memory) in [(42u32, -40i8, 50_000u32), (17, -55, 30_000)] {
        let mut config = MeshConfig::default();
        config.set_router_credentials("upstream", "pw").expect("creds");
        config.enable_bridge_failover = true;
        net.push_node(id, config, ManualPlatform::with_radio(clock.clone(), rssi, memory));
    }

    let role_events: Rc<RefCell<Vec<(u32, bool, String)>>> = Rc::new(RefCell::new(Vec::new()));
    for index in 1..=2 {
        let events = role_events.clone();
        let id = net.nodes[index].node_id();
        net.nodes[index].on_bridge_role_changed(Box::new(move |is_bridge, reason| {
            events.borrow_mut().push((id, is_bridge, reason.to_string()));
        }));
    }
    let status_events: Rc<RefCell<Vec<(u32, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let events = status_events.clone();
        net.nodes[1].on_bridge_status_changed(Box::new(move |bridge, internet| {
            events.borrow_mut().push((bridge, internet));
        }));
    }

    // line topology: 42 - 1 - 17
    net.link(1, 0);
    net.link(0, 2);
    net.pump();

    // healthy bridge announces itself
    net.node(0).become_bridge();
    net.node(0).set_bridge_status(true, -50, 6, "192.168.1.1");
    net.update_all();
    net.pump();
    assert_eq!(net.node(1).get_primary_bridge(), Some(1));
    assert!(net.node(2).has_internet_connection());

    // the uplink dies; the flip broadcasts immediately and starts elections
    net.node(0).set_bridge_status(false, -50, 6, "192.168.1.1");
    net.pump();
    assert_eq!(status_events.borrow().as_slice(), &[(1, false)]);
    assert!(!net.node(1).has_internet_connection());

    // collection window closes; update the winner first so the loser is
    // still collecting when the takeover floods through
    net.advance(5_100);
    net.nodes[1].update();
    net.pump();
    net.update_all();
    net.pump();

    assert!(net.node(1).is_bridge(), "best RSSI wins");
    assert!(!net.node(2).is_bridge());
    {
        let events = role_events.borrow();
        assert!(events.contains(&(42, true, "Won bridge election".to_string())));
        assert!(events.contains(&(17, false, "Another node won election".to_string())));
    }

    // the new bridge heartbeats; the mesh sees internet again
    net.node(1).set_bridge_status(true, -40, 6, "10.0.0.1");
    net.run_for(10_000, 10_000);
    assert_eq!(net.node(2).get_primary_bridge(), Some(42));
    assert!(net.node(2).has_internet_connection());
}

#[test]
fn queue_flushes_when_internet_returns() {
    let mut net = Net::new(&[5]);
    net.node(0).set_message_queue_enabled(true);

    let sent: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        net.node(0).set_queue_sender(Box::new(move |message| {
            sent.borrow_mut().push(message.destination.clone());
            true
        }));
    }
    let states: Rc<RefCell<Vec<(QueueState, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let states = states.clone();
        net.node(0).on_queue_state_changed(Box::new(move |state, count| {
            states.borrow_mut().push((state, count));
        }));
    }

    net.node(0)
        .queue_message(b"reading-1".to_vec(), "cloud/a", Priority::Normal)
        .expect("queued");
    net.node(0)
        .queue_message(b"reading-2".to_vec(), "cloud/b", Priority::Critical)
        .expect("queued");
    assert_eq!(net.node(0).queue_len(), 2);
    assert_eq!(states.borrow().first(), Some(&(QueueState::Normal, 1)));

    // no uplink yet: nothing moves
    net.update_all();
    assert_eq!(net.node(0).queue_len(), 2);

    // the node itself becomes a connected bridge; the flush happens on the
    // next engine pass and drains in priority order
    net.node(0).become_bridge();
    net.node(0).set_bridge_status(true, -50, 6, "gw");
    net.update_all();

    assert_eq!(sent.borrow().as_slice(), &["cloud/b".to_string(), "cloud/a".to_string()]);
    assert_eq!(net.node(0).queue_len(), 0);
    assert_eq!(states.borrow().last(), Some(&(QueueState::Empty, 0)));
    assert_eq!(net.node(0).queue_stats().total_sent, 2);
}

#[test]
fn queue_survives_a_restart_through_the_persistence_blob() {
    let clock = Rc::new(Cell::new(0u64));
    let mut config = MeshConfig::default();
    config.enable_message_queue = true;
    config.queue_persistence = true;

    let mut net = Net::empty();
    net.push_node(9, config.clone(), ManualPlatform::new(clock.clone()));
    net.node(0)
        .queue_message(b"boot".to_vec(), "cloud/boot", Priority::Critical)
        .expect("queued");
    net.node(0)
        .queue_message(b"late".to_vec(), "cloud/late", Priority::Low)
        .expect("queued");
    assert!(net.node(0).queue_needs_save());
    let blob = net.node(0).save_queue();
    assert!(!net.node(0).queue_needs_save(), "save clears the dirty flag");

    // a fresh process restores the queue from the host's blob
    let mut restarted = Net::empty();
    restarted.push_node(9, config, ManualPlatform::new(clock));
    restarted.node(0).load_queue(&blob);
    assert_eq!(restarted.node(0).queue_len(), 2);

    let sent: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        restarted.node(0).set_queue_sender(Box::new(move |message| {
            sent.borrow_mut().push(message.destination.clone());
            true
        }));
    }
    restarted.node(0).flush_queue();
    assert_eq!(sent.borrow().as_slice(), &["cloud/boot".to_string(), "cloud/late".to_string()]);
}

#[test]
fn user_package_handlers_and_consume_semantics() {
    let mut net = Net::new(&[1, 2, 3]);
    net.link(0, 1);
    net.link(1, 2);
    net.pump();

    // node 2 consumes type 150 but the type is registered propagating, so
    // node 3 still sees the flood
    let seen_mid: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    {
        let seen = seen_mid.clone();
        net.node(1)
            .register_package(150, true, Box::new(move |_, _, _| {
                seen.set(seen.get() + 1);
                true
            }))
            .expect("register");
    }
    let seen_far: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    {
        let seen = seen_far.clone();
        net.node(2)
            .register_package(150, true, Box::new(move |_, _, _| {
                seen.set(seen.get() + 1);
                true
            }))
            .expect("register");
    }

    #[derive(serde::Serialize)]
    struct Telemetry {
        reading: u32,
    }
    net.node(0).broadcast_user_package(150, &Telemetry { reading: 7 });
    net.pump();
    assert_eq!(seen_mid.get(), 1);
    assert_eq!(seen_far.get(), 1);

    // a non-propagating type stops at the consuming hop
    let seen_mid_np: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    {
        let seen = seen_mid_np.clone();
        net.node(1)
            .register_package(151, false, Box::new(move |_, _, _| {
                seen.set(seen.get() + 1);
                true
            }))
            .expect("register");
    }
    let seen_far_np: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    {
        let seen = seen_far_np.clone();
        net.node(2)
            .register_package(151, false, Box::new(move |_, _, _| {
                seen.set(seen.get() + 1);
                true
            }))
            .expect("register");
    }
    net.node(0).broadcast_user_package(151, &Telemetry { reading: 8 });
    net.pump();
    assert_eq!(seen_mid_np.get(), 1);
    assert_eq!(seen_far_np.get(), 0, "consumed non-propagating broadcast must stop");
}

#[test]
fn undecodable_frame_closes_the_link() {
    let mut net = Net::new(&[1, 2]);
    net.link(0, 1);
    net.pump();
    assert_eq!(net.node(0).connection_count(), 1);

    // find node 0's single connection id through the pipe bookkeeping
    let conn = net.pipes.iter().find(|p| p.to == 0).map(|p| p.to_conn).expect("pipe");
    let err = net.node(0).handle_frame(conn, b"\x00\x01 not json");
    assert_eq!(err, Err(TransportError::Decode));
    assert_eq!(net.node(0).connection_count(), 0);

    // a well-formed envelope with a bad field only discards the frame
    let mut net = Net::new(&[1, 2]);
    net.link(0, 1);
    net.pump();
    let conn = net.pipes.iter().find(|p| p.to == 0).map(|p| p.to_conn).expect("pipe");
    let ok = net.node(0).handle_frame(conn, br#"{"type":9,"from":2}"#);
    assert_eq!(ok, Ok(()));
    assert_eq!(net.node(0).connection_count(), 1);
}
