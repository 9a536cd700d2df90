mod common;

use std::sync::{Arc, Mutex};

use peersync::{Diagnostic, LocalMesh, ReplicationEvent, SubscriptionState, Transport};

use common::{join, settle, Pawn};

#[test]
fn peers_catch_up_both_ways_on_join() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    let events = settle(&mut [&mut a, &mut b]);

    let a_peer = a.local_peer().unwrap();
    let b_peer = b.local_peer().unwrap();
    assert!(events.contains(&ReplicationEvent::CaughtUp(a_peer)));
    assert!(events.contains(&ReplicationEvent::CaughtUp(b_peer)));
    assert_eq!(a.subscription_state(b_peer), SubscriptionState::CaughtUp);
    assert_eq!(b.subscription_state(a_peer), SubscriptionState::CaughtUp);
}

#[test]
fn property_write_reaches_remote_peer_exactly_once() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);

    let (id, pawn_a) = a.spawn_object::<Pawn>().unwrap();
    a.tick();
    let events = b.tick();
    assert!(events.iter().any(|event| matches!(
        event,
        ReplicationEvent::ObjectSpawned { id: spawned, .. } if *spawned == id
    )));

    let pawn_b: Pawn = b.take_spawned(id).unwrap();
    let seen: Arc<Mutex<Vec<[f32; 3]>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    pawn_b
        .position
        .on_changed(move |value| seen_cb.lock().unwrap().push(*value))
        .unwrap();

    pawn_a.position.set([1.0, 2.0, 3.0]);
    a.tick();
    b.tick();
    assert_eq!(pawn_b.position.get(), [1.0, 2.0, 3.0]);
    assert_eq!(*seen.lock().unwrap(), vec![[1.0, 2.0, 3.0]]);

    // Setting the same value again is a no-op all the way through.
    pawn_a.position.set([1.0, 2.0, 3.0]);
    a.tick();
    b.tick();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn values_set_before_announce_arrive_with_the_spawn() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);

    let (id, pawn_a) = a.spawn_object::<Pawn>().unwrap();
    pawn_a.label.set("hello".to_string());
    a.tick();
    b.tick();

    let pawn_b: Pawn = b.take_spawned(id).unwrap();
    assert_eq!(pawn_b.label.get(), "hello");
}

#[test]
fn non_owner_writes_never_leave_the_peer() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);

    let (id, pawn_a) = a.spawn_object::<Pawn>().unwrap();
    a.tick();
    b.tick();
    let pawn_b: Pawn = b.take_spawned(id).unwrap();

    // The remote handle is writable locally, but the record is not owned
    // here, so nothing is serialized for it.
    pawn_b.position.set([9.0, 9.0, 9.0]);
    b.tick();
    a.tick();
    assert_eq!(pawn_a.position.get(), [0.0, 0.0, 0.0]);
}

#[test]
fn despawn_removes_the_object_everywhere() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);

    let (id, _pawn_a) = a.spawn_object::<Pawn>().unwrap();
    a.tick();
    b.tick();
    assert!(b.graph().contains(id));

    a.despawn_object(id).unwrap();
    a.tick();
    let events = b.tick();
    assert!(events.contains(&ReplicationEvent::ObjectDespawned { id }));
    assert!(!b.graph().contains(id));
    assert!(!a.graph().contains(id));
}

#[test]
fn quiet_ticks_exchange_no_state() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);

    let (_id, _pawn) = a.spawn_object::<Pawn>().unwrap();
    settle(&mut [&mut a, &mut b]);

    // Nothing dirty, nothing pending: ticks produce no events at all.
    for _ in 0..3 {
        assert!(a.tick().is_empty());
        assert!(b.tick().is_empty());
    }
}

#[test]
fn garbage_on_the_wire_is_reported_and_changes_nothing() {
    let mesh = LocalMesh::new();
    let mut a = join(&mesh);
    let mut b = join(&mesh);
    settle(&mut [&mut a, &mut b]);
    let b_peer = b.local_peer().unwrap();

    let (id, pawn_a) = a.spawn_object::<Pawn>().unwrap();
    pawn_a.position.set([3.0, 3.0, 3.0]);
    settle(&mut [&mut a, &mut b]);
    let pawn_b: Pawn = b.take_spawned(id).unwrap();
    assert_eq!(pawn_b.position.get(), [3.0, 3.0, 3.0]);

    // An unknown kind byte and a truncated blob, straight onto the wire.
    b.transport_mut().send_delta(&[0xff, 0xaa, 0x55]).unwrap();
    b.transport_mut().send_delta(&[0x00, 0x01]).unwrap();
    let events = a.tick();
    let reported = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                ReplicationEvent::Diagnostic(Diagnostic::MalformedDelta { source, .. })
                    if *source == b_peer
            )
        })
        .count();
    assert_eq!(reported, 2);
    assert!(a.graph().contains(id));
    assert_eq!(pawn_a.position.get(), [3.0, 3.0, 3.0]);

    // The streams are not wedged; ordinary replication continues.
    pawn_a.position.set([4.0, 4.0, 4.0]);
    a.tick();
    b.tick();
    assert_eq!(pawn_b.position.get(), [4.0, 4.0, 4.0]);
}
