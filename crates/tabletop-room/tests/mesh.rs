//! Peer mesh behaviour across several sessions on one signaling hub.

mod common;

use std::time::Duration;

use common::{Harness, frames, settle};
use serde_json::json;
use tabletop_room::RoomNotice;
use tabletop_room::signaling::{PubSubTransport, SignalFrame};

fn ordered<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x > y { (x, y) } else { (y, x) }
}

#[tokio::test(start_paused = true)]
async fn two_peers_dial_once_from_the_larger_id() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    let b = h.peer("bob").await;

    a.handle.join(1).await.unwrap();
    settle().await;
    b.handle.join(2).await.unwrap();
    settle().await;

    let (hi, lo) = ordered(&a.peer_id, &b.peer_id);
    assert_eq!(h.net.dials(), vec![(hi.to_owned(), lo.to_owned())]);
    assert!(h.net.is_linked(&a.peer_id, &b.peer_id));

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.occupants.len(), 2);
    let bob = snap.occupants.iter().find(|o| o.slot_id == 2).unwrap();
    assert_eq!(bob.peer_id, b.peer_id);
    assert_eq!(bob.character_name.as_deref(), Some("bob the brave"));
    assert!(bob.has_stream);
    assert_eq!(snap.peers.connected_peers, vec![b.peer_id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_three_way_join_dials_each_pair_once() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    let b = h.peer("bob").await;
    let c = h.peer("carol").await;

    let (ra, rb, rc) = tokio::join!(a.handle.join(1), b.handle.join(2), c.handle.join(3));
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();
    settle().await;

    let ids = [&a.peer_id, &b.peer_id, &c.peer_id];
    for (i, x) in ids.iter().enumerate() {
        for y in &ids[i + 1..] {
            let (hi, lo) = ordered(x, y);
            assert_eq!(h.net.dial_count(hi, lo), 1, "{hi} -> {lo}");
            assert_eq!(h.net.dial_count(lo, hi), 0, "{lo} -> {hi}");
            assert!(h.net.is_linked(x, y));
        }
    }
    assert_eq!(h.net.dials().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_state_requests_do_not_redial() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    let b = h.peer("bob").await;
    a.handle.join(1).await.unwrap();
    b.handle.join(2).await.unwrap();
    settle().await;
    assert_eq!(h.net.dials().len(), 1);

    let (spy, mut rx) = h.spy().await;
    for _ in 0..3 {
        spy.send(SignalFrame {
            event: "request-state".into(),
            sender: "spy".into(),
            payload: json!({ "requester_id": "spy" }),
        })
        .await
        .unwrap();
    }
    settle().await;

    let announced = frames(&mut rx).into_iter().filter(|f| f.event == "user-joined").count();
    assert_eq!(announced, 6);
    assert_eq!(h.net.dials().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn initialize_publishes_under_the_new_peer_id() {
    let h = Harness::new(4);
    let (_spy, mut rx) = h.spy().await;
    let a = h.peer("alice").await;
    settle().await;

    let sent = frames(&mut rx);
    assert!(sent.iter().any(|f| f.event == "request-state" && f.sender == a.peer_id));

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.peer_id.as_deref(), Some(a.peer_id.as_str()));
    assert_eq!(snap.signaling, tabletop_room::signaling::ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn seated_peers_are_tracked_before_joining() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    let b = h.peer("bob").await;
    a.handle.join(3).await.unwrap();
    settle().await;

    let snap = b.handle.snapshot().await.unwrap();
    assert_eq!(snap.occupants.len(), 1);
    assert_eq!(snap.occupants[0].slot_id, 3);
    assert!(!snap.occupants[0].is_local);

    let err = b.handle.join(3).await.unwrap_err();
    assert!(matches!(err, tabletop_room::RoomError::SlotOccupied(3)));
    assert!(h.net.dials().is_empty());
}

#[tokio::test(start_paused = true)]
async fn latest_announcement_wins_the_seat() {
    let h = Harness::new(4);
    let mut a = h.peer("alice").await;
    a.handle.join(1).await.unwrap();
    let (spy, _rx) = h.spy().await;

    for ghost in ["ghost-1", "ghost-2"] {
        spy.send(SignalFrame {
            event: "user-joined".into(),
            sender: ghost.into(),
            payload: json!({
                "slot_id": 2,
                "participant_data": { "peer_id": ghost, "user_id": ghost, "character_name": null, "username": ghost }
            }),
        })
        .await
        .unwrap();
    }
    // Someone else claiming our seat is ignored.
    spy.send(SignalFrame {
        event: "user-joined".into(),
        sender: "ghost-3".into(),
        payload: json!({
            "slot_id": 1,
            "participant_data": { "peer_id": "ghost-3", "user_id": "x", "character_name": null, "username": "x" }
        }),
    })
    .await
    .unwrap();
    settle().await;

    let snap = a.handle.snapshot().await.unwrap();
    let seats: Vec<_> = snap.occupants.iter().map(|o| (o.slot_id, o.peer_id.as_str())).collect();
    assert_eq!(seats, vec![(1, a.peer_id.as_str()), (2, "ghost-2")]);
    assert!(a.drain().iter().any(|n| matches!(
        n,
        RoomNotice::SlotVacated { slot_id: 2, peer_id } if peer_id == "ghost-1"
    )));
}

#[tokio::test(start_paused = true)]
async fn leaving_peer_frees_its_seat_for_others() {
    let h = Harness::new(4);
    let mut a = h.peer("alice").await;
    let b = h.peer("bob").await;
    a.handle.join(1).await.unwrap();
    b.handle.join(2).await.unwrap();
    settle().await;
    a.drain();

    let outcome = b.handle.leave().await.unwrap();
    assert!(outcome.clean);
    settle().await;

    let notices = a.drain();
    assert!(notices.iter().any(|n| matches!(n, RoomNotice::SlotVacated { slot_id: 2, .. })));
    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.occupants.len(), 1);
    assert!(snap.peers.connected_peers.is_empty());
    assert!(!h.net.is_linked(&a.peer_id, &b.peer_id));
}

#[tokio::test(start_paused = true)]
async fn reconnect_reannounces_and_redials_only_the_lost_peer() {
    let h = Harness::new(4);
    let mut s = h.peer("sam").await;
    let p = h.peer("pat").await;
    let q = h.peer("quinn").await;
    s.handle.join(1).await.unwrap();
    p.handle.join(2).await.unwrap();
    q.handle.join(3).await.unwrap();
    settle().await;
    assert_eq!(h.net.dials().len(), 3);

    let (_spy, mut rx) = h.spy().await;
    s.transport.simulate_disconnect().await;
    settle().await;
    assert!(s.drain().iter().any(|n| matches!(n, RoomNotice::ConnectionWarning { .. })));

    // The link to pat drops during the outage; quinn stays up.
    h.net.cut(&s.peer_id, &p.peer_id);
    settle().await;
    s.transport.simulate_reconnect().await;
    settle().await;

    let early = frames(&mut rx);
    assert!(early.iter().any(|f| f.event == "request-state" && f.sender == s.peer_id));
    assert!(s.drain().iter().any(|n| matches!(n, RoomNotice::ConnectionRestored)));

    tokio::time::sleep(Duration::from_secs(5)).await;

    let later = frames(&mut rx);
    assert!(later.iter().any(|f| f.event == "user-joined" && f.sender == s.peer_id));

    let dials = h.net.dials();
    let redials = &dials[3..];
    assert_eq!(redials.len(), 1, "{redials:?}");
    let (from, to) = &redials[0];
    assert_eq!(ordered(from, to), ordered(&s.peer_id, &p.peer_id));
    assert!(h.net.is_linked(&s.peer_id, &p.peer_id));
    assert!(h.net.is_linked(&s.peer_id, &q.peer_id));
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_is_given_up_after_bounded_attempts() {
    let h = Harness::new(4);
    let mut a = h.peer("alice").await;
    a.handle.join(1).await.unwrap();

    // Ids are lowercase hex, so "zz" always sorts above ours: we never dial
    // on the announcement itself, only from health checks.
    let (spy, _rx) = h.spy().await;
    spy.send(SignalFrame {
        event: "user-joined".into(),
        sender: "zz-ghost".into(),
        payload: json!({
            "slot_id": 2,
            "participant_data": { "peer_id": "zz-ghost", "user_id": "g", "character_name": null, "username": "g" }
        }),
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(h.net.dial_count(&a.peer_id, "zz-ghost"), 0);

    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(h.net.dial_count(&a.peer_id, "zz-ghost"), 5);
    let notices = a.drain();
    let unreachable = notices
        .iter()
        .filter(|n| matches!(n, RoomNotice::PeerUnreachable { peer_id } if peer_id == "zz-ghost"))
        .count();
    assert_eq!(unreachable, 1);

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.occupants.len(), 1);
    assert!(snap.last_health.is_some());
}

#[tokio::test(start_paused = true)]
async fn manual_retry_reaches_a_peer_that_came_back() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    let b = h.peer("bob").await;
    let (hi, lo) = if a.peer_id > b.peer_id { (&a, &b) } else { (&b, &a) };

    h.net.set_unreachable(&lo.peer_id, true);
    lo.handle.join(1).await.unwrap();
    settle().await;
    hi.handle.join(2).await.unwrap();
    settle().await;
    assert!(!h.net.is_linked(&a.peer_id, &b.peer_id));

    h.net.set_unreachable(&lo.peer_id, false);
    // Still dialing, so nothing new is placed yet.
    assert!(!hi.handle.retry_peer(lo.peer_id.clone()).await.unwrap());

    // Past the dial timeout the stuck call is dropped by the health check.
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;
    assert!(h.net.is_linked(&a.peer_id, &b.peer_id));
}

#[tokio::test(start_paused = true)]
async fn health_check_leaves_pending_dials_alone_while_signaling_is_down() {
    let h = Harness::new(4);
    let a = h.peer("alice").await;
    a.handle.join(1).await.unwrap();

    // "0" sorts below every hex id, so we dial it; nobody answers.
    let (spy, _rx) = h.spy().await;
    spy.send(SignalFrame {
        event: "user-joined".into(),
        sender: "0".into(),
        payload: json!({
            "slot_id": 2,
            "participant_data": { "peer_id": "0", "user_id": "g", "character_name": null, "username": "g" }
        }),
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(h.net.dial_count(&a.peer_id, "0"), 1);

    a.transport.simulate_disconnect().await;
    settle().await;
    // Past the dial timeout, but before the first periodic check.
    tokio::time::sleep(Duration::from_secs(20)).await;

    let report = a.handle.check_health().await.unwrap();
    assert!(report.skipped);
    assert_eq!(a.handle.snapshot().await.unwrap().peers.active_calls, 1);
    assert_eq!(h.net.dial_count(&a.peer_id, "0"), 1);

    a.transport.simulate_reconnect().await;
    settle().await;
    let report = a.handle.check_health().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.retry, vec!["0".to_string()]);
    assert_eq!(h.net.dial_count(&a.peer_id, "0"), 2);
}
