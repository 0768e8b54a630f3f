use std::thread;
use std::time::Duration;

use serial_test::serial;

use crate::comm::{CommError, Communicator, Message, local_mesh};
use crate::tests::init;

const SHORT: Duration = Duration::from_millis(200);
const LONG: Duration = Duration::from_secs(10);

#[test]
fn point_to_point_in_order() {
    let mut mesh = local_mesh(2, LONG);
    let mut b = mesh.pop().unwrap();
    let a = mesh.pop().unwrap();
    assert_eq!((a.rank(), a.size()), (0, 2));
    assert_eq!((b.rank(), b.size()), (1, 2));

    a.send(1, 5, Message::Text("first".into())).unwrap();
    a.send(1, 5, Message::Text("second".into())).unwrap();

    assert_eq!(b.recv(0, 5).unwrap(), Message::Text("first".into()));
    assert_eq!(b.recv(0, 5).unwrap(), Message::Text("second".into()));
}

#[test]
fn recv_matches_tag_and_defers_others() {
    let mut mesh = local_mesh(2, LONG);
    let mut b = mesh.pop().unwrap();
    let a = mesh.pop().unwrap();

    a.send(1, 1, Message::Text("tag one".into())).unwrap();
    a.send(1, 2, Message::Sketch(vec![vec![1.0, 2.0]])).unwrap();

    assert_eq!(b.recv(0, 2).unwrap(), Message::Sketch(vec![vec![1.0, 2.0]]));
    assert_eq!(b.recv(0, 1).unwrap(), Message::Text("tag one".into()));
}

#[test]
fn recv_times_out() {
    init();
    let mut mesh = local_mesh(2, SHORT);
    let _a = mesh.remove(0);
    let mut b = mesh.remove(0);

    let err = b.recv(0, 9).unwrap_err();
    assert!(matches!(err, CommError::Timeout { rank: 1, peer: 0, tag: 9, .. }));
}

#[test]
fn dropped_peer_is_disconnected() {
    let mut mesh = local_mesh(2, LONG);
    let mut b = mesh.remove(1);
    let a = mesh.remove(0);
    drop(a);

    let err = b.recv(0, 0).unwrap_err();
    assert_eq!(err, CommError::Disconnected { rank: 1, peer: 0 });
    let err = b.send(0, 0, Message::Token).unwrap_err();
    assert_eq!(err, CommError::Disconnected { rank: 1, peer: 0 });
}

#[test]
fn out_of_range_rank() {
    let mut mesh = local_mesh(2, SHORT);
    let mut a = mesh.remove(0);
    assert_eq!(
        a.send(5, 0, Message::Token).unwrap_err(),
        CommError::InvalidRank { rank: 5, size: 2 }
    );
    assert!(matches!(a.recv(2, 0), Err(CommError::InvalidRank { .. })));
}

#[test]
#[serial]
fn barrier_and_broadcast_across_threads() {
    init();
    let mesh = local_mesh(4, LONG);

    let received: Vec<Message> = thread::scope(|s| {
        let handles: Vec<_> = mesh
            .into_iter()
            .map(|mut comm| {
                s.spawn(move || {
                    comm.barrier().unwrap();
                    let payload = (comm.rank() == 2).then(|| Message::Text("from two".into()));
                    let got = comm.broadcast(2, 40, payload).unwrap();
                    comm.barrier().unwrap();
                    got
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|m| *m == Message::Text("from two".into())));
}

#[test]
#[serial]
fn barrier_times_out_when_a_rank_is_missing() {
    let mut mesh = local_mesh(3, SHORT);
    let _absent = mesh.pop().unwrap();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = mesh
            .into_iter()
            .map(|mut comm| s.spawn(move || comm.barrier()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.iter().all(|r| r.is_err()));
}

#[test]
fn broadcast_root_without_payload_fails() {
    let mut mesh = local_mesh(1, SHORT);
    let mut solo = mesh.remove(0);
    assert!(matches!(
        solo.broadcast(0, 1, None),
        Err(CommError::UnexpectedMessage { .. })
    ));
    assert_eq!(solo.broadcast(0, 1, Some(Message::Token)).unwrap(), Message::Token);
    solo.barrier().unwrap();
}
