mod util;

use std::{cell::RefCell, rc::Rc, time::Duration};

use strand_net::{SendOptions, Settings, Worker};
use strand_wire::{
    MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED, Message, NodeId, PeerAddr, Status, Stored,
};
use util::*;

fn stored(rqid: u64) -> Message {
    Message::Stored(Stored {
        rqid,
        log_id: 5,
        lsn: 1,
        wave: 1,
        status: Status::Ok,
        flags: 0,
        shard: 0,
    })
}

#[test]
fn on_sent_may_send_a_follow_up() {
    let (addr, peer) = spawn_peer(|listener| {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let _hello = read_frame(&mut stream).expect("no HELLO");
        write_msg(&mut stream, &ack(Status::Ok, MAX_PROTOCOL_SUPPORTED, 0), MIN_PROTOCOL_SUPPORTED);

        let mut rqids = Vec::new();
        for _ in 0..2 {
            let frame = read_frame(&mut stream).expect("missing frame");
            let Message::Stored(stored) = frame.decode(MAX_PROTOCOL_SUPPORTED) else {
                panic!("expected STORED");
            };
            rqids.push(stored.rqid);
        }
        rqids
    });

    let node = NodeId::new(1, 1);
    let config = config_view(vec![node_entry(1, addr, 1)]);
    let mut worker = Worker::new(Settings::default(), config, None).unwrap();

    let fired: Rc<RefCell<Vec<u64>>> = Rc::default();

    // The first message's on-sent issues the follow-up from inside the
    // callback; the peer must observe it after the original.
    let fired_outer = Rc::clone(&fired);
    worker
        .send_message(
            stored(1),
            PeerAddr::Server(node),
            SendOptions::default().on_sent(move |status, worker| {
                assert_eq!(status, Status::Ok);
                fired_outer.borrow_mut().push(1);
                let fired_inner = Rc::clone(&fired_outer);
                worker
                    .send_message(
                        stored(2),
                        PeerAddr::Server(node),
                        SendOptions::default().on_sent(move |status, _| {
                            assert_eq!(status, Status::Ok);
                            fired_inner.borrow_mut().push(2);
                        }),
                    )
                    .expect("reentrant send rejected");
            }),
        )
        .expect("send rejected");

    assert!(
        pump_until(&mut worker, Duration::from_secs(5), |_| fired.borrow().len() == 2),
        "callbacks never fired"
    );
    // Exactly once each, in order.
    assert_eq!(*fired.borrow(), vec![1, 2]);
    assert_eq!(peer.join().unwrap(), vec![1, 2]);
}

#[test]
fn send_from_on_close_builds_a_fresh_connection() {
    let (addr, peer) = spawn_peer(|listener| {
        let mut delivered = Vec::new();
        // The worker tears the first session down and immediately dials a
        // second one from inside the close callback.
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().expect("accept failed");
            let _hello = read_frame(&mut stream).expect("no HELLO");
            write_msg(
                &mut stream,
                &ack(Status::Ok, MAX_PROTOCOL_SUPPORTED, 0),
                MIN_PROTOCOL_SUPPORTED,
            );
            while let Ok(frame) = read_frame(&mut stream) {
                let Message::Stored(stored) = frame.decode(MAX_PROTOCOL_SUPPORTED) else {
                    panic!("expected STORED");
                };
                delivered.push(stored.rqid);
            }
        }
        delivered
    });

    let node = NodeId::new(1, 1);
    let peer_addr = PeerAddr::Server(node);
    let config = config_view(vec![node_entry(1, addr, 1)]);
    let mut worker = Worker::new(Settings::default(), config, None).unwrap();

    worker.send_message(stored(1), peer_addr, SendOptions::default()).expect("send rejected");
    assert!(
        pump_until(&mut worker, Duration::from_secs(5), |w| w.sender().is_handshaken(peer_addr)),
        "handshake never completed"
    );
    let first_id = worker.sender().connection_id(peer_addr).expect("no connection");

    let observed: Rc<RefCell<Option<(Status, Option<u64>)>>> = Rc::default();
    let observed_in_cb = Rc::clone(&observed);
    worker
        .send_message(
            stored(2),
            peer_addr,
            SendOptions::default().on_close(move |status, worker| {
                // The old connection is already unindexed; this send goes
                // to a brand new one.
                worker
                    .send_message(stored(9), peer_addr, SendOptions::default())
                    .expect("send from on-close rejected");
                let new_id = worker.sender().connection_id(peer_addr);
                *observed_in_cb.borrow_mut() = Some((status, new_id));
            }),
        )
        .expect("send rejected");

    // Let the second message drain before tearing the connection down.
    pump(&mut worker, Duration::from_millis(200));
    worker.close_connection(peer_addr, Status::Internal);

    assert!(
        pump_until(&mut worker, Duration::from_secs(5), |w| {
            observed.borrow().is_some() && w.sender().is_handshaken(peer_addr)
        }),
        "close callback or reconnect never happened"
    );
    let (reason, second_id) = observed.borrow().clone().expect("on-close never fired");
    assert_eq!(reason, Status::Internal);
    let second_id = second_id.expect("no replacement connection");
    assert_ne!(first_id, second_id, "replacement must be a distinct connection");

    // Both sessions' messages arrived, the reconnect delivery last.
    assert!(
        pump_until(&mut worker, Duration::from_secs(5), |w| {
            w.sender().buffered_bytes(peer_addr) == Some(0)
        }),
        "follow-up never drained"
    );
    drop(worker);
    assert_eq!(peer.join().unwrap(), vec![1, 2, 9]);
}
