//! Private-data round trip through the connect/accept handshake.

mod common;

use common::{init_tracing, pick_service, test_addr};
use rpma::{ConnEvent, ConnReq, Context, Endpoint, Peer, RpmaError, PRIVATE_DATA_MAX};
use std::sync::mpsc;
use std::thread;

#[test]
fn private_data_round_trip() {
    init_tracing();
    let addr = test_addr();
    let service = pick_service();
    let blob = "hello-rpma-世界".as_bytes();
    assert_eq!(blob.len(), 17);

    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let (addr, service) = (addr.clone(), service.clone());
        let blob = blob.to_vec();
        thread::spawn(move || {
            let ctx = Context::resolve(&addr).unwrap();
            let peer = Peer::new(&ctx).unwrap();
            let mut ep = Endpoint::listen(&peer, &addr, &service).unwrap();
            ready_tx.send(()).unwrap();
            let req = ep.next_conn_req().unwrap();
            let conn = req.connect(None, &[]).unwrap();

            // the transport may pad the blob, the sent bytes lead
            assert!(conn.private_data().starts_with(&blob));

            assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
            conn.delete().unwrap();
            ep.shutdown().unwrap();
            peer.delete().unwrap();
        })
    };
    ready_rx.recv().unwrap();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let req = ConnReq::new(&peer, &addr, &service).unwrap();
    let conn = req.connect(None, blob).unwrap();
    conn.disconnect().unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    peer.delete().unwrap();
    server.join().unwrap();
}

#[test]
fn private_data_over_the_cap_is_invalid() {
    init_tracing();
    let addr = test_addr();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    // address and route resolution do not need a listener, the length
    // check fires before the handshake is armed
    let req = ConnReq::new(&peer, &addr, &pick_service()).unwrap();
    let blob = vec![0_u8; PRIVATE_DATA_MAX + 1];
    let err = req.connect(None, &blob).unwrap_err();
    assert!(matches!(err, RpmaError::Invalid(_)));
    peer.delete().unwrap();
}
