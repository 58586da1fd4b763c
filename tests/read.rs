//! One-sided read flows between two peers over a loopback connection.

mod common;

use common::{init_tracing, pick_service, test_addr};
use rpma::{
    ConnEvent, ConnReq, Context, Endpoint, MrUsage, Op, Peer, Placement, ReadFlag, RemoteMr,
    RpmaError,
};
use std::sync::mpsc;
use std::thread;

const LEN: usize = 4096;

/// Serve one connection: register `buf` with `usage`, hand out its
/// descriptor as accept-time private data and stay up until the client
/// disconnects.
fn serve_one(
    addr: String,
    service: String,
    usage: enumflags2::BitFlags<MrUsage>,
    ready_tx: mpsc::Sender<()>,
) {
    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut buf = vec![0xAB_u8; LEN];
    let mr = peer
        .register(&mut buf, usage, Placement::Volatile)
        .unwrap();
    let mut ep = Endpoint::listen(&peer, &addr, &service).unwrap();
    ready_tx.send(()).unwrap();

    let req = ep.next_conn_req().unwrap();
    let desc = mr.descriptor();
    let conn = req.connect(None, &desc).unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    ep.shutdown().unwrap();
    let _buf = mr.dereg().unwrap();
    peer.delete().unwrap();
}

#[test]
fn loopback_read() {
    init_tracing();
    let addr = test_addr();
    let service = pick_service();
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let (addr, service) = (addr.clone(), service.clone());
        thread::spawn(move || serve_one(addr, service, MrUsage::ReadSrc.into(), ready_tx))
    };
    ready_rx.recv().unwrap();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut dst_buf = vec![0_u8; LEN];
    let dst = peer
        .register(&mut dst_buf, MrUsage::ReadDst.into(), Placement::Volatile)
        .unwrap();
    let req = ConnReq::new(&peer, &addr, &service).unwrap();
    let conn = req.connect(None, &[]).unwrap();
    let src = RemoteMr::from_descriptor(conn.private_data()).unwrap();

    conn.post_read(1, &dst, 0, &src, 0, LEN, ReadFlag::WaitForCompletion.into())
        .unwrap();
    let cmpl = conn.next_completion().unwrap();
    assert_eq!(cmpl.op_context, 1);
    assert_eq!(cmpl.op, Op::Read);
    assert!(cmpl.is_success());
    assert!(dst.as_slice().iter().all(|&byte| byte == 0xAB));

    conn.disconnect().unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    let dst_buf = dst.dereg().unwrap();
    assert!(dst_buf.iter().all(|&byte| byte == 0xAB));
    peer.delete().unwrap();
    server.join().unwrap();
}

#[test]
fn partial_read() {
    init_tracing();
    let addr = test_addr();
    let service = pick_service();
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let (addr, service) = (addr.clone(), service.clone());
        thread::spawn(move || serve_one(addr, service, MrUsage::ReadSrc.into(), ready_tx))
    };
    ready_rx.recv().unwrap();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut dst_buf = vec![0_u8; LEN];
    let dst = peer
        .register(&mut dst_buf, MrUsage::ReadDst.into(), Placement::Volatile)
        .unwrap();
    let req = ConnReq::new(&peer, &addr, &service).unwrap();
    let conn = req.connect(None, &[]).unwrap();
    let src = RemoteMr::from_descriptor(conn.private_data()).unwrap();

    conn.post_read(7, &dst, 256, &src, 512, 128, ReadFlag::WaitForCompletion.into())
        .unwrap();
    let cmpl = conn.next_completion().unwrap();
    assert_eq!(cmpl.op_context, 7);
    assert!(cmpl.is_success());
    let written = dst.as_slice();
    assert!(written[..256].iter().all(|&byte| byte == 0));
    assert!(written[256..384].iter().all(|&byte| byte == 0xAB));
    assert!(written[384..].iter().all(|&byte| byte == 0));

    conn.disconnect().unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    drop(dst);
    peer.delete().unwrap();
    server.join().unwrap();
}

#[test]
fn completions_arrive_in_post_order() {
    init_tracing();
    let addr = test_addr();
    let service = pick_service();
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let (addr, service) = (addr.clone(), service.clone());
        thread::spawn(move || serve_one(addr, service, MrUsage::ReadSrc.into(), ready_tx))
    };
    ready_rx.recv().unwrap();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut dst_buf = vec![0_u8; LEN];
    let dst = peer
        .register(&mut dst_buf, MrUsage::ReadDst.into(), Placement::Volatile)
        .unwrap();
    let req = ConnReq::new(&peer, &addr, &service).unwrap();
    let conn = req.connect(None, &[]).unwrap();
    let src = RemoteMr::from_descriptor(conn.private_data()).unwrap();

    for ctx_token in 0..4_u64 {
        let offset = usize::try_from(ctx_token).unwrap() * 512;
        conn.post_read(
            ctx_token,
            &dst,
            offset,
            &src,
            offset,
            512,
            ReadFlag::WaitForCompletion.into(),
        )
        .unwrap();
    }
    for expected in 0..4_u64 {
        let cmpl = conn.next_completion().unwrap();
        assert!(cmpl.is_success());
        assert_eq!(cmpl.op_context, expected);
    }

    conn.disconnect().unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    drop(dst);
    peer.delete().unwrap();
    server.join().unwrap();
}

#[test]
fn read_without_permission_is_rejected() {
    init_tracing();
    let addr = test_addr();
    let service = pick_service();
    let (ready_tx, ready_rx) = mpsc::channel();
    // the server region permits ReadDst only, so its descriptor does not
    // allow the client to read from it
    let server = {
        let (addr, service) = (addr.clone(), service.clone());
        thread::spawn(move || serve_one(addr, service, MrUsage::ReadDst.into(), ready_tx))
    };
    ready_rx.recv().unwrap();

    let ctx = Context::resolve(&addr).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut dst_buf = vec![0_u8; LEN];
    let dst = peer
        .register(&mut dst_buf, MrUsage::ReadDst.into(), Placement::Volatile)
        .unwrap();
    let req = ConnReq::new(&peer, &addr, &service).unwrap();
    let conn = req.connect(None, &[]).unwrap();
    let src = RemoteMr::from_descriptor(conn.private_data()).unwrap();

    let err = conn
        .post_read(9, &dst, 0, &src, 0, LEN, ReadFlag::WaitForCompletion.into())
        .unwrap_err();
    assert!(matches!(err, RpmaError::Invalid(_)));

    // nothing was posted, so out-of-range arguments fail the same way
    let err = conn
        .post_read(9, &dst, LEN - 64, &src, 0, 128, ReadFlag::WaitForCompletion.into())
        .unwrap_err();
    assert!(matches!(err, RpmaError::Invalid(_)));

    conn.disconnect().unwrap();
    assert_eq!(conn.next_event().unwrap(), ConnEvent::Closed);
    conn.delete().unwrap();
    drop(dst);
    peer.delete().unwrap();
    server.join().unwrap();
}
