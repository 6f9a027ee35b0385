use crate::*;

use treecast_services::loopback::Ether;
use treecast_services::{MerkleStore, Receiver, RxOutcome};

/// One transmitter, one unbound receiver: the receiver adopts the file and
/// ends with a byte-identical copy and a complete tree.
#[test]
fn test_transfer_to_unbound_receiver() {
    let src = TempStorage::new("src");
    let dst = TempStorage::new("dst");
    let data = content(10_000, 1);
    write_file(&src, "REPORT.PDF", &data).unwrap();

    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut rx_radio = ether.station();
    let tx_ctx = Context::new();

    let (passes, outcome) = std::thread::scope(|s| {
        let tx = {
            let ctx = tx_ctx.clone();
            let src = &*src;
            let radio = &mut tx_radio;
            s.spawn(move || transmit_until_cancelled(radio, src, "REPORT.PDF", ctx, quick_config()))
        };
        let rx = {
            let dst = &*dst;
            let radio = &mut rx_radio;
            let tx_ctx = tx_ctx.clone();
            s.spawn(move || {
                let session = Session::new(radio, dst, Context::new(), quick_config());
                let mut rx = Receiver::new(session);
                let outcome = rx.listen();
                tx_ctx.cancel();
                outcome
            })
        };
        (tx.join().unwrap(), rx.join().unwrap())
    });

    assert_eq!(outcome, Ok(RxOutcome::Complete));
    assert!(passes.is_ok(), "transmitter failed: {passes:?}");
    assert_eq!(read_file(&dst, "REPORT.PDF").unwrap(), data);

    // The received tree re-checks clean against the received bytes.
    let mut file = dst.open("REPORT.PDF").unwrap();
    let mut tree = MerkleStore::open_local(&*dst, "REPORT.mkl", &mut file, FaultPolicy::Strict).unwrap();
    tree.check(&mut file).unwrap();
    assert!(tree.is_complete().unwrap());

    let mut src_file = src.open("REPORT.PDF").unwrap();
    let src_tree =
        MerkleStore::open_local(&*src, "REPORT.mkl", &mut src_file, FaultPolicy::Strict).unwrap();
    assert_eq!(tree.root_hash(), src_tree.root_hash());
}

/// Two receivers on the channel both complete from the same broadcasts.
#[test]
fn test_transfer_to_two_receivers() {
    let src = TempStorage::new("src");
    let dst_a = TempStorage::new("dst-a");
    let dst_b = TempStorage::new("dst-b");
    let data = content(3_000, 2);
    write_file(&src, "MAP.PNG", &data).unwrap();

    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut radio_a = ether.station();
    let mut radio_b = ether.station();
    let tx_ctx = Context::new();
    let remaining = AtomicU64::new(2);

    let outcomes = std::thread::scope(|s| {
        {
            let ctx = tx_ctx.clone();
            let src = &*src;
            let radio = &mut tx_radio;
            s.spawn(move || transmit_until_cancelled(radio, src, "MAP.PNG", ctx, quick_config()));
        }
        let mut handles = Vec::new();
        for (radio, dst) in [(&mut radio_a, &*dst_a), (&mut radio_b, &*dst_b)] {
            let tx_ctx = tx_ctx.clone();
            let remaining = &remaining;
            handles.push(s.spawn(move || {
                let session = Session::new(radio, dst, Context::new(), quick_config());
                let outcome = Receiver::new(session).listen();
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    tx_ctx.cancel();
                }
                outcome
            }));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        tx_ctx.cancel();
        outcomes
    });

    assert_eq!(outcomes, vec![Ok(RxOutcome::Complete), Ok(RxOutcome::Complete)]);
    assert_eq!(read_file(&dst_a, "MAP.PNG").unwrap(), data);
    assert_eq!(read_file(&dst_b, "MAP.PNG").unwrap(), data);
}

/// A receiver that already holds most of a file fetches only what its
/// tree marks incomplete.
#[test]
fn test_receiver_repairs_damaged_copy() {
    let src = TempStorage::new("src");
    let dst = TempStorage::new("dst");
    let data = content(8 * 384, 3);
    write_file(&src, "LOG.TXT", &data).unwrap();
    write_file(&dst, "LOG.TXT", &data).unwrap();

    // Build the receiver's tree from good data, then damage two chunks.
    {
        let mut f = dst.open("LOG.TXT").unwrap();
        MerkleStore::open_local(&*dst, "LOG.mkl", &mut f, FaultPolicy::Strict).unwrap();
    }
    corrupt(&dst, "LOG.TXT", 2 * 384 + 10, 20).unwrap();
    corrupt(&dst, "LOG.TXT", 6 * 384, 384).unwrap();

    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut rx_radio = ether.station();
    let tx_ctx = Context::new();

    let outcome = std::thread::scope(|s| {
        {
            let ctx = tx_ctx.clone();
            let src = &*src;
            let radio = &mut tx_radio;
            s.spawn(move || transmit_until_cancelled(radio, src, "LOG.TXT", ctx, quick_config()));
        }
        let dst = &*dst;
        let radio = &mut rx_radio;
        let tx_ctx = tx_ctx.clone();
        s.spawn(move || {
            let mut session =
                Session::with_file(radio, dst, "LOG.TXT", Context::new(), quick_config()).unwrap();
            let mut f = dst.open("LOG.TXT").unwrap();
            let tree = session.tree_mut().unwrap();
            tree.check(&mut f).unwrap();
            assert!(!tree.chunk_complete(2).unwrap());
            assert!(!tree.chunk_complete(6).unwrap());
            assert!(tree.chunk_complete(3).unwrap());

            let outcome = Receiver::new(session).listen();
            tx_ctx.cancel();
            outcome
        })
        .join()
        .unwrap()
    });

    assert_eq!(outcome, Ok(RxOutcome::Complete));
    assert_eq!(read_file(&dst, "LOG.TXT").unwrap(), data);
}

/// A receiver bound to one file ignores a broadcast of another.
#[test]
fn test_bound_receiver_ignores_other_file() {
    let src = TempStorage::new("src");
    let dst = TempStorage::new("dst");
    write_file(&src, "OTHER.BIN", &content(2_000, 4)).unwrap();
    write_file(&dst, "MINE.BIN", &content(2_000, 5)).unwrap();

    // Leave the bound copy incomplete so the receiver keeps listening.
    {
        let mut f = dst.open("MINE.BIN").unwrap();
        MerkleStore::open_local(&*dst, "MINE.mkl", &mut f, FaultPolicy::Strict).unwrap();
    }
    corrupt(&dst, "MINE.BIN", 384 + 7, 16).unwrap();
    let damaged = read_file(&dst, "MINE.BIN").unwrap();

    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut rx_radio = ether.station();
    let tx_ctx = Context::new();

    let outcome = std::thread::scope(|s| {
        {
            let ctx = tx_ctx.clone();
            let src = &*src;
            let radio = &mut tx_radio;
            s.spawn(move || transmit_until_cancelled(radio, src, "OTHER.BIN", ctx, quick_config()));
        }
        let dst = &*dst;
        let radio = &mut rx_radio;
        let tx_ctx = tx_ctx.clone();
        s.spawn(move || {
            let mut session = Session::with_file(
                radio,
                dst,
                "MINE.BIN",
                Context::new(),
                SessionConfig {
                    rx_timeout_ms: 1_500,
                    ..quick_config()
                },
            )
            .unwrap();
            let mut f = dst.open("MINE.BIN").unwrap();
            let tree = session.tree_mut().unwrap();
            tree.check(&mut f).unwrap();
            assert!(!tree.chunk_complete(1).unwrap());
            let root = tree.root_hash();

            let mut rx = Receiver::new(session);
            // Chains for the other file keep arriving, so stop on a deadline.
            let stopper = rx.session().context().clone();
            let timer = std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(4));
                stopper.cancel();
            });
            let outcome = rx.listen();
            tx_ctx.cancel();
            timer.join().unwrap();

            let mut session = rx.into_session();
            let tree = session.tree_mut().unwrap();
            assert_eq!(tree.root_hash(), root);
            assert!(!tree.chunk_complete(1).unwrap());
            assert!(tree.chunk_complete(0).unwrap());
            outcome
        })
        .join()
        .unwrap()
    });

    assert!(
        matches!(outcome, Err(SessionError::Cancelled) | Err(SessionError::Timeout)),
        "unexpected outcome {outcome:?}"
    );
    assert_eq!(read_file(&dst, "MINE.BIN").unwrap(), damaged);
    assert!(!dst.exists("OTHER.BIN"));
    assert!(!dst.exists("OTHER.mkl"));
}
