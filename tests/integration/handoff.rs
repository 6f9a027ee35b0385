use crate::*;

use treecast_services::loopback::Ether;
use treecast_services::{Receiver, RxOutcome, YieldState};

const STATION_B: u16 = 77;

/// A transmits a file it is missing one chunk of. B holds the whole file,
/// asks for the channel, is granted it, and sends the chunk back to A.
#[test]
fn test_yield_handoff_fills_transmitter_gap() {
    let a = TempStorage::new("a");
    let b = TempStorage::new("b");
    let data = content(8 * 384, 9);
    write_file(&a, "SHARED.DAT", &data).unwrap();
    write_file(&b, "SHARED.DAT", &data).unwrap();

    let ether = Ether::new();
    let mut radio_a = ether.station();
    let mut radio_b = ether.station();

    let ((a_tx, a_rx), (b_rx, b_tx)) = std::thread::scope(|s| {
        let station_a = {
            let a = &*a;
            let radio = &mut radio_a;
            s.spawn(move || {
                let mut session =
                    Session::with_file(radio, a, "SHARED.DAT", Context::new(), quick_config())
                        .unwrap();
                corrupt(a, "SHARED.DAT", 5 * 384 + 100, 8).unwrap();
                let mut f = a.open("SHARED.DAT").unwrap();
                session.tree_mut().unwrap().check(&mut f).unwrap();

                let mut tx = Transmitter::new(session).unwrap();
                assert_eq!(tx.session().missing().iter().collect::<Vec<_>>(), vec![5]);
                let tx_outcome = tx.broadcast();
                assert!(tx.heard_request());

                let mut rx = Receiver::new(tx.into_session());
                let rx_outcome = rx.listen();
                (tx_outcome, rx_outcome)
            })
        };
        let station_b = {
            let b = &*b;
            let radio = &mut radio_b;
            s.spawn(move || {
                let config = SessionConfig {
                    station_id: Some(STATION_B),
                    ..quick_config()
                };
                let session =
                    Session::with_file(radio, b, "SHARED.DAT", Context::new(), config).unwrap();
                let mut rx = Receiver::new(session);
                assert_eq!(rx.station_id(), STATION_B);
                let rx_outcome = rx.listen();
                assert_eq!(rx.yield_state(), YieldState::Granted);

                let mut tx = Transmitter::new(rx.into_session()).unwrap();
                let tx_outcome = tx.broadcast();
                (rx_outcome, tx_outcome)
            })
        };
        (station_a.join().unwrap(), station_b.join().unwrap())
    });

    assert_eq!(b_rx, Ok(RxOutcome::ChannelGranted));
    assert_eq!(a_tx, Ok(TxOutcome::Yielded));
    assert_eq!(a_rx, Ok(RxOutcome::Complete));
    assert_eq!(b_tx, Ok(TxOutcome::Finished));
    assert_eq!(read_file(&a, "SHARED.DAT").unwrap(), data);
}

/// A complete receiver that keeps asking for the channel without being
/// granted gives up once it has asked too often.
#[test]
fn test_receiver_gives_up_on_ignored_yield_requests() {
    let a = TempStorage::new("a");
    let b = TempStorage::new("b");
    let data = content(300, 10);
    write_file(&a, "NOTES.TXT", &data).unwrap();
    write_file(&b, "NOTES.TXT", &data).unwrap();

    let ether = Ether::new();
    let mut radio_a = ether.station();
    let mut radio_b = ether.station();
    let tx_ctx = Context::new();

    let outcome = std::thread::scope(|s| {
        // A is missing its only chunk. A one-chunk pass never gets far
        // enough for A to grant the channel.
        {
            let a = &*a;
            let radio = &mut radio_a;
            let ctx = tx_ctx.clone();
            s.spawn(move || {
                let mut session =
                    Session::with_file(radio, a, "NOTES.TXT", ctx, quick_config()).unwrap();
                corrupt(a, "NOTES.TXT", 0, 4).unwrap();
                let mut f = a.open("NOTES.TXT").unwrap();
                session.tree_mut().unwrap().check(&mut f).unwrap();
                let mut tx = Transmitter::new(session).unwrap();
                loop {
                    match tx.broadcast() {
                        Ok(TxOutcome::Finished) => continue,
                        other => return other,
                    }
                }
            });
        }
        let b = &*b;
        let radio = &mut radio_b;
        let tx_ctx = tx_ctx.clone();
        s.spawn(move || {
            let config = SessionConfig {
                max_yield_requests: 2,
                ..quick_config()
            };
            let session = Session::with_file(radio, b, "NOTES.TXT", Context::new(), config).unwrap();
            let outcome = Receiver::new(session).listen();
            tx_ctx.cancel();
            outcome
        })
        .join()
        .unwrap()
    });

    assert_eq!(outcome, Ok(RxOutcome::Complete));
}
