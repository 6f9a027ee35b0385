use crate::*;

use std::time::{Duration, Instant};

use treecast_services::loopback::Ether;
use treecast_services::{Receiver, TxOutcome};

/// Carrier on more than three samples before the pass: nothing is sent.
#[test]
fn test_busy_channel_aborts_transmitter() {
    let storage = TempStorage::new("busy");
    write_file(&storage, "BUSY.BIN", &content(5_000, 6)).unwrap();

    let ether = Ether::new();
    let mut radio = ether.station();
    ether.jam(0, 4);

    let session =
        Session::with_file(&mut radio, &*storage, "BUSY.BIN", Context::new(), quick_config())
            .unwrap();
    let mut tx = Transmitter::new(session).unwrap();
    assert_eq!(
        tx.broadcast(),
        Err(SessionError::Interference { carriers: 4 })
    );
    drop(tx);
    assert_eq!(radio.transmitted(), 0);
    assert_eq!(ether.traffic(0), 0);
}

/// Jamming only a neighbouring channel does not disturb this one.
#[test]
fn test_jam_on_other_channel_is_ignored() {
    let storage = TempStorage::new("quiet");
    write_file(&storage, "QUIET.BIN", &content(700, 7)).unwrap();

    let ether = Ether::new();
    let mut radio = ether.station();
    radio.set_channel(3);
    ether.jam(4, 50);

    let config = SessionConfig {
        idle_rounds: 0,
        ..quick_config()
    };
    let session =
        Session::with_file(&mut radio, &*storage, "QUIET.BIN", Context::new(), config).unwrap();
    let mut tx = Transmitter::new(session).unwrap();
    assert_eq!(tx.broadcast(), Ok(TxOutcome::Finished));
    drop(tx);
    assert!(ether.traffic(3) > 0);
    assert_eq!(ether.traffic(4), 0);
}

/// A receiver tuned elsewhere hears nothing and times out.
#[test]
fn test_receiver_on_other_channel_times_out() {
    let src = TempStorage::new("src");
    let dst = TempStorage::new("dst");
    write_file(&src, "FAR.BIN", &content(1_000, 8)).unwrap();

    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut rx_radio = ether.station();
    rx_radio.set_channel(9);
    let tx_ctx = Context::new();

    let outcome = std::thread::scope(|s| {
        {
            let ctx = tx_ctx.clone();
            let src = &*src;
            let radio = &mut tx_radio;
            s.spawn(move || transmit_until_cancelled(radio, src, "FAR.BIN", ctx, quick_config()));
        }
        let session = Session::new(
            &mut rx_radio,
            &*dst,
            Context::new(),
            SessionConfig {
                rx_timeout_ms: 2_500,
                ..quick_config()
            },
        );
        let outcome = Receiver::new(session).listen();
        tx_ctx.cancel();
        outcome
    });

    assert_eq!(outcome, Err(SessionError::Timeout));
    assert!(dst.names().unwrap().is_empty());
}

/// Cancelling the context stops a transmitter mid-pass promptly.
#[test]
fn test_cancel_stops_transmitter() {
    let storage = TempStorage::new("cancel");
    write_file(&storage, "BIG.BIN", &content(100 * 384, 11)).unwrap();

    let ether = Ether::new();
    let mut radio = ether.station();
    let ctx = Context::new();

    let canceller = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1_500));
            ctx.cancel();
        })
    };
    let started = Instant::now();
    let result = transmit_until_cancelled(&mut radio, &storage, "BIG.BIN", ctx, quick_config());
    canceller.join().unwrap();

    assert_eq!(result, Ok(0));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(radio.transmitted() > 0);
}
