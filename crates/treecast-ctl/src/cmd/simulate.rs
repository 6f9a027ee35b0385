//! Loopback transfer between two storage directories.

use anyhow::{anyhow, Result};
use std::time::Instant;

use treecast_core::wire::Hash;
use treecast_core::TreecastConfig;
use treecast_services::loopback::Ether;
use treecast_services::{
    Context, DirStorage, Radio, Receiver, RxOutcome, Session, SessionError, Transmitter,
    TxOutcome,
};

pub fn cmd_simulate(
    src: &DirStorage,
    dest: &DirStorage,
    file: &str,
    config: &TreecastConfig,
) -> Result<()> {
    let ether = Ether::new();
    let mut tx_radio = ether.station();
    let mut rx_radio = ether.station();
    tx_radio.set_channel(config.radio.channel);
    rx_radio.set_channel(config.radio.channel);

    tracing::info!(
        file,
        src = %src.root().display(),
        dest = %dest.root().display(),
        channel = config.radio.channel,
        "starting loopback transfer"
    );

    // The receiver cancels the transmitter once it is done.
    let tx_ctx = Context::new();
    let started = Instant::now();

    let (tx_result, rx_result) = std::thread::scope(|s| {
        let tx_radio = &mut tx_radio;
        let rx_radio = &mut rx_radio;
        let tx_handle = {
            let ctx = tx_ctx.clone();
            s.spawn(move || -> Result<u32, SessionError> {
                let session = Session::with_file(tx_radio, src, file, ctx, config.session.clone())?;
                let mut tx = Transmitter::new(session)?;
                let mut passes = 0;
                loop {
                    match tx.broadcast() {
                        Ok(TxOutcome::Finished) => passes += 1,
                        Ok(TxOutcome::Yielded) | Err(SessionError::Cancelled) => return Ok(passes),
                        Err(e) => return Err(e),
                    }
                }
            })
        };
        let rx_handle = s.spawn(move || -> Result<(RxOutcome, Option<Hash>), SessionError> {
            let session = Session::new(rx_radio, dest, Context::new(), config.session.clone());
            let mut rx = Receiver::new(session);
            let outcome = rx.listen();
            tx_ctx.cancel();
            Ok((outcome?, rx.session().root_hash()))
        });
        (tx_handle.join(), rx_handle.join())
    });

    let passes = tx_result.map_err(|_| anyhow!("transmitter thread panicked"))??;
    let (outcome, root) = rx_result.map_err(|_| anyhow!("receiver thread panicked"))??;

    println!("═══════════════════════════════════════");
    println!("  Loopback transfer of {file}");
    println!("═══════════════════════════════════════");
    println!("  Receiver    : {outcome:?}");
    println!("  Passes      : {passes}");
    println!("  Packets     : {}", tx_radio.transmitted());
    println!("  Elapsed     : {:.1}s", started.elapsed().as_secs_f64());
    if let Some(root) = root {
        println!("  Root        : {}", hex::encode(root));
    }
    Ok(())
}
