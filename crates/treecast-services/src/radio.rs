//! The packet radio a session drives.
//!
//! Half-duplex, fixed 32-byte packets, one shared broadcast address per
//! channel. A station hears nothing while it is not listening.

use std::time::{Duration, Instant};

use treecast_core::wire::Packet;

pub trait Radio {
    fn channel(&self) -> u8;
    fn set_channel(&mut self, channel: u8);

    /// Point reads and writes at the shared broadcast address.
    fn open_broadcast(&mut self);

    /// Switch to receive mode.
    fn start_listening(&mut self);
    /// Switch to transmit mode.
    fn stop_listening(&mut self);

    /// Put `packet` on the air `repeats` times. No acknowledgement.
    fn transmit(&mut self, packet: &Packet, repeats: u8);

    /// True if a received packet is waiting.
    fn available(&mut self) -> bool;
    fn read(&mut self) -> Option<Packet>;

    /// Listen for `dwell` and report whether a carrier was present.
    fn carrier_sense(&mut self, dwell: Duration) -> bool;

    /// Block until a packet arrives or `deadline` passes.
    fn receive_until(&mut self, deadline: Instant) -> Option<Packet> {
        loop {
            if let Some(packet) = self.read() {
                return Some(packet);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
