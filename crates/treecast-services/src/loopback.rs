//! In-process radio medium.
//!
//! An `Ether` is a shared set of channels. Every `LoopbackRadio` created from
//! it is one station: packets it transmits reach every other station tuned
//! to the same channel that is listening at that moment. Used by tests and
//! by anything that wants to run several stations in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use treecast_core::wire::Packet;

use crate::radio::Radio;

/// Receive FIFO depth per station. Later packets are dropped.
const INBOX_DEPTH: usize = 4096;

#[derive(Default)]
struct Station {
    channel: u8,
    listening: bool,
    inbox: VecDeque<Packet>,
    transmitted: u64,
}

#[derive(Default)]
struct EtherState {
    stations: Vec<Station>,
    /// Packets put on the air per channel, counting repeats.
    traffic: HashMap<u8, u64>,
    /// Pending forced carrier detections per channel.
    jam: HashMap<u8, u32>,
}

/// The shared medium.
#[derive(Clone, Default)]
pub struct Ether {
    inner: Arc<(Mutex<EtherState>, Condvar)>,
}

impl Ether {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EtherState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a station, tuned to channel 0 and not listening.
    pub fn station(&self) -> LoopbackRadio {
        let mut state = self.state();
        state.stations.push(Station::default());
        LoopbackRadio {
            ether: self.clone(),
            id: state.stations.len() - 1,
        }
    }

    /// Make the next `samples` carrier checks on `channel` report a carrier.
    pub fn jam(&self, channel: u8, samples: u32) {
        *self.state().jam.entry(channel).or_default() += samples;
    }

    /// Packets put on the air on `channel` so far.
    pub fn traffic(&self, channel: u8) -> u64 {
        self.state().traffic.get(&channel).copied().unwrap_or(0)
    }
}

/// One station on an `Ether`.
pub struct LoopbackRadio {
    ether: Ether,
    id: usize,
}

impl LoopbackRadio {
    /// Packets this station has put on the air, counting repeats.
    pub fn transmitted(&self) -> u64 {
        self.ether.state().stations[self.id].transmitted
    }

    fn with_station<T>(&self, f: impl FnOnce(&mut Station) -> T) -> T {
        let mut state = self.ether.state();
        f(&mut state.stations[self.id])
    }
}

impl Radio for LoopbackRadio {
    fn channel(&self) -> u8 {
        self.with_station(|s| s.channel)
    }

    fn set_channel(&mut self, channel: u8) {
        self.with_station(|s| {
            s.channel = channel;
            s.inbox.clear();
        });
    }

    fn open_broadcast(&mut self) {}

    fn start_listening(&mut self) {
        self.with_station(|s| s.listening = true);
    }

    fn stop_listening(&mut self) {
        self.with_station(|s| s.listening = false);
    }

    fn transmit(&mut self, packet: &Packet, repeats: u8) {
        let mut state = self.ether.state();
        let channel = state.stations[self.id].channel;
        for (id, station) in state.stations.iter_mut().enumerate() {
            if id == self.id || station.channel != channel || !station.listening {
                continue;
            }
            for _ in 0..repeats {
                if station.inbox.len() < INBOX_DEPTH {
                    station.inbox.push_back(*packet);
                }
            }
        }
        state.stations[self.id].transmitted += u64::from(repeats);
        *state.traffic.entry(channel).or_default() += u64::from(repeats);
        drop(state);
        self.ether.inner.1.notify_all();
    }

    fn available(&mut self) -> bool {
        self.with_station(|s| !s.inbox.is_empty())
    }

    fn read(&mut self) -> Option<Packet> {
        self.with_station(|s| s.inbox.pop_front())
    }

    fn carrier_sense(&mut self, dwell: Duration) -> bool {
        let channel = self.channel();
        let before = self.ether.traffic(channel);
        std::thread::sleep(dwell);

        let mut state = self.ether.state();
        if let Some(left) = state.jam.get_mut(&channel) {
            if *left > 0 {
                *left -= 1;
                return true;
            }
        }
        state.traffic.get(&channel).copied().unwrap_or(0) != before
    }

    fn receive_until(&mut self, deadline: Instant) -> Option<Packet> {
        let (lock, cvar) = &*self.ether.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(packet) = state.stations[self.id].inbox.pop_front() {
                return Some(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match cvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}
