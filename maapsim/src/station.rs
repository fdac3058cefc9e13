//! A simulated station: one MAAP client wired to bus collaborators.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use maap::{Clock, MaapClient, MacAddr, Network, Notification, Random, Timestamp};

/// Network collaborator that queues frames for the simulator to
/// collect and broadcast.
#[derive(Default)]
pub struct BusNetwork {
    queued: Vec<Vec<u8>>,
}

impl BusNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every frame queued since the last collection.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.queued)
    }
}

impl Network for BusNetwork {
    type Error = Infallible;

    fn tx(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        self.queued.push(frame.to_vec());
        Ok(())
    }
}

/// Virtual clock shared by every station and the simulator.
#[derive(Clone, Default)]
pub struct SharedClock {
    now_ns: Arc<AtomicU64>,
}

impl SharedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the shared time forward (or to an absolute point).
    pub fn set(&self, t: Timestamp) {
        self.now_ns.store(t.as_nanos(), Ordering::Relaxed);
    }
}

impl Clock for SharedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.now_ns.load(Ordering::Relaxed))
    }
}

/// Deterministic per-station random generator (LCG).
pub struct SimRandom {
    state: u64,
}

impl SimRandom {
    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let range = max - min;
        if range == 0 {
            return min;
        }
        min + (self.state % range)
    }
}

/// One station on the simulated bus.
pub struct Station {
    pub mac: MacAddr,
    pub client: MaapClient<BusNetwork, SimRandom, SharedClock>,
}

impl Station {
    pub fn new(mac: MacAddr, seed: u64, clock: SharedClock) -> Self {
        Self {
            mac,
            client: MaapClient::new(BusNetwork::new(), SimRandom::with_seed(seed), clock, mac),
        }
    }

    /// Drain all undelivered notifications.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Some(n) = self.client.pop_notification() {
            out.push(n);
        }
        out
    }

    /// Take the frames this station queued for transmission.
    pub(crate) fn take_frames(&mut self) -> Vec<Vec<u8>> {
        self.client.network_mut().take_frames()
    }
}
