//! Discrete-time simulation of MAAP stations on one broadcast bus.
//!
//! All stations share a virtual clock. Frames a station queues are
//! broadcast loss-free to every other station; delivery cascades (a
//! DEFEND provoked by a PROBE, the displaced station's next PROBE, and
//! so on) are run to quiescence before time moves again.

use maap::{Clock, Duration, MacAddr, Timestamp};

use crate::station::{SharedClock, Station};

/// Delivery rounds allowed per settle pass. Conflict resolution always
/// converges well below this; hitting the cap means a broadcast storm.
const MAX_DELIVERY_ROUNDS: usize = 100;

/// A bus full of MAAP stations under a shared virtual clock.
#[derive(Default)]
pub struct Simulator {
    stations: Vec<Station>,
    clock: SharedClock,
}

impl Simulator {
    /// Create an empty simulation at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Add a station. Returns its index.
    pub fn add_station(&mut self, mac: MacAddr, seed: u64) -> usize {
        self.stations
            .push(Station::new(mac, seed, self.clock.clone()));
        self.stations.len() - 1
    }

    /// Shared access to a station.
    pub fn station(&self, idx: usize) -> &Station {
        &self.stations[idx]
    }

    /// Mutable access to a station (for issuing commands).
    pub fn station_mut(&mut self, idx: usize) -> &mut Station {
        &mut self.stations[idx]
    }

    /// Deliver a frame from outside the simulation to every station.
    pub fn inject_frame(&mut self, frame: &[u8]) {
        for s in &mut self.stations {
            let _ = s.client.handle_packet(frame);
        }
        self.settle();
    }

    /// Advance virtual time, firing every timer that falls due and
    /// delivering all resulting traffic in order.
    pub fn advance(&mut self, d: Duration) {
        // Commands issued since the last advance may have queued frames.
        self.settle();

        let target = self.now() + d;
        loop {
            let Some(delay) = self
                .stations
                .iter()
                .map(|s| s.client.delay_to_next_timer())
                .min()
            else {
                break;
            };
            let due = self.now() + delay;
            if due > target {
                break;
            }
            self.clock.set(due);
            for s in &mut self.stations {
                s.client.handle_timer();
            }
            self.settle();
        }
        self.clock.set(target);
    }

    /// Validate every station's internal invariants.
    pub fn assert_consistent(&self) {
        for s in &self.stations {
            s.client.assert_consistent();
        }
    }

    /// Broadcast queued frames until no station has anything left to
    /// send.
    fn settle(&mut self) {
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let mut batches: Vec<(MacAddr, Vec<Vec<u8>>)> = Vec::new();
            for s in &mut self.stations {
                let frames = s.take_frames();
                if !frames.is_empty() {
                    batches.push((s.mac, frames));
                }
            }
            if batches.is_empty() {
                return;
            }
            for (origin, frames) in batches {
                for frame in frames {
                    for s in &mut self.stations {
                        if s.mac != origin {
                            let _ = s.client.handle_packet(&frame);
                        }
                    }
                }
            }
        }
        panic!("frame delivery did not settle; broadcast storm");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maap::{
        MaapPdu, MessageType, NotifyError, NotifyKind, SenderId, MAAP_DEST_MAC,
        MAAP_DYNAMIC_POOL_BASE, MAAP_DYNAMIC_POOL_LEN,
    };

    const POOL_BASE: u64 = MAAP_DYNAMIC_POOL_BASE;
    const POOL_LEN: u32 = MAAP_DYNAMIC_POOL_LEN;
    const HOST: SenderId = 1;

    fn mac(tail: u8) -> MacAddr {
        [0x02, 0, 0, 0, 0, tail]
    }

    fn add_initialized(sim: &mut Simulator, tail: u8, seed: u64) -> usize {
        let idx = sim.add_station(mac(tail), seed);
        sim.station_mut(idx)
            .client
            .init(HOST, POOL_BASE, POOL_LEN)
            .unwrap();
        sim.station_mut(idx).drain_notifications();
        idx
    }

    fn acquired_blocks(station: &mut Station) -> Vec<(u64, u32)> {
        station
            .drain_notifications()
            .into_iter()
            .filter(|n| n.kind == NotifyKind::Acquired && n.result == NotifyError::None)
            .map(|n| (n.start, n.count))
            .collect()
    }

    fn blocks_disjoint(a: (u64, u32), b: (u64, u32)) -> bool {
        a.0 + a.1 as u64 <= b.0 || b.0 + b.1 as u64 <= a.0
    }

    #[test]
    fn test_lone_station_acquires_and_announces() {
        let mut sim = Simulator::new();
        let a = add_initialized(&mut sim, 1, 11);
        let id = sim.station_mut(a).client.reserve(HOST, 0, 8).unwrap();

        sim.advance(Duration::from_secs(3));
        assert!(sim.station(a).client.is_defending(id));
        assert_eq!(acquired_blocks(sim.station_mut(a)).len(), 1);

        // Announces keep flowing while defending.
        sim.advance(Duration::from_secs(70));
        assert!(sim.station(a).client.metrics().announces_sent >= 2);
        sim.assert_consistent();
    }

    #[test]
    fn test_probe_collision_lower_mac_keeps_the_block() {
        let mut sim = Simulator::new();
        let a = add_initialized(&mut sim, 1, 21);
        let b = add_initialized(&mut sim, 2, 22);

        // Both stations want the same block at the same instant.
        let id_a = sim
            .station_mut(a)
            .client
            .reserve(HOST, POOL_BASE, 8)
            .unwrap();
        let id_b = sim
            .station_mut(b)
            .client
            .reserve(HOST, POOL_BASE, 8)
            .unwrap();

        sim.advance(Duration::from_secs(5));

        // Exactly one station ends up defending the contested block.
        assert!(sim.station(a).client.is_defending(id_a));
        assert!(sim.station(b).client.is_defending(id_b));
        let range_a = sim.station(a).client.reservation_range(id_a).unwrap();
        let range_b = sim.station(b).client.reservation_range(id_b).unwrap();
        assert_eq!(range_a, (POOL_BASE, 8), "lower MAC keeps the block");
        assert_ne!(range_b.0, POOL_BASE, "higher MAC was displaced");
        assert!(blocks_disjoint(range_a, range_b));

        assert_eq!(acquired_blocks(sim.station_mut(a)).len(), 1);
        assert_eq!(acquired_blocks(sim.station_mut(b)).len(), 1);
        sim.assert_consistent();
    }

    #[test]
    fn test_defender_repels_late_prober() {
        let mut sim = Simulator::new();
        // The defender's MAC is higher; a DEFEND still wins against a
        // probe because probers always back off when told.
        let a = add_initialized(&mut sim, 9, 31);
        let id_a = sim
            .station_mut(a)
            .client
            .reserve(HOST, POOL_BASE, 8)
            .unwrap();
        sim.advance(Duration::from_secs(3));
        assert!(sim.station(a).client.is_defending(id_a));

        let b = add_initialized(&mut sim, 1, 32);
        let id_b = sim
            .station_mut(b)
            .client
            .reserve(HOST, POOL_BASE, 8)
            .unwrap();
        sim.advance(Duration::from_secs(8));

        assert!(sim.station(a).client.metrics().defends_sent >= 1);
        assert_eq!(
            sim.station(a).client.reservation_range(id_a),
            Some((POOL_BASE, 8))
        );
        let range_b = sim.station(b).client.reservation_range(id_b).unwrap();
        assert_ne!(range_b.0, POOL_BASE);
        assert!(sim.station(b).client.is_defending(id_b));
        sim.assert_consistent();
    }

    #[test]
    fn test_defender_yields_to_injected_announce() {
        let mut sim = Simulator::new();
        let a = add_initialized(&mut sim, 5, 41);
        let id = sim
            .station_mut(a)
            .client
            .reserve(HOST, POOL_BASE, 8)
            .unwrap();
        sim.advance(Duration::from_secs(3));
        assert!(sim.station(a).client.is_defending(id));
        sim.station_mut(a).drain_notifications();

        // A station with a lower MAC announces over the held block.
        let announce = MaapPdu {
            dest: MAAP_DEST_MAC,
            source: mac(0),
            message_type: MessageType::Announce,
            stream_id: 0,
            requested_start: POOL_BASE,
            requested_count: 8,
            conflict_start: 0,
            conflict_count: 0,
        };
        sim.inject_frame(&announce.encode_to_vec());

        let notes = sim.station_mut(a).drain_notifications();
        assert_eq!(notes[0].kind, NotifyKind::Acquiring);
        assert_eq!(notes[0].id, Some(id));
        assert_eq!(notes[1].kind, NotifyKind::Yielded);
        assert_eq!(notes[1].start, POOL_BASE);
        assert_eq!(notes[1].result, NotifyError::None);

        // The replacement re-probes and acquires elsewhere.
        assert!(!sim.station(a).client.is_defending(id));
        sim.advance(Duration::from_secs(3));
        assert!(sim.station(a).client.is_defending(id));
        assert_ne!(
            sim.station(a).client.reservation_range(id).unwrap().0,
            POOL_BASE
        );
        sim.assert_consistent();
    }

    #[test]
    fn test_three_station_churn_converges_disjoint() {
        let mut sim = Simulator::new();
        let stations: Vec<usize> = (1..=3)
            .map(|tail| add_initialized(&mut sim, tail, tail as u64 * 7))
            .collect();
        let ids: Vec<_> = stations
            .iter()
            .map(|&idx| {
                sim.station_mut(idx)
                    .client
                    .reserve(HOST, POOL_BASE, 16)
                    .unwrap()
            })
            .collect();

        sim.advance(Duration::from_secs(120));

        let mut ranges = Vec::new();
        for (&idx, &id) in stations.iter().zip(&ids) {
            assert!(sim.station(idx).client.is_defending(id));
            ranges.push(sim.station(idx).client.reservation_range(id).unwrap());
            assert_eq!(acquired_blocks(sim.station_mut(idx)).len(), 1);
        }
        for i in 0..ranges.len() {
            for j in i + 1..ranges.len() {
                assert!(blocks_disjoint(ranges[i], ranges[j]));
            }
        }
        sim.assert_consistent();
    }

    #[test]
    fn test_debug_trace_of_clean_acquire() {
        use maap::debug::DebugEvent;

        let mut sim = Simulator::new();
        let a = add_initialized(&mut sim, 1, 51);
        sim.station_mut(a).client.reserve(HOST, 0, 8).unwrap();
        sim.advance(Duration::from_secs(3));

        let events = sim.station_mut(a).client.take_debug_events();
        let probes = events
            .iter()
            .filter(|e| matches!(e, DebugEvent::ProbeSent { .. }))
            .count();
        let announces = events
            .iter()
            .filter(|e| matches!(e, DebugEvent::AnnounceSent { .. }))
            .count();
        assert_eq!(probes, 4);
        assert!(announces >= 1);
    }
}
