//! Packet-driven conflict resolution and timer handling.
//!
//! This module holds the negotiation half of [`MaapClient`]:
//! - `handle_packet` dispatches incoming PROBE/DEFEND/ANNOUNCE PDUs to
//!   every local reservation they overlap
//! - `handle_timer` drains due probe and announce deadlines
//! - the PDU send paths for all three message types
//!
//! Arbitration is by 6-byte lexicographic MAC comparison: the
//! numerically lower station wins a conflict.

use alloc::vec::Vec;

use crate::client::{MaapClient, Pool, Reservation, State};
use crate::time::Duration;
use crate::traits::{Clock, Network, Random};
use crate::types::{
    Error, MacAddr, NotifyError, NotifyKind, ReservationId, ANNOUNCE_INTERVAL_BASE_MS,
    ANNOUNCE_INTERVAL_VARIATION_MS, PROBE_INTERVAL_BASE_MS, PROBE_INTERVAL_VARIATION_MS,
    PROBE_RETRANSMITS,
};
use crate::wire::{MaapPdu, MessageType};

/// Whether the local station wins a conflict against `remote`.
///
/// Lower MAC wins. A tie is treated as a local win; ties are impossible
/// between distinct, correctly configured stations.
pub(crate) fn local_mac_wins(local: &MacAddr, remote: &MacAddr) -> bool {
    local <= remote
}

impl<N, R, C> MaapClient<N, R, C>
where
    N: Network,
    R: Random,
    C: Clock,
{
    /// Process a received frame.
    ///
    /// Frames that are not well-formed MAAP PDUs are discarded and
    /// reported as [`Error::InvalidPacket`]; PDUs whose range is
    /// disjoint from the pool (or that arrive before `init`) are
    /// silently ignored.
    pub fn handle_packet(&mut self, frame: &[u8]) -> Result<(), Error> {
        let pdu = match MaapPdu::decode_from_slice(frame) {
            Ok(pdu) => pdu,
            Err(_) => {
                self.metrics.packets_discarded += 1;
                #[cfg(feature = "debug")]
                self.emit_debug(crate::debug::DebugEvent::FrameDiscarded {
                    len: frame.len(),
                });
                return Err(Error::InvalidPacket);
            }
        };

        let Some(pool) = self.pool else {
            self.metrics.packets_discarded += 1;
            return Ok(());
        };
        self.metrics.packets_received += 1;

        let incoming_lo = pdu.requested_start;
        let incoming_hi = pdu.requested_start + (pdu.requested_count as u64 - 1);
        if incoming_hi < pool.base || pool.last() < incoming_lo {
            return Ok(());
        }

        // Clamp the incoming range to the pool window before searching.
        let lo = (incoming_lo.max(pool.base) - pool.base) as u16;
        let hi = (incoming_hi.min(pool.last()) - pool.base) as u16;

        // Collect the overlapped owners up front: resolving a conflict
        // mutates the interval set, but never moves or removes another
        // overlapped reservation's interval.
        let overlapped: Vec<ReservationId> = self
            .intervals
            .overlapping(lo, hi)
            .map(|(_, iv)| iv.owner)
            .collect();
        for id in overlapped {
            self.resolve_conflict(pool, id, &pdu);
        }

        Ok(())
    }

    /// Apply the conflict rules to one overlapped reservation.
    fn resolve_conflict(&mut self, pool: Pool, id: ReservationId, pdu: &MaapPdu) {
        let Some(&Reservation {
            sender,
            state,
            interval_low: old_low,
            ..
        }) = self.reservations.get(&id)
        else {
            return;
        };
        let Some(old) = self.intervals.get(old_low).copied() else {
            debug_assert!(false, "reservation without a live interval");
            return;
        };
        let size = old.high - old_low + 1;
        self.metrics.conflicts += 1;

        match state {
            State::Probing => {
                if pdu.message_type == MessageType::Probe
                    && local_mac_wins(&self.src_mac, &pdu.source)
                {
                    // Lower MAC keeps probing; the peer must move.
                    #[cfg(feature = "debug")]
                    self.emit_debug(crate::debug::DebugEvent::ConflictIgnored { id });
                    return;
                }

                // Move to a fresh block and restart the probe count. The
                // old interval stays in the set while the replacement is
                // chosen, so the new block cannot land on it.
                match self.assign_interval(pool, id, 0, size) {
                    Some(new_low) => {
                        if let Some(r) = self.reservations.get_mut(&id) {
                            r.interval_low = new_low;
                            r.probes_left = PROBE_RETRANSMITS;
                        }
                        self.push_notify(
                            sender,
                            NotifyKind::Acquiring,
                            Some(id),
                            pool.base + new_low as u64,
                            size as u32,
                            NotifyError::None,
                        );
                        self.intervals.remove(old_low);
                        self.schedule_timer(id);
                        self.send_probe(id);
                    }
                    None => {
                        self.push_notify(
                            sender,
                            NotifyKind::Acquired,
                            Some(id),
                            0,
                            size as u32,
                            NotifyError::ReserveNotAvailable,
                        );
                        self.intervals.remove(old_low);
                        self.timers.cancel(id);
                        self.reservations.remove(&id);
                    }
                }
            }

            State::Defending => {
                if pdu.message_type == MessageType::Probe {
                    // A prober always backs off when told; no arbitration.
                    self.send_defend(
                        pool,
                        old_low,
                        old.high,
                        pdu.requested_start,
                        pdu.requested_count,
                        pdu.source,
                    );
                    return;
                }
                if local_mac_wins(&self.src_mac, &pdu.source) {
                    #[cfg(feature = "debug")]
                    self.emit_debug(crate::debug::DebugEvent::ConflictIgnored { id });
                    return;
                }

                // We lose the block. Start a replacement reservation for
                // the same owner under the same id, then drop the old
                // one. The old interval is still in the set while the
                // replacement is placed, so the two cannot overlap.
                self.metrics.yields += 1;
                let old_start = pool.base + old_low as u64;
                match self.assign_interval(pool, id, 0, size) {
                    Some(new_low) => {
                        self.push_notify(
                            sender,
                            NotifyKind::Acquiring,
                            Some(id),
                            pool.base + new_low as u64,
                            size as u32,
                            NotifyError::None,
                        );
                        if let Some(r) = self.reservations.get_mut(&id) {
                            r.state = State::Probing;
                            r.probes_left = PROBE_RETRANSMITS;
                            r.interval_low = new_low;
                        }
                        self.schedule_timer(id);
                        self.send_probe(id);
                        self.push_notify(
                            sender,
                            NotifyKind::Yielded,
                            Some(id),
                            old_start,
                            size as u32,
                            NotifyError::None,
                        );
                        self.intervals.remove(old_low);
                    }
                    None => {
                        self.push_notify(
                            sender,
                            NotifyKind::Yielded,
                            Some(id),
                            old_start,
                            size as u32,
                            NotifyError::ReserveNotAvailable,
                        );
                        self.intervals.remove(old_low);
                        self.timers.cancel(id);
                        self.reservations.remove(&id);
                    }
                }
            }
        }
    }

    /// Drain every due timer, in deadline order.
    pub fn handle_timer(&mut self) {
        let now = self.clock.now();
        while let Some((_, id)) = self.timers.pop_due(now) {
            let Some(r) = self.reservations.get(&id) else {
                continue;
            };
            match r.state {
                State::Probing => self.handle_probe_timer(id),
                State::Defending => self.handle_defend_timer(id),
            }
        }
    }

    /// Probe deadline fired: retransmit, or declare the block acquired.
    fn handle_probe_timer(&mut self, id: ReservationId) {
        let Some(pool) = self.pool else { return };
        let (sender, probes_left) = match self.reservations.get(&id) {
            Some(r) => (r.sender, r.probes_left),
            None => return,
        };

        if probes_left == 0 {
            let (start, count) = self
                .reservations
                .get(&id)
                .and_then(|r| self.block_of(pool, r))
                .unwrap_or((0, 0));
            self.push_notify(
                sender,
                NotifyKind::Acquired,
                Some(id),
                start,
                count,
                NotifyError::None,
            );
            if let Some(r) = self.reservations.get_mut(&id) {
                r.state = State::Defending;
            }
            self.schedule_timer(id);
            self.send_announce(id);
        } else {
            if let Some(r) = self.reservations.get_mut(&id) {
                r.probes_left = probes_left - 1;
            }
            self.schedule_timer(id);
            self.send_probe(id);
        }
    }

    /// Announce deadline fired: re-announce and rearm.
    fn handle_defend_timer(&mut self, id: ReservationId) {
        self.schedule_timer(id);
        self.send_announce(id);
    }

    /// Arm the reservation's next deadline from its current state.
    pub(crate) fn schedule_timer(&mut self, id: ReservationId) {
        let state = match self.reservations.get(&id) {
            Some(r) => r.state,
            None => return,
        };
        let delay = match state {
            State::Probing => self.probe_delay(),
            State::Defending => self.announce_delay(),
        };
        let deadline = self.clock.now() + delay;
        self.timers.schedule(id, deadline);
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::TimerScheduled { id, deadline });
    }

    // The random component is [1, variation-1] inclusive, per IEEE
    // 1722-2016 B.3.4.1/B.3.4.2.
    fn probe_delay(&mut self) -> Duration {
        Duration::from_millis(
            PROBE_INTERVAL_BASE_MS + self.random.gen_range(1, PROBE_INTERVAL_VARIATION_MS),
        )
    }

    fn announce_delay(&mut self) -> Duration {
        Duration::from_millis(
            ANNOUNCE_INTERVAL_BASE_MS + self.random.gen_range(1, ANNOUNCE_INTERVAL_VARIATION_MS),
        )
    }

    pub(crate) fn send_probe(&mut self, id: ReservationId) {
        let Some(pool) = self.pool else { return };
        let Some((start, count)) = self
            .reservations
            .get(&id)
            .and_then(|r| self.block_of(pool, r))
        else {
            return;
        };
        self.metrics.probes_sent += 1;
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::ProbeSent { id, start, count });
        self.transmit(&MaapPdu {
            dest: self.dest_mac,
            source: self.src_mac,
            message_type: MessageType::Probe,
            stream_id: 0,
            requested_start: start,
            requested_count: count as u16,
            conflict_start: 0,
            conflict_count: 0,
        });
    }

    fn send_announce(&mut self, id: ReservationId) {
        let Some(pool) = self.pool else { return };
        let Some((start, count)) = self
            .reservations
            .get(&id)
            .and_then(|r| self.block_of(pool, r))
        else {
            return;
        };
        self.metrics.announces_sent += 1;
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::AnnounceSent { id, start, count });
        self.transmit(&MaapPdu {
            dest: self.dest_mac,
            source: self.src_mac,
            message_type: MessageType::Announce,
            stream_id: 0,
            requested_start: start,
            requested_count: count as u16,
            conflict_start: 0,
            conflict_count: 0,
        });
    }

    /// Answer a probe with the intersection of the probed range and the
    /// held block, addressed to the prober's unicast MAC.
    fn send_defend(
        &mut self,
        pool: Pool,
        low: u16,
        high: u16,
        requested_start: u64,
        requested_count: u16,
        offender: MacAddr,
    ) {
        let held_start = pool.base + low as u64;
        let held_end = pool.base + high as u64;
        let requested_end = requested_start + (requested_count as u64 - 1);
        let conflict_start = held_start.max(requested_start);
        let conflict_end = held_end.min(requested_end);

        self.metrics.defends_sent += 1;
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::DefendSent {
            conflict_start,
            conflict_count: (conflict_end - conflict_start + 1) as u16,
        });
        self.transmit(&MaapPdu {
            dest: offender,
            source: self.src_mac,
            message_type: MessageType::Defend,
            stream_id: 0,
            requested_start,
            requested_count,
            conflict_start,
            conflict_count: (conflict_end - conflict_start + 1) as u16,
        });
    }

    fn transmit(&mut self, pdu: &MaapPdu) {
        let frame = pdu.encode_to_vec();
        if self.network.tx(&frame).is_err() {
            // Transmit failures do not feed back into the state machine.
            self.metrics.tx_failed += 1;
        }
    }
}


#[cfg(test)]
mod randomized {
    //! Randomized workload: the cross-container invariants must hold
    //! after every operation, whatever the interleaving.

    use super::*;
    use crate::traits::test_impls::{MockClock, MockNetwork, MockRandom};
    use crate::types::MAAP_DYNAMIC_POOL_BASE;
    use proptest::prelude::*;

    const POOL_BASE: u64 = MAAP_DYNAMIC_POOL_BASE;
    const POOL_LEN: u32 = 0x200;

    #[derive(Clone, Debug)]
    enum Op {
        Reserve { preferred_off: u64, len: u32 },
        Release { id: ReservationId },
        Status { id: ReservationId },
        Tick { ms: u64 },
        Packet { mtype: u8, mac_tail: u8, off: u64, count: u16 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..0x240, 1u32..48).prop_map(|(preferred_off, len)| Op::Reserve {
                preferred_off,
                len
            }),
            (1u32..40).prop_map(|id| Op::Release { id }),
            (1u32..40).prop_map(|id| Op::Status { id }),
            (1u64..40_000).prop_map(|ms| Op::Tick { ms }),
            (1u8..=3, any::<u8>(), 0u64..0x240, 1u16..64).prop_map(
                |(mtype, mac_tail, off, count)| Op::Packet {
                    mtype,
                    mac_tail,
                    off,
                    count
                }
            ),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn invariants_hold_across_random_workloads(
            ops in proptest::collection::vec(op_strategy(), 1..120),
            seed in any::<u64>(),
        ) {
            let mut c = MaapClient::new(
                MockNetwork::new(),
                MockRandom::with_seed(seed),
                MockClock::new(),
                [0x02, 0, 0, 0, 0, 0x80],
            );
            c.init(1, POOL_BASE, POOL_LEN).unwrap();

            for op in ops {
                match op {
                    Op::Reserve { preferred_off, len } => {
                        let _ = c.reserve(1, POOL_BASE + preferred_off, len);
                    }
                    Op::Release { id } => {
                        let _ = c.release(1, id);
                    }
                    Op::Status { id } => {
                        let _ = c.status(1, id);
                    }
                    Op::Tick { ms } => {
                        c.clock().advance(Duration::from_millis(ms));
                        c.handle_timer();
                    }
                    Op::Packet { mtype, mac_tail, off, count } => {
                        let pdu = MaapPdu {
                            dest: crate::types::MAAP_DEST_MAC,
                            source: [0x02, 0, 0, 0, 0, mac_tail],
                            message_type: MessageType::from_u8(mtype).unwrap(),
                            stream_id: 0,
                            requested_start: POOL_BASE + off,
                            requested_count: count,
                            conflict_start: 0,
                            conflict_count: 0,
                        };
                        let _ = c.handle_packet(&pdu.encode_to_vec());
                    }
                }
                c.assert_consistent();
                while c.pop_notification().is_some() {}
            }
        }
    }
}
