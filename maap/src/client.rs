//! The MAAP client: reservation state and the host command surface.
//!
//! A client owns one address pool and negotiates reservations inside it
//! against other stations on the same network. It is single-threaded and
//! never blocks: every entry point (`init`, `reserve`, `release`,
//! `status`, `handle_packet`, `handle_timer`) runs to completion, and
//! the host drives timing by arming a wake from
//! [`delay_to_next_timer`](MaapClient::delay_to_next_timer).
//!
//! Outcomes are reported through an in-order notification queue drained
//! with [`pop_notification`](MaapClient::pop_notification).

use alloc::collections::VecDeque;
use hashbrown::HashMap;

use crate::interval::IntervalSet;
use crate::time::Duration;
use crate::timer::TimerQueue;
use crate::traits::{Clock, Network, Random};
use crate::types::{
    EngineMetrics, Error, MacAddr, Notification, NotifyError, NotifyKind, ReservationId,
    SenderId, ASSIGN_ATTEMPTS, IDLE_WAIT, MAAP_DEST_MAC, MAX_POOL_LEN, PROBE_RETRANSMITS,
};

/// The contiguous address range a client allocates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pool {
    /// First address of the pool.
    pub base: u64,
    /// Number of addresses in the pool.
    pub len: u32,
}

impl Pool {
    /// Last address of the pool, inclusive.
    pub fn last(&self) -> u64 {
        self.base + self.len as u64 - 1
    }
}

/// Negotiation state of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Claim in flight; the block is not usable yet.
    Probing,
    /// Block held; announced periodically and defended against probes.
    Defending,
}

/// Per-reservation record. The interval is referenced by its low
/// offset; the pending deadline lives in the timer queue.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Reservation {
    pub sender: SenderId,
    pub state: State,
    /// Probe retransmissions left before the block counts as acquired.
    pub probes_left: u8,
    /// Low offset of this reservation's interval in the set.
    pub interval_low: u16,
}

/// A MAAP negotiation client.
///
/// Generic over:
/// - `N`: link-layer transmit implementation
/// - `R`: random number generator
/// - `C`: monotonic clock
pub struct MaapClient<N, R, C> {
    // Dependencies (injected)
    pub(crate) network: N,
    pub(crate) random: R,
    pub(crate) clock: C,

    // Identity
    pub(crate) src_mac: MacAddr,
    pub(crate) dest_mac: MacAddr,

    // Pool and reservation state
    pub(crate) pool: Option<Pool>,
    pub(crate) reservations: HashMap<ReservationId, Reservation>,
    pub(crate) intervals: IntervalSet,
    pub(crate) timers: TimerQueue,
    next_id: ReservationId,

    // Host-facing queues and counters
    notifications: VecDeque<Notification>,
    pub(crate) metrics: EngineMetrics,
    #[cfg(feature = "debug")]
    debug_events: VecDeque<crate::debug::DebugEvent>,
}

impl<N, R, C> MaapClient<N, R, C>
where
    N: Network,
    R: Random,
    C: Clock,
{
    /// Create a client bound to the station MAC `src_mac`.
    ///
    /// The client is unusable until [`init`](Self::init) sets the pool.
    pub fn new(network: N, random: R, clock: C, src_mac: MacAddr) -> Self {
        Self {
            network,
            random,
            clock,
            src_mac,
            dest_mac: MAAP_DEST_MAC,
            pool: None,
            reservations: HashMap::new(),
            intervals: IntervalSet::new(),
            timers: TimerQueue::new(),
            next_id: 0,
            notifications: VecDeque::new(),
            metrics: EngineMetrics::new(),
            #[cfg(feature = "debug")]
            debug_events: VecDeque::new(),
        }
    }

    /// Set the address pool `[base, base + len)`.
    ///
    /// Re-initializing with the identical pool succeeds again and does
    /// not perturb existing reservations; any other pool is rejected
    /// with `AlreadyInitialized`. Either way an `Initialized`
    /// notification reports the pool that is in effect.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or exceeds [`MAX_POOL_LEN`].
    pub fn init(&mut self, sender: SenderId, base: u64, len: u32) -> Result<(), Error> {
        assert!(len >= 1 && len <= MAX_POOL_LEN, "pool length out of range");

        if let Some(pool) = self.pool {
            let matches = pool.base == base && pool.len == len;
            let result = if matches {
                NotifyError::None
            } else {
                NotifyError::AlreadyInitialized
            };
            self.push_notify(sender, NotifyKind::Initialized, None, pool.base, pool.len, result);
            return if matches {
                Ok(())
            } else {
                Err(Error::AlreadyInitialized)
            };
        }

        self.pool = Some(Pool { base, len });
        self.push_notify(
            sender,
            NotifyKind::Initialized,
            None,
            base,
            len,
            NotifyError::None,
        );
        Ok(())
    }

    /// Reserve a block of `length` addresses.
    ///
    /// `preferred_base` is an absolute address tried first when the
    /// whole block fits inside the pool; pass any out-of-pool value
    /// (zero works for real MAAP pools) for no preference. On success a
    /// fresh reservation id is returned, an `Acquiring` notification is
    /// queued, and the first probe goes out. The block is only usable
    /// after the matching `Acquired` notification arrives.
    pub fn reserve(
        &mut self,
        sender: SenderId,
        preferred_base: u64,
        length: u32,
    ) -> Result<ReservationId, Error> {
        let Some(pool) = self.pool else {
            self.push_notify(
                sender,
                NotifyKind::Acquired,
                None,
                0,
                length,
                NotifyError::RequiresInitialization,
            );
            return Err(Error::RequiresInitialization);
        };

        // Block size is carried in a 16-bit packet field.
        if length == 0 || length > 0xFFFF || length > pool.len {
            self.push_notify(
                sender,
                NotifyKind::Acquired,
                None,
                0,
                length,
                NotifyError::ReserveNotAvailable,
            );
            return Err(Error::ReserveNotAvailable);
        }

        self.next_id += 1;
        let id = self.next_id;

        let Some(low) = self.assign_interval(pool, id, preferred_base, length as u16) else {
            self.push_notify(
                sender,
                NotifyKind::Acquired,
                None,
                0,
                length,
                NotifyError::ReserveNotAvailable,
            );
            return Err(Error::ReserveNotAvailable);
        };

        self.reservations.insert(
            id,
            Reservation {
                sender,
                state: State::Probing,
                probes_left: PROBE_RETRANSMITS,
                interval_low: low,
            },
        );

        self.push_notify(
            sender,
            NotifyKind::Acquiring,
            Some(id),
            pool.base + low as u64,
            length,
            NotifyError::None,
        );
        self.schedule_timer(id);
        self.send_probe(id);

        Ok(id)
    }

    /// Release a reservation.
    ///
    /// The interval is removed immediately and a `Released`
    /// notification is queued for the caller, and for the original
    /// owner when different.
    pub fn release(&mut self, sender: SenderId, id: ReservationId) -> Result<(), Error> {
        let Some(pool) = self.pool else {
            self.push_notify(
                sender,
                NotifyKind::Released,
                Some(id),
                0,
                0,
                NotifyError::RequiresInitialization,
            );
            return Err(Error::RequiresInitialization);
        };

        let Some(&reservation) = self.reservations.get(&id) else {
            self.push_notify(
                sender,
                NotifyKind::Released,
                Some(id),
                0,
                0,
                NotifyError::ReleaseInvalidId,
            );
            return Err(Error::ReleaseInvalidId);
        };

        let (start, count) = self
            .block_of(pool, &reservation)
            .unwrap_or((0, 0));
        self.push_notify(sender, NotifyKind::Released, Some(id), start, count, NotifyError::None);
        if sender != reservation.sender {
            // Also inform the client that originally reserved the block.
            self.push_notify(
                reservation.sender,
                NotifyKind::Released,
                Some(id),
                start,
                count,
                NotifyError::None,
            );
        }

        self.intervals.remove(reservation.interval_low);
        self.timers.cancel(id);
        self.reservations.remove(&id);

        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::ReservationDropped { id });

        Ok(())
    }

    /// Query a reservation.
    ///
    /// Queues a `Status` notification carrying the held block when the
    /// reservation is defending; probing or unknown ids report
    /// `ReleaseInvalidId`.
    pub fn status(&mut self, sender: SenderId, id: ReservationId) -> Result<(), Error> {
        let Some(pool) = self.pool else {
            self.push_notify(
                sender,
                NotifyKind::Status,
                Some(id),
                0,
                0,
                NotifyError::RequiresInitialization,
            );
            return Err(Error::RequiresInitialization);
        };

        match self.reservations.get(&id) {
            Some(r) if r.state == State::Defending => {
                let (start, count) = self.block_of(pool, r).unwrap_or((0, 0));
                self.push_notify(sender, NotifyKind::Status, Some(id), start, count, NotifyError::None);
                Ok(())
            }
            _ => {
                self.push_notify(
                    sender,
                    NotifyKind::Status,
                    Some(id),
                    0,
                    0,
                    NotifyError::ReleaseInvalidId,
                );
                Err(Error::ReleaseInvalidId)
            }
        }
    }

    /// Time until the next pending timer, or [`IDLE_WAIT`] when idle.
    ///
    /// The host arms its wake primitive from this and then calls
    /// [`handle_timer`](Self::handle_timer).
    pub fn delay_to_next_timer(&self) -> Duration {
        match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_sub(self.clock.now()),
            None => IDLE_WAIT,
        }
    }

    /// Pop the oldest undelivered notification.
    pub fn pop_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Number of undelivered notifications.
    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// The pool set by `init`, if any.
    pub fn pool(&self) -> Option<Pool> {
        self.pool
    }

    /// This station's MAC address.
    pub fn src_mac(&self) -> MacAddr {
        self.src_mac
    }

    /// Engine counters.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// The injected clock.
    ///
    /// Useful for simulation where the clock is advanced externally.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The injected network collaborator.
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Mutable access to the network collaborator (simulators drain
    /// their transmit queues through this).
    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    /// Current block of a reservation as `(start_address, count)`,
    /// regardless of its negotiation state.
    pub fn reservation_range(&self, id: ReservationId) -> Option<(u64, u32)> {
        let pool = self.pool?;
        self.block_of(pool, self.reservations.get(&id)?)
    }

    /// Whether a reservation has reached the defending state.
    pub fn is_defending(&self, id: ReservationId) -> bool {
        matches!(
            self.reservations.get(&id),
            Some(r) if r.state == State::Defending
        )
    }

    /// Drain buffered protocol trace events.
    #[cfg(feature = "debug")]
    pub fn take_debug_events(&mut self) -> alloc::vec::Vec<crate::debug::DebugEvent> {
        self.debug_events.drain(..).collect()
    }

    #[cfg(feature = "debug")]
    pub(crate) fn emit_debug(&mut self, event: crate::debug::DebugEvent) {
        self.debug_events.push_back(event);
    }

    /// Validate the cross-container invariants. Panics on violation.
    ///
    /// Intended for tests and randomized workloads; the engine upholds
    /// these by construction.
    pub fn assert_consistent(&self) {
        // Intervals are pairwise disjoint and sorted by low offset.
        let mut prev: Option<(u16, u16)> = None;
        for (low, iv) in self.intervals.iter() {
            assert!(low <= iv.high, "inverted interval");
            if let Some((_, prev_high)) = prev {
                assert!(prev_high < low, "overlapping intervals");
            }
            prev = Some((low, iv.high));

            let r = self
                .reservations
                .get(&iv.owner)
                .expect("interval owned by unknown reservation");
            assert_eq!(r.interval_low, low, "stale interval reference");
        }

        // Every reservation resolves to its own live interval and has
        // exactly one pending deadline.
        for (&id, r) in self.reservations.iter() {
            let iv = self
                .intervals
                .get(r.interval_low)
                .expect("reservation points at a missing interval");
            assert_eq!(iv.owner, id, "interval owned by someone else");
            assert!(self.timers.contains(id), "reservation has no timer");
        }
        assert_eq!(self.timers.len(), self.reservations.len());
        assert_eq!(self.intervals.len(), self.reservations.len());

        // Deadlines come out in non-decreasing order.
        let mut last = crate::time::Timestamp::ZERO;
        for (deadline, _) in self.timers.iter() {
            assert!(deadline >= last, "timer queue out of order");
            last = deadline;
        }
    }

    /// Block of a reservation as `(start_address, count)`.
    pub(crate) fn block_of(&self, pool: Pool, r: &Reservation) -> Option<(u64, u32)> {
        let iv = self.intervals.get(r.interval_low)?;
        Some((
            pool.base + r.interval_low as u64,
            (iv.high - r.interval_low + 1) as u32,
        ))
    }

    pub(crate) fn push_notify(
        &mut self,
        sender: SenderId,
        kind: NotifyKind,
        id: Option<ReservationId>,
        start: u64,
        count: u32,
        result: NotifyError,
    ) {
        self.notifications.push_back(Notification {
            kind,
            id,
            start,
            count,
            result,
            sender,
        });
    }

    /// Claim an interval of `len` addresses for `owner`.
    ///
    /// Tries `preferred_base` first when the whole block lies inside
    /// the pool, then up to [`ASSIGN_ATTEMPTS`] uniform random
    /// placements. Returns the low offset of the inserted interval.
    pub(crate) fn assign_interval(
        &mut self,
        pool: Pool,
        owner: ReservationId,
        preferred_base: u64,
        len: u16,
    ) -> Option<u16> {
        debug_assert!(len >= 1 && len as u32 <= pool.len);

        if preferred_base >= pool.base && preferred_base + (len as u64 - 1) <= pool.last() {
            let low = (preferred_base - pool.base) as u16;
            if self.intervals.insert(low, low + (len - 1), owner).is_ok() {
                return Some(low);
            }
        }

        let span = (pool.len - len as u32 + 1) as u64;
        for _ in 0..ASSIGN_ATTEMPTS {
            let low = self.random.gen_range(0, span) as u16;
            if self.intervals.insert(low, low + (len - 1), owner).is_ok() {
                return Some(low);
            }
        }
        None
    }
}
