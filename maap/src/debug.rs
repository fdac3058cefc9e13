//! Protocol trace events, gated behind the `debug` feature.
//!
//! Simulators and tests drain these with
//! [`take_debug_events`](crate::MaapClient::take_debug_events) to follow
//! the negotiation without parsing transmitted frames.

use crate::time::Timestamp;
use crate::types::ReservationId;

/// Trace events emitted by the client.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// A PROBE went out for a reservation's current block.
    ProbeSent {
        id: ReservationId,
        start: u64,
        count: u32,
    },
    /// An ANNOUNCE went out for a held block.
    AnnounceSent {
        id: ReservationId,
        start: u64,
        count: u32,
    },
    /// A DEFEND went out naming the conflicting sub-block.
    DefendSent { conflict_start: u64, conflict_count: u16 },
    /// A deadline was armed for a reservation.
    TimerScheduled {
        id: ReservationId,
        deadline: Timestamp,
    },
    /// An overlapping PDU was outranked and ignored.
    ConflictIgnored { id: ReservationId },
    /// A frame failed to decode as a MAAP PDU.
    FrameDiscarded { len: usize },
    /// A reservation was removed from all containers.
    ReservationDropped { id: ReservationId },
}
