//! maap - IEEE 1722 Annex B multicast address acquisition
//!
//! A MAAP client dynamically claims and defends a contiguous block of
//! multicast MAC addresses from a shared pool, with no central
//! allocator. Conflicts are resolved by a probe / defend / announce /
//! yield exchange arbitrated by MAC address comparison: the numerically
//! lower station wins.
//!
//! # Key Properties
//!
//! - Single-threaded and non-blocking; the host embeds the client in
//!   its own event loop
//! - All collaborators (link layer, clock, randomness) are injected
//!   through traits, so whole negotiations run deterministically under
//!   test
//! - Outcomes are reported through an in-order notification queue
//!
//! # Example
//!
//! ```no_run
//! use maap::{MaapClient, MAAP_DYNAMIC_POOL_BASE, MAAP_DYNAMIC_POOL_LEN};
//!
//! // Implement Network, Random and Clock for your platform...
//!
//! // let mut client = MaapClient::new(network, random, clock, station_mac);
//! // client.init(host_token, MAAP_DYNAMIC_POOL_BASE, MAAP_DYNAMIC_POOL_LEN)?;
//! // let id = client.reserve(host_token, 0, 8)?;
//!
//! // In the event loop:
//! // - feed received frames to client.handle_packet(frame)
//! // - arm a wake from client.delay_to_next_timer(), then call
//! //   client.handle_timer()
//! // - drain client.pop_notification()
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Constants, notifications, errors, metrics
//! - [`time`] - Timestamp/Duration over nanoseconds
//! - [`wire`] - 42-byte MAAP PDU codec
//! - [`traits`] - Network, Clock, Random collaborator traits
//! - [`interval`] - Ordered set of non-overlapping claims
//! - [`timer`] - Earliest-deadline-first reservation timer queue
//! - [`client`] - The client struct and host command surface
//! - [`negotiate`] - Conflict resolution and timer expiry handling

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod client;
#[cfg(feature = "debug")]
pub mod debug;
pub mod interval;
pub mod negotiate;
pub mod time;
pub mod timer;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use client::{MaapClient, Pool};
pub use time::{Duration, Timestamp};
pub use traits::{Clock, Network, Random};
pub use types::{
    EngineMetrics, Error, MacAddr, Notification, NotifyError, NotifyKind, ReservationId,
    SenderId,
};
pub use wire::{DecodeError, MaapPdu, MessageType};

// Re-export constants
pub use types::{
    IDLE_WAIT, MAAP_DEST_MAC, MAAP_DYNAMIC_POOL_BASE, MAAP_DYNAMIC_POOL_LEN, MAAP_ETHERTYPE,
    MAAP_PDU_LEN, MAAP_SUBTYPE, PROBE_RETRANSMITS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::test_impls::{MockClock, MockNetwork, MockRandom};

    #[test]
    fn test_client_creation() {
        let client = MaapClient::new(
            MockNetwork::new(),
            MockRandom::new(),
            MockClock::new(),
            [0x02, 0, 0, 0, 0, 0x01],
        );

        // Unusable until init sets the pool.
        assert!(client.pool().is_none());
        assert_eq!(client.delay_to_next_timer(), IDLE_WAIT);
        assert_eq!(client.pending_notifications(), 0);
    }

    #[test]
    fn test_init_and_reserve_smoke() {
        let mut client = MaapClient::new(
            MockNetwork::new(),
            MockRandom::new(),
            MockClock::new(),
            [0x02, 0, 0, 0, 0, 0x01],
        );

        client
            .init(7, MAAP_DYNAMIC_POOL_BASE, MAAP_DYNAMIC_POOL_LEN)
            .unwrap();
        let id = client.reserve(7, 0, 8).unwrap();
        assert_eq!(id, 1);

        // One frame out, two notifications queued.
        assert_eq!(client.network().tx_log.len(), 1);
        assert_eq!(client.pending_notifications(), 2);
        client.assert_consistent();
    }
}
