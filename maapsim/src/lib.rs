//! maapsim - deterministic simulation of MAAP address negotiation
//!
//! Wires several [`maap::MaapClient`]s to a loss-free broadcast bus
//! under one virtual clock, with a seeded random generator per station.
//! The same seeds always produce the same negotiation, probe placement
//! and all, which makes multi-station arbitration scenarios (contended
//! probes, defense, yield chains) reproducible test cases.
//!
//! # Module Structure
//!
//! - [`station`] - Per-station collaborators (bus network, shared
//!   clock, seeded RNG)
//! - [`sim`] - The simulator: time advancement and frame delivery

pub mod sim;
pub mod station;

pub use sim::Simulator;
pub use station::{BusNetwork, SharedClock, SimRandom, Station};
