//! pbs-sim: agent-based simulation of Proposer-Builder Separation.
//!
//! Wires a gossiping node graph, adversarial sandwich attackers, and a
//! sealed-bid block auction into a per-slot chain driver, with a vanilla
//! proposer-only chain run alongside as the control.

pub mod attacker;
pub mod auction;
pub mod builder;
pub mod chain;
pub mod config;
pub mod network;

pub use chain::{Chain, Mode, Simulation, SlotOutcome};
pub use config::{NodeRecipe, SimConfig};
pub use network::{Network, NodeKind};
