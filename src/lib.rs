//! Simulation of an evolving pathogen spreading over a random contact network.
//!
//! An [`engine::Engine`] advances a population of agents one step at a time,
//! interning mutated pathogen genomes in a [`variant::VariantRegistry`].
//! The [`driver`] runs engines to termination, alone or as a parallel batch of
//! independently seeded replicates.

pub mod analysis;
pub mod config;
pub mod driver;
pub mod engine;
pub mod manager;
pub mod network;
pub mod population;
pub mod sink;
pub mod stats;
pub mod variant;
