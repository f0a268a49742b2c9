//! Cycle-accurate behavioral emulator of a short-range molecular dynamics
//! accelerator.
//!
//! The accelerator is modeled as a synchronous dataflow graph: per timestep
//! it streams Lennard-Jones pair interactions through filter banks and force
//! pipelines, accumulates velocity impulses into per-cell caches, then
//! advances positions and migrates particles between spatial cells, flipping
//! a double buffer. Timing, parallelism and stall behavior follow what a
//! synthesizable implementation would exhibit; one
//! [`framework::Fabric::clock`] call is one hardware cycle.

pub mod components;
pub mod config;
pub mod emulator;
pub mod framework;
pub mod lj;
pub mod record;
pub mod universe;
pub mod verify;

pub use config::SimConfig;
pub use emulator::{Emulator, RunSummary};
