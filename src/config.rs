//! Simulation parameters and the values derived from them.

use thiserror::Error;

use crate::lj::LjParams;

/// Slots per cell cache.
pub const BSIZE: usize = 512;
/// Slots per double-buffer half.
pub const DBSIZE: usize = BSIZE / 2;

pub use crate::universe::N_FILTER;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("universe size must be at least 3, got {0}")]
    UniverseTooSmall(usize),
    #[error("parallelism factors must be nonzero (n_cpar={n_cpar}, n_ppar={n_ppar})")]
    ZeroParallelism { n_cpar: usize, n_ppar: usize },
    #[error("timestep count must be nonzero")]
    ZeroTimesteps,
    #[error("cell {cell} holds {count} particles, capacity is {capacity}")]
    CellOverflow { cell: usize, count: usize, capacity: usize },
}

/// All knobs of one emulator run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Timesteps to simulate.
    pub t: usize,
    /// Integration step length.
    pub dt: f64,
    /// Cells per axis; the box holds `universe_size³` cells.
    pub universe_size: usize,
    pub epsilon: f64,
    pub sigma: f64,
    /// Seed for particle initialization.
    pub seed: u64,
    pub n_particle: usize,
    pub force_pipeline_stages: usize,
    pub filter_pipeline_stages: usize,
    /// Cells processed in parallel per streaming step.
    pub n_cpar: usize,
    /// Reference particles processed in parallel per cell.
    pub n_ppar: usize,
    /// Relative error the verifier tolerates against the direct integrator.
    pub err_tolerance: f64,
    /// Cross-check every timestep against the direct integrator.
    pub verify: bool,
    /// Accumulate raw accelerations into a dedicated cache during force
    /// evaluation and integrate `v += a·DT` in a separate lock-step phase,
    /// instead of folding `f·DT` straight into the velocity caches.
    pub split_velocity_update: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            t: 2,
            dt: 1e-7,
            universe_size: 3,
            epsilon: 40.0,
            sigma: 1.0,
            seed: 0,
            n_particle: 300,
            force_pipeline_stages: 70,
            filter_pipeline_stages: 13,
            n_cpar: 9,
            n_ppar: 4,
            err_tolerance: 1e-2,
            verify: true,
            split_velocity_update: false,
        }
    }
}

impl SimConfig {
    pub fn n_cell(&self) -> usize {
        self.universe_size * self.universe_size * self.universe_size
    }

    /// Interaction cutoff; also the cell side length.
    pub fn cutoff(&self) -> f64 {
        2.5 * self.sigma
    }

    /// Side length of the periodic box.
    pub fn box_len(&self) -> f64 {
        self.cutoff() * self.universe_size as f64
    }

    /// One more than the largest slot identifier; the pair-ident radix.
    pub fn n_ident(&self) -> u64 {
        (self.n_cell() * BSIZE) as u64
    }

    /// Base address of the half read during a timestep.
    pub fn db_base(&self, double_buffer: bool) -> usize {
        if double_buffer {
            DBSIZE
        } else {
            0
        }
    }

    /// Base address of the half written during a timestep.
    pub fn ndb_base(&self, double_buffer: bool) -> usize {
        if double_buffer {
            0
        } else {
            DBSIZE
        }
    }

    pub fn lj(&self) -> LjParams {
        LjParams::new(self.epsilon, self.sigma, self.box_len())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.universe_size < 3 {
            return Err(ConfigError::UniverseTooSmall(self.universe_size));
        }
        if self.n_cpar == 0 || self.n_ppar == 0 {
            return Err(ConfigError::ZeroParallelism { n_cpar: self.n_cpar, n_ppar: self.n_ppar });
        }
        if self.t == 0 {
            return Err(ConfigError::ZeroTimesteps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_values() {
        let cfg = SimConfig { sigma: 1.0, universe_size: 3, ..Default::default() };
        assert_eq!(cfg.n_cell(), 27);
        assert_eq!(cfg.cutoff(), 2.5);
        assert_eq!(cfg.box_len(), 7.5);
        assert_eq!(cfg.db_base(false), 0);
        assert_eq!(cfg.db_base(true), DBSIZE);
        assert_eq!(cfg.ndb_base(false), DBSIZE);
    }

    #[test]
    fn rejects_degenerate_setups() {
        let cfg = SimConfig { universe_size: 2, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = SimConfig { n_cpar: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
