//! Lennard-Jones pair force with the analytic force cap.

use crate::universe::{modr, Vec3};

/// Lennard-Jones parameters plus the derived force cap.
///
/// The cap is `4·|f(r*)|` where `r* = (26/7)^(1/6)·σ` is the radius of the
/// unclamped force-magnitude extremum; capping each component there keeps
/// close approaches from blowing up the integrator.
#[derive(Debug, Clone, Copy)]
pub struct LjParams {
    pub epsilon: f64,
    pub sigma: f64,
    pub box_len: f64,
    f_max: f64,
}

impl LjParams {
    pub fn new(epsilon: f64, sigma: f64, box_len: f64) -> Self {
        let r_star = (26.0 / 7.0_f64).powf(1.0 / 6.0) * sigma;
        let mut p = LjParams { epsilon, sigma, box_len, f_max: f64::INFINITY };
        p.f_max = 4.0 * p.coefficient(r_star).abs();
        p
    }

    /// Scalar part of the force: positive values attract the reference
    /// toward the neighbor.
    fn coefficient(&self, r: f64) -> f64 {
        let s6 = self.sigma.powi(6);
        let s12 = self.sigma.powi(12);
        4.0 * self.epsilon * (6.0 * s6 / r.powi(7) - 12.0 * s12 / r.powi(13))
    }

    /// Force on `reference` due to `neighbor`, using the minimum-image
    /// displacement for both magnitude and direction, clamped componentwise
    /// to `±f_max`. Coincident positions yield zero.
    pub fn force(&self, reference: Vec3, neighbor: Vec3) -> Vec3 {
        let delta = modr(reference, neighbor, self.box_len);
        let r = delta.norm();
        if r == 0.0 {
            return Vec3::ZERO;
        }
        let f = delta * (self.coefficient(r) / r);
        Vec3::new(self.clamp(f.x), self.clamp(f.y), self.clamp(f.z))
    }

    fn clamp(&self, c: f64) -> f64 {
        c.abs().min(self.f_max).copysign(c)
    }
}
