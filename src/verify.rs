//! Ground-truth harness: recomputes, per timestep, the exact set of pair
//! interactions the fabric must perform and the positions it must produce.
//!
//! Two instrumentation sets are rebuilt at every timestep start:
//!
//! * the **filter set** holds the ordered pair ident of every occupied
//!   `(reference, neighbor)` slot combination the streaming front end must
//!   present to the filter bank;
//! * the **pipeline set** holds both orderings of every pair the filters
//!   must admit into a force pipeline.
//!
//! The filters and pipelines drain these sets as they run; anything left
//! over (or anything consumed twice) is an implementation bug and aborts
//! with the offending origins. Positions are cross-checked against a direct
//! O(N²) integration of the same state.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use ansi_term::Colour::{Green, Red};

use crate::config::{SimConfig, BSIZE, DBSIZE};
use crate::framework::{BramData, Transit};
use crate::lj::LjParams;
use crate::universe::{cell_from_position, half_shell, modr, n3l, Vec3};

/// Slot identifier: unique per `(cell, addr)`.
fn ident(cell: usize, addr: usize) -> u64 {
    (cell * BSIZE + addr) as u64
}

/// Ordered pair key over slot identifiers.
pub fn pair_ident(n_ident: u64, a: (usize, usize), b: (usize, usize)) -> u64 {
    ident(a.0, a.1) * n_ident + ident(b.0, b.1)
}

/// Invert a pair key back to `((cell, addr), (cell, addr))` for diagnostics.
pub fn pair_origins(n_ident: u64, key: u64) -> ((usize, usize), (usize, usize)) {
    let (a, b) = (key / n_ident, key % n_ident);
    let split = |id: u64| ((id as usize) / BSIZE, (id as usize) % BSIZE);
    (split(a), split(b))
}

/// The two instrumentation sets shared with the filter bank and the force
/// pipelines.
pub struct ExpectSets {
    enabled: bool,
    n_ident: u64,
    filter: HashSet<u64>,
    pipeline: HashSet<u64>,
}

impl ExpectSets {
    pub fn new(cfg: &SimConfig) -> Self {
        ExpectSets {
            enabled: cfg.verify,
            n_ident: cfg.n_ident(),
            filter: HashSet::new(),
            pipeline: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn clear(&mut self) {
        self.filter.clear();
        self.pipeline.clear();
    }

    /// Record every pair the front end must stream for this timestep.
    fn expect(&mut self, reference: (usize, usize), neighbor: (usize, usize), admitted: bool) {
        self.filter.insert(pair_ident(self.n_ident, reference, neighbor));
        if admitted {
            self.pipeline.insert(pair_ident(self.n_ident, reference, neighbor));
            self.pipeline.insert(pair_ident(self.n_ident, neighbor, reference));
        }
    }

    /// Called by a filter for every non-`Null` pair it is presented.
    pub fn consume_filter(&mut self, reference: &Transit, neighbor: &Transit) {
        if !self.enabled {
            return;
        }
        let key = pair_ident(self.n_ident, reference.origin(), neighbor.origin());
        if !self.filter.remove(&key) {
            panic!(
                "filter received unexpected or repeated pair {:?} -> {:?} (pair_ident {key})",
                reference.origin(),
                neighbor.origin()
            );
        }
    }

    /// Called by a force pipeline for every pair it admits. Both orderings
    /// are retired: the single evaluation serves both particles.
    pub fn consume_pipeline(&mut self, reference: &Transit, neighbor: &Transit) {
        if !self.enabled {
            return;
        }
        let key = pair_ident(self.n_ident, reference.origin(), neighbor.origin());
        if !self.pipeline.remove(&key) {
            panic!(
                "force pipeline received unexpected or repeated pair {:?} -> {:?} (pair_ident {key})",
                reference.origin(),
                neighbor.origin()
            );
        }
        self.pipeline.remove(&pair_ident(self.n_ident, neighbor.origin(), reference.origin()));
    }

    /// Both sets must be empty once force evaluation hands over to the
    /// position update.
    pub fn assert_drained(&self, t: usize) {
        if !self.enabled {
            return;
        }
        for (name, set) in [("filter", &self.filter), ("pipeline", &self.pipeline)] {
            if let Some(key) = set.iter().next() {
                let (r, n) = pair_origins(self.n_ident, *key);
                panic!(
                    "timestep {t}: {} pairs never reached the {name} bank, e.g. {:?} -> {:?}",
                    set.len(),
                    r,
                    n
                );
            }
        }
    }
}

/// One scanned particle.
struct Scanned {
    cell: usize,
    addr: usize,
    r: Vec3,
    v: Vec3,
}

pub struct Verifier {
    cfg: SimConfig,
    lj: LjParams,
    pub expect: Rc<RefCell<ExpectSets>>,
    p_data: Vec<BramData>,
    v_data: Vec<BramData>,
    /// Per destination cell, the positions the direct integrator predicts
    /// for the end of the running timestep.
    targets: Vec<Vec<Vec3>>,
}

impl Verifier {
    pub fn new(cfg: &SimConfig, p_data: Vec<BramData>, v_data: Vec<BramData>) -> Self {
        Verifier {
            lj: cfg.lj(),
            expect: Rc::new(RefCell::new(ExpectSets::new(cfg))),
            targets: vec![Vec::new(); cfg.n_cell()],
            p_data,
            v_data,
            cfg: cfg.clone(),
        }
    }

    fn scan(&self, db: bool) -> Vec<Scanned> {
        let base = self.cfg.db_base(db);
        let mut out = Vec::new();
        for (cell, (pc, vc)) in self.p_data.iter().zip(&self.v_data).enumerate() {
            for addr in base..base + DBSIZE {
                let r = pc.get(addr);
                let v = vc.get(addr);
                match (r.as_vec3(), v.as_vec3()) {
                    (Some(r), Some(v)) => out.push(Scanned { cell, addr, r, v }),
                    (None, None) => {}
                    _ => panic!("cell {cell} addr {addr}: position and velocity slots disagree"),
                }
            }
        }
        out
    }

    /// Timestep preamble: invariants on the resident state, then the expect
    /// sets and reference targets for the step about to run.
    pub fn on_timestep_start(&mut self, t: usize, db: bool) {
        let particles = self.scan(db);

        if particles.len() != self.cfg.n_particle {
            panic!(
                "timestep {t}: particle count drifted, {} resident vs {} configured",
                particles.len(),
                self.cfg.n_particle
            );
        }
        let (cutoff, u) = (self.cfg.cutoff(), self.cfg.universe_size);
        for p in &particles {
            let home = cell_from_position(p.r, cutoff, u);
            if home != p.cell {
                panic!(
                    "timestep {t}: particle at ({}, {}) with position {} belongs in cell {home}",
                    p.cell, p.addr, p.r
                );
            }
        }

        if self.expect.borrow().enabled() {
            self.build_expect(&particles);
            self.compute_targets(&particles);
        }

        let ke = particles.iter().map(|p| p.v.norm().powi(2) / 2.0).sum::<f64>();
        let momentum = particles.iter().fold(Vec3::ZERO, |acc, p| acc + p.v);
        tracing::debug!(t, ke, %momentum, "timestep state");
    }

    fn build_expect(&mut self, particles: &[Scanned]) {
        let mut expect = self.expect.borrow_mut();
        if !expect.enabled() {
            return;
        }
        expect.clear();
        let l = self.cfg.box_len();
        let cutoff = self.cfg.cutoff();
        let mut by_cell: Vec<Vec<&Scanned>> = vec![Vec::new(); self.cfg.n_cell()];
        for p in particles {
            by_cell[p.cell].push(p);
        }
        for cell_r in 0..self.cfg.n_cell() {
            for cell_n in half_shell(cell_r, self.cfg.universe_size) {
                for r in &by_cell[cell_r] {
                    for n in &by_cell[cell_n] {
                        if r.cell == n.cell && r.addr == n.addr {
                            expect.expect((r.cell, r.addr), (n.cell, n.addr), false);
                            continue;
                        }
                        let dist = modr(r.r, n.r, l).norm();
                        let admitted = dist < cutoff
                            && (r.cell != n.cell || n3l(r.r, n.r, l));
                        expect.expect((r.cell, r.addr), (n.cell, n.addr), admitted);
                    }
                }
            }
        }
    }

    /// Direct integration: accumulate every in-range impulse, then advance
    /// with the updated velocity and wrap into the box.
    fn compute_targets(&mut self, particles: &[Scanned]) {
        let l = self.cfg.box_len();
        let cutoff = self.cfg.cutoff();
        let dt = self.cfg.dt;
        let mut vel: Vec<Vec3> = particles.iter().map(|p| p.v).collect();
        for i in 0..particles.len() {
            for j in 0..i {
                if modr(particles[i].r, particles[j].r, l).norm() < cutoff {
                    let f = self.lj.force(particles[i].r, particles[j].r);
                    vel[i] += f * dt;
                    vel[j] += -f * dt;
                }
            }
        }
        for cell in &mut self.targets {
            cell.clear();
        }
        for (p, v) in particles.iter().zip(&vel) {
            let r = (p.r + *v * dt).wrap(l);
            self.targets[cell_from_position(r, cutoff, self.cfg.universe_size)].push(r);
        }
    }

    pub fn on_enter_phase3(&mut self, t: usize) {
        self.expect.borrow().assert_drained(t);
    }

    /// Compare the freshly written half against the targets computed at the
    /// start of the step.
    pub fn on_timestep_end(&mut self, t: usize, new_db: bool) {
        if !self.expect.borrow().enabled() {
            return;
        }
        let base = self.cfg.db_base(new_db);
        let l = self.cfg.box_len();
        let tol = self.cfg.err_tolerance;
        let mut remaining: Vec<Vec<Vec3>> = self.targets.clone();

        for (cell, pc) in self.p_data.iter().enumerate() {
            for addr in base..base + DBSIZE {
                let Some(r) = pc.get(addr).as_vec3() else { continue };
                let pool = &mut remaining[cell];
                let mut best: Option<(usize, f64)> = None;
                for (k, target) in pool.iter().enumerate() {
                    let err = modr(r, *target, l).norm() / target.norm().max(1e-12);
                    if best.map_or(true, |(_, b)| err < b) {
                        best = Some((k, err));
                    }
                }
                match best {
                    Some((k, err)) if err <= tol => {
                        pool.swap_remove(k);
                    }
                    Some((k, err)) => {
                        eprintln!(
                            "{}: cell {cell} addr {addr} computed {} vs {}, relative error {err:.3e}",
                            Red.bold().paint("position mismatch"),
                            r,
                            Green.paint(pool[k].to_string()),
                        );
                        panic!(
                            "timestep {t}: position at ({cell}, {addr}) matches no target \
                             (min relative error {err:.3e}, tolerance {tol:.1e})"
                        );
                    }
                    None => panic!(
                        "timestep {t}: particle at ({cell}, {addr}) but the reference \
                         integrator placed none in that cell"
                    ),
                }
            }
        }
        for (cell, pool) in remaining.iter().enumerate() {
            if !pool.is_empty() {
                panic!(
                    "timestep {t}: {} reference particles missing from cell {cell}, e.g. {}",
                    pool.len(),
                    pool[0]
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn sets(verify: bool) -> ExpectSets {
        let cfg = SimConfig { verify, ..Default::default() };
        ExpectSets::new(&cfg)
    }

    fn transit(cell: usize, addr: usize) -> Transit {
        Transit::position(cell, addr, Vec3::ZERO)
    }

    #[test]
    fn pair_ident_roundtrip() {
        let n = 27 * BSIZE as u64;
        let key = pair_ident(n, (3, 17), (22, 401));
        assert_eq!(pair_origins(n, key), ((3, 17), (22, 401)));
    }

    #[test]
    fn filter_consumption_drains() {
        let mut s = sets(true);
        s.expect((0, 0), (1, 0), true);
        s.consume_filter(&transit(0, 0), &transit(1, 0));
        s.consume_pipeline(&transit(0, 0), &transit(1, 0));
        s.assert_drained(0);
    }

    #[test]
    #[should_panic(expected = "unexpected or repeated")]
    fn duplicate_filter_pair_aborts() {
        let mut s = sets(true);
        s.expect((0, 0), (1, 0), false);
        s.consume_filter(&transit(0, 0), &transit(1, 0));
        s.consume_filter(&transit(0, 0), &transit(1, 0));
    }

    #[test]
    #[should_panic(expected = "never reached")]
    fn leftover_pairs_abort() {
        let mut s = sets(true);
        s.expect((0, 0), (1, 0), false);
        s.assert_drained(0);
    }

    #[test]
    fn mirror_ordering_is_retired_with_the_pair() {
        let mut s = sets(true);
        s.expect((0, 0), (0, 1), true);
        s.expect((0, 1), (0, 0), false);
        s.consume_filter(&transit(0, 0), &transit(0, 1));
        s.consume_filter(&transit(0, 1), &transit(0, 0));
        s.consume_pipeline(&transit(0, 0), &transit(0, 1));
        s.assert_drained(0);
    }

    #[test]
    fn disabled_sets_accept_anything() {
        let mut s = sets(false);
        s.consume_filter(&transit(0, 0), &transit(1, 0));
        s.consume_pipeline(&transit(5, 5), &transit(6, 6));
        s.assert_drained(0);
    }
}
