//! Timestep sequencing.
//!
//! Two phases per timestep by default: force evaluation (velocity fragments
//! accumulate straight into the velocity caches) and position update
//! (advance, migrate, flip the double buffer). With the split velocity
//! update enabled, force evaluation instead banks raw accelerations and a
//! middle phase integrates `v += a·DT` across all cells in lock-step.
//!
//! The control unit's outputs are buffered through registers by the builder
//! so the done→ready feedback never closes a combinational loop; the done
//! inputs are read directly.

use std::cell::RefCell;
use std::rc::Rc;

use crate::framework::{Fabric, InPort, Io, Logic, OutPort, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ForceEvaluation,
    VelocityUpdate,
    PositionUpdate,
}

type Hook = Box<dyn FnMut(usize, bool)>;

pub struct ControlUnit {
    phase: Phase,
    t: usize,
    double_buffer: bool,
    split_velocity_update: bool,

    pub phase1_done: InPort,
    pub phase2_done: InPort,
    pub phase3_done: InPort,
    pub phase1_ready: OutPort,
    pub phase2_ready: OutPort,
    pub phase3_ready: OutPort,
    pub double_buffer_o: OutPort,

    /// Invoked with `(t, double_buffer)` when force evaluation begins.
    on_enter_phase1: Option<Hook>,
    /// Invoked with `(t, double_buffer)` when position update begins.
    on_enter_phase3: Option<Hook>,
    /// Invoked with `(completed_t, new_double_buffer)` after the flip.
    on_timestep: Option<Hook>,
}

impl ControlUnit {
    pub fn insert(fab: &mut Fabric, split_velocity_update: bool) -> Rc<RefCell<ControlUnit>> {
        let u = fab.declare("control-unit");
        let phase1_done = fab.input(u, "phase1-done");
        let phase2_done = fab.input(u, "phase2-done");
        let phase3_done = fab.input(u, "phase3-done");
        let phase1_ready = fab.output(u, "phase1-ready");
        let phase2_ready = fab.output(u, "phase2-ready");
        let phase3_ready = fab.output(u, "phase3-ready");
        let double_buffer_o = fab.output(u, "double-buffer");
        fab.bind(
            u,
            0,
            ControlUnit {
                phase: Phase::ForceEvaluation,
                t: 0,
                double_buffer: false,
                split_velocity_update,
                phase1_done,
                phase2_done,
                phase3_done,
                phase1_ready,
                phase2_ready,
                phase3_ready,
                double_buffer_o,
                on_enter_phase1: None,
                on_enter_phase3: None,
                on_timestep: None,
            },
        )
    }

    pub fn t(&self) -> usize {
        self.t
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn double_buffer(&self) -> bool {
        self.double_buffer
    }

    pub fn set_on_enter_phase1(&mut self, f: impl FnMut(usize, bool) + 'static) {
        self.on_enter_phase1 = Some(Box::new(f));
    }

    pub fn set_on_enter_phase3(&mut self, f: impl FnMut(usize, bool) + 'static) {
        self.on_enter_phase3 = Some(Box::new(f));
    }

    pub fn set_on_timestep(&mut self, f: impl FnMut(usize, bool) + 'static) {
        self.on_timestep = Some(Box::new(f));
    }

    /// Fire the phase-1 hook for timestep 0. The state machine only invokes
    /// hooks on transitions, and the first force evaluation starts without
    /// one.
    pub fn start(&mut self) {
        if let Some(f) = self.on_enter_phase1.as_mut() {
            f(0, false);
        }
    }
}

impl Logic for ControlUnit {
    fn compute(&mut self, io: &mut Io<'_>) {
        let phase1_done = io.get(self.phase1_done).truthy();
        let phase2_done = io.get(self.phase2_done).truthy();
        let phase3_done = io.get(self.phase3_done).truthy();

        match self.phase {
            Phase::ForceEvaluation if phase1_done => {
                tracing::debug!(t = self.t, "force evaluation done");
                if self.split_velocity_update {
                    self.phase = Phase::VelocityUpdate;
                } else {
                    self.phase = Phase::PositionUpdate;
                    if let Some(f) = self.on_enter_phase3.as_mut() {
                        f(self.t, self.double_buffer);
                    }
                }
            }
            Phase::VelocityUpdate if phase2_done => {
                self.phase = Phase::PositionUpdate;
                if let Some(f) = self.on_enter_phase3.as_mut() {
                    f(self.t, self.double_buffer);
                }
            }
            Phase::PositionUpdate if phase3_done => {
                self.phase = Phase::ForceEvaluation;
                self.double_buffer = !self.double_buffer;
                let completed = self.t;
                self.t += 1;
                tracing::info!(t = completed, "timestep complete");
                if let Some(f) = self.on_timestep.as_mut() {
                    f(completed, self.double_buffer);
                }
                if let Some(f) = self.on_enter_phase1.as_mut() {
                    f(self.t, self.double_buffer);
                }
            }
            _ => {}
        }

        io.set(self.phase1_ready, Value::bit(self.phase == Phase::ForceEvaluation));
        io.set(self.phase2_ready, Value::bit(self.phase == Phase::VelocityUpdate));
        io.set(self.phase3_ready, Value::bit(self.phase == Phase::PositionUpdate));
        io.set(self.double_buffer_o, Value::bit(self.double_buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Const {
        o: OutPort,
        v: Value,
    }
    impl Logic for Const {
        fn compute(&mut self, io: &mut Io<'_>) {
            io.set(self.o, self.v);
        }
    }

    fn always_done(fab: &mut Fabric) -> OutPort {
        let u = fab.declare("done-const");
        let o = fab.output(u, "o");
        fab.bind(u, 0, Const { o, v: Value::bit(true) });
        o
    }

    fn rig(split: bool) -> (Fabric, Rc<RefCell<ControlUnit>>) {
        let mut fab = Fabric::new();
        let control = ControlUnit::insert(&mut fab, split);
        let (p1d, p2d, p3d, p1r, p2r, p3r, dbo) = {
            let c = control.borrow();
            (
                c.phase1_done,
                c.phase2_done,
                c.phase3_done,
                c.phase1_ready,
                c.phase2_ready,
                c.phase3_ready,
                c.double_buffer_o,
            )
        };
        let o = always_done(&mut fab);
        fab.connect(o, p1d);
        fab.connect(o, p2d);
        fab.connect(o, p3d);
        for (name, port) in [("r1", p1r), ("r2", p2r), ("r3", p3r), ("rdb", dbo)] {
            let r = fab.add_register(name);
            fab.connect(port, r.i);
        }
        fab.finalize().unwrap();
        (fab, control)
    }

    #[test]
    fn phases_advance_and_buffer_flips() {
        // every phase reports done every cycle, so the unit ping-pongs
        let (mut fab, control) = rig(false);
        fab.clock();
        assert_eq!(control.borrow().phase(), Phase::PositionUpdate);
        assert_eq!(control.borrow().t(), 0);
        fab.clock();
        assert_eq!(control.borrow().phase(), Phase::ForceEvaluation);
        assert_eq!(control.borrow().t(), 1);
        assert!(control.borrow().double_buffer());
        fab.clock();
        fab.clock();
        assert_eq!(control.borrow().t(), 2);
        assert!(!control.borrow().double_buffer());
    }

    #[test]
    fn split_mode_inserts_the_velocity_phase() {
        let (mut fab, control) = rig(true);
        fab.clock();
        assert_eq!(control.borrow().phase(), Phase::VelocityUpdate);
        fab.clock();
        assert_eq!(control.borrow().phase(), Phase::PositionUpdate);
        fab.clock();
        assert_eq!(control.borrow().phase(), Phase::ForceEvaluation);
        assert_eq!(control.borrow().t(), 1);
    }
}
