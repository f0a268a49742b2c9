//! Phase-1 write-back: fragments stream out of the compute pipelines into
//! per-cell queues, and at most one fragment per cell per cycle is folded
//! into its cache - velocity impulses in the direct mode, raw accelerations
//! into the acceleration cache when the split update is enabled. The split
//! mode's middle phase then walks every cell in lock-step, integrating
//! `v += a·DT` and consuming the acceleration slot behind itself.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::DBSIZE;
use crate::framework::{Fabric, InPort, Io, Logic, OutPort, Transit, Value};

/// Scoreboard between the pipelines and the caches: queues fragments by
/// destination cell and drains each queue one fragment per cycle, driving
/// the cache address alongside.
pub struct VelocityUpdateController {
    queues: Vec<VecDeque<Transit>>,

    pub i: Vec<InPort>,
    pub o: Vec<OutPort>,
    pub oaddr: Vec<OutPort>,
    pub qempty: OutPort,
}

impl VelocityUpdateController {
    pub fn insert(
        fab: &mut Fabric,
        n_pipelines: usize,
        n_cell: usize,
    ) -> Rc<RefCell<VelocityUpdateController>> {
        let u = fab.declare("velocity-update-controller");
        let i = (0..n_pipelines).map(|p| fab.input(u, format!("i{p}"))).collect();
        let o = (0..n_cell).map(|c| fab.output(u, format!("o{c}"))).collect();
        let oaddr = (0..n_cell).map(|c| fab.output(u, format!("oaddr-{c}"))).collect();
        let qempty = fab.output(u, "qempty");
        fab.bind(
            u,
            0,
            VelocityUpdateController {
                queues: (0..n_cell).map(|_| VecDeque::new()).collect(),
                i,
                o,
                oaddr,
                qempty,
            },
        )
    }
}

impl Logic for VelocityUpdateController {
    fn compute(&mut self, io: &mut Io<'_>) {
        for p in self.i.clone() {
            if let Some(fragment) = io.get(p).as_tagged() {
                self.queues[fragment.cell].push_back(fragment);
            }
        }
        let mut all_empty = true;
        for cell in 0..self.queues.len() {
            match self.queues[cell].pop_front() {
                Some(fragment) => {
                    all_empty = false;
                    io.set(self.oaddr[cell], Value::addr(fragment.addr));
                    io.set(self.o[cell], Value::tagged(fragment));
                }
                None => {
                    io.set(self.oaddr[cell], Value::Null);
                    io.set(self.o[cell], Value::Null);
                }
            }
        }
        io.set(self.qempty, Value::bit(all_empty));
    }
}

/// Read-add-write against the velocity caches: each cell's fragment is
/// summed with the slot the scoreboard addressed this cycle. The first
/// fragment for an untouched slot simply lands as-is.
pub struct VelocityUpdater {
    pub fragments: Vec<InPort>,
    pub vi: Vec<InPort>,
    pub vo: Vec<OutPort>,
}

impl VelocityUpdater {
    pub fn insert(fab: &mut Fabric, n_cell: usize) -> Rc<RefCell<VelocityUpdater>> {
        let u = fab.declare("velocity-updater");
        let fragments = (0..n_cell).map(|c| fab.input(u, format!("fragment{c}"))).collect();
        let vi = (0..n_cell).map(|c| fab.input(u, format!("vi{c}"))).collect();
        let vo = (0..n_cell).map(|c| fab.output(u, format!("vo{c}"))).collect();
        fab.bind(u, 0, VelocityUpdater { fragments, vi, vo })
    }
}

impl Logic for VelocityUpdater {
    fn compute(&mut self, io: &mut Io<'_>) {
        for cell in 0..self.vo.len() {
            let fragment = io.get(self.fragments[cell]).as_tagged();
            let out = self.vo[cell];
            let Some(fragment) = fragment else {
                io.set(out, Value::Null);
                continue;
            };
            let sum = match io.get(self.vi[cell]).as_vec3() {
                Some(v) => v + fragment.v,
                None => fragment.v,
            };
            io.set(out, Value::vec3(sum));
        }
    }
}

/// Split-mode middle phase: sweeps one address per cycle through the read
/// half, addressing the acceleration and velocity caches together.
pub struct VelocityIntegrateController {
    k: usize,

    pub ready: InPort,
    pub double_buffer: InPort,
    pub oaddr: OutPort,
    pub done: OutPort,
}

impl VelocityIntegrateController {
    pub fn insert(fab: &mut Fabric) -> Rc<RefCell<VelocityIntegrateController>> {
        let u = fab.declare("velocity-integrate-controller");
        let ready = fab.input(u, "ready");
        let double_buffer = fab.input(u, "double-buffer");
        let oaddr = fab.output(u, "oaddr");
        let done = fab.output(u, "done");
        fab.bind(u, 0, VelocityIntegrateController { k: 0, ready, double_buffer, oaddr, done })
    }
}

impl Logic for VelocityIntegrateController {
    fn compute(&mut self, io: &mut Io<'_>) {
        if !io.get(self.ready).truthy() {
            self.k = 0;
            io.set(self.oaddr, Value::Null);
            io.set(self.done, Value::Null);
            return;
        }
        let base = if io.get(self.double_buffer).truthy() { DBSIZE } else { 0 };
        if self.k < DBSIZE {
            io.set(self.oaddr, Value::addr(base + self.k));
            io.set(self.done, Value::bit(false));
            self.k += 1;
        } else {
            io.set(self.oaddr, Value::Null);
            io.set(self.done, Value::bit(true));
        }
    }
}

/// Applies `v += a·DT` at the swept address of every cell. The acceleration
/// slot itself is cleared through its write port (a `Reset` rides the same
/// address), so the next force evaluation finds the cache empty. Gated on
/// the phase ready line: outside its phase the cache read ports belong to
/// the force evaluation and must not be interpreted.
pub struct VelocityIntegrator {
    dt: f64,

    pub ready: InPort,
    pub a_in: Vec<InPort>,
    pub v_in: Vec<InPort>,
    pub vo: Vec<OutPort>,
}

impl VelocityIntegrator {
    pub fn insert(fab: &mut Fabric, n_cell: usize, dt: f64) -> Rc<RefCell<VelocityIntegrator>> {
        let u = fab.declare("velocity-integrator");
        let ready = fab.input(u, "ready");
        let a_in = (0..n_cell).map(|c| fab.input(u, format!("a{c}"))).collect();
        let v_in = (0..n_cell).map(|c| fab.input(u, format!("v{c}"))).collect();
        let vo = (0..n_cell).map(|c| fab.output(u, format!("vo{c}"))).collect();
        fab.bind(u, 0, VelocityIntegrator { dt, ready, a_in, v_in, vo })
    }
}

impl Logic for VelocityIntegrator {
    fn compute(&mut self, io: &mut Io<'_>) {
        let ready = io.get(self.ready).truthy();
        for cell in 0..self.vo.len() {
            let out = self.vo[cell];
            if !ready {
                io.set(out, Value::Null);
                continue;
            }
            let Some(a) = io.get(self.a_in[cell]).as_vec3() else {
                io.set(out, Value::Null);
                continue;
            };
            let v = io.get(self.v_in[cell]).as_vec3().unwrap_or_else(|| {
                panic!("cell {cell}: acceleration banked for an unoccupied velocity slot")
            });
            io.set(out, Value::vec3(v + a * self.dt));
        }
    }
}
