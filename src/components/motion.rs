//! Phase 3: clear the write half, advance and migrate every particle, then
//! scrub the half that was just consumed.
//!
//! All sub-phases ride one address counter. The clear sweep drives `Reset`
//! into every cell at each write-half address. The migrate sweep then walks
//! the read half; each occupied `(r, v)` advances by `v·DT`, wraps into the
//! box, and is queued for whichever cell its new position hashes to. Every
//! cell accepts at most one queued write per cycle at a monotonically
//! increasing address, so freshly written slots are contiguous from the
//! bottom of the half. Once the queues drain, a final sweep resets the
//! consumed read half: at every timestep boundary the inactive half holds
//! only `Null`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::{SimConfig, DBSIZE};
use crate::framework::{Fabric, InPort, Io, Logic, OutPort, Value};
use crate::universe::{cell_from_position, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubPhase {
    Clear,
    Sweep,
    Drain,
    Scrub,
    Done,
}

/// Sequences the sub-phases and reports done once the scrub sweep has
/// finished behind the drained write queues.
pub struct PositionUpdateController {
    k: usize,
    sub: SubPhase,

    pub ready: InPort,
    pub double_buffer: InPort,
    /// Updater queue status, one register behind.
    pub qempty: InPort,
    pub clear_addr: OutPort,
    pub raddr: OutPort,
    pub done: OutPort,
}

impl PositionUpdateController {
    pub fn insert(fab: &mut Fabric) -> Rc<RefCell<PositionUpdateController>> {
        let u = fab.declare("position-update-controller");
        let ready = fab.input(u, "ready");
        let double_buffer = fab.input(u, "double-buffer");
        let qempty = fab.input(u, "qempty");
        let clear_addr = fab.output(u, "clear-addr");
        let raddr = fab.output(u, "raddr");
        let done = fab.output(u, "done");
        fab.bind(
            u,
            0,
            PositionUpdateController {
                k: 0,
                sub: SubPhase::Clear,
                ready,
                double_buffer,
                qempty,
                clear_addr,
                raddr,
                done,
            },
        )
    }
}

impl Logic for PositionUpdateController {
    fn compute(&mut self, io: &mut Io<'_>) {
        if !io.get(self.ready).truthy() {
            self.k = 0;
            self.sub = SubPhase::Clear;
            io.set(self.clear_addr, Value::Null);
            io.set(self.raddr, Value::Null);
            io.set(self.done, Value::Null);
            return;
        }
        let db = io.get(self.double_buffer).truthy();
        let read_base = if db { DBSIZE } else { 0 };
        let write_base = DBSIZE - read_base;

        match self.sub {
            SubPhase::Clear => {
                io.set(self.clear_addr, Value::addr(write_base + self.k));
                io.set(self.raddr, Value::Null);
                io.set(self.done, Value::bit(false));
                self.k += 1;
                if self.k == DBSIZE {
                    self.k = 0;
                    self.sub = SubPhase::Sweep;
                }
            }
            SubPhase::Sweep => {
                io.set(self.clear_addr, Value::Null);
                io.set(self.raddr, Value::addr(read_base + self.k));
                io.set(self.done, Value::bit(false));
                self.k += 1;
                if self.k == DBSIZE {
                    self.k = 0;
                    self.sub = SubPhase::Drain;
                }
            }
            SubPhase::Drain => {
                io.set(self.clear_addr, Value::Null);
                io.set(self.raddr, Value::Null);
                io.set(self.done, Value::bit(false));
                if io.get(self.qempty).truthy() {
                    self.sub = SubPhase::Scrub;
                }
            }
            SubPhase::Scrub => {
                // write ports are free again; erase the consumed half so the
                // inactive half is all-Null at the timestep boundary
                io.set(self.clear_addr, Value::addr(read_base + self.k));
                io.set(self.raddr, Value::Null);
                io.set(self.done, Value::bit(false));
                self.k += 1;
                if self.k == DBSIZE {
                    self.sub = SubPhase::Done;
                }
            }
            SubPhase::Done => {
                io.set(self.clear_addr, Value::Null);
                io.set(self.raddr, Value::Null);
                io.set(self.done, Value::bit(true));
            }
        }
    }
}

/// Executes the clears and the migrations the controller schedules.
pub struct PositionUpdater {
    n_cell: usize,
    dt: f64,
    cutoff: f64,
    box_len: f64,
    universe_size: usize,

    active: bool,
    queues: Vec<VecDeque<(Vec3, Vec3)>>,
    next_write: Vec<usize>,

    pub ready: InPort,
    pub double_buffer: InPort,
    pub clear_addr: InPort,
    pub p_in: Vec<InPort>,
    pub v_in: Vec<InPort>,
    pub waddr: Vec<OutPort>,
    pub wp: Vec<OutPort>,
    pub wv: Vec<OutPort>,
    pub qempty: OutPort,
}

impl PositionUpdater {
    pub fn insert(fab: &mut Fabric, cfg: &SimConfig) -> Rc<RefCell<PositionUpdater>> {
        let n_cell = cfg.n_cell();
        let u = fab.declare("position-updater");
        let ready = fab.input(u, "ready");
        let double_buffer = fab.input(u, "double-buffer");
        let clear_addr = fab.input(u, "clear-addr");
        let p_in = (0..n_cell).map(|c| fab.input(u, format!("p{c}"))).collect();
        let v_in = (0..n_cell).map(|c| fab.input(u, format!("v{c}"))).collect();
        let waddr = (0..n_cell).map(|c| fab.output(u, format!("waddr-{c}"))).collect();
        let wp = (0..n_cell).map(|c| fab.output(u, format!("wp-{c}"))).collect();
        let wv = (0..n_cell).map(|c| fab.output(u, format!("wv-{c}"))).collect();
        let qempty = fab.output(u, "qempty");
        fab.bind(
            u,
            0,
            PositionUpdater {
                n_cell,
                dt: cfg.dt,
                cutoff: cfg.cutoff(),
                box_len: cfg.box_len(),
                universe_size: cfg.universe_size,
                active: false,
                queues: (0..n_cell).map(|_| VecDeque::new()).collect(),
                next_write: vec![0; n_cell],
                ready,
                double_buffer,
                clear_addr,
                p_in,
                v_in,
                waddr,
                wp,
                wv,
                qempty,
            },
        )
    }

    fn all_null(&self, io: &mut Io<'_>) {
        for cell in 0..self.n_cell {
            io.set(self.waddr[cell], Value::Null);
            io.set(self.wp[cell], Value::Null);
            io.set(self.wv[cell], Value::Null);
        }
    }
}

impl Logic for PositionUpdater {
    fn compute(&mut self, io: &mut Io<'_>) {
        if !io.get(self.ready).truthy() {
            self.active = false;
            self.all_null(io);
            io.set(self.qempty, Value::Null);
            return;
        }
        let db = io.get(self.double_buffer).truthy();
        let write_base = if db { 0 } else { DBSIZE };
        if !self.active {
            self.active = true;
            debug_assert!(self.queues.iter().all(VecDeque::is_empty));
            self.next_write = vec![write_base; self.n_cell];
        }

        // clear sub-phase: one Reset row per cycle across every cell
        if let Some(addr) = io.get(self.clear_addr).as_addr() {
            for cell in 0..self.n_cell {
                io.set(self.waddr[cell], Value::addr(addr));
                io.set(self.wp[cell], Value::Reset);
                io.set(self.wv[cell], Value::Reset);
            }
            io.set(self.qempty, Value::bit(true));
            return;
        }

        // migrate: absorb this cycle's row of reads
        for cell in 0..self.n_cell {
            let r = io.get(self.p_in[cell]).as_vec3();
            let v = io.get(self.v_in[cell]).as_vec3();
            match (r, v) {
                (Some(r), Some(v)) => {
                    let advanced = (r + v * self.dt).wrap(self.box_len);
                    let target = cell_from_position(advanced, self.cutoff, self.universe_size);
                    self.queues[target].push_back((advanced, v));
                }
                (None, None) => {}
                _ => panic!("cell {cell}: position and velocity reads disagree"),
            }
        }

        // then retire at most one queued write per cell
        let mut all_empty = true;
        for cell in 0..self.n_cell {
            if !self.queues[cell].is_empty() {
                all_empty = false;
            }
            match self.queues[cell].pop_front() {
                Some((r, v)) => {
                    let addr = self.next_write[cell];
                    if addr >= write_base + DBSIZE {
                        panic!(
                            "cell {cell} overflowed its write half ({DBSIZE} slots); \
                             density is misconfigured"
                        );
                    }
                    self.next_write[cell] += 1;
                    io.set(self.waddr[cell], Value::addr(addr));
                    io.set(self.wp[cell], Value::vec3(r));
                    io.set(self.wv[cell], Value::vec3(v));
                }
                None => {
                    io.set(self.waddr[cell], Value::Null);
                    io.set(self.wp[cell], Value::Null);
                    io.set(self.wv[cell], Value::Null);
                }
            }
        }
        io.set(self.qempty, Value::bit(all_empty));
    }
}
