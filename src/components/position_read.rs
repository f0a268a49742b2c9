//! Phase-1 front end: streams reference and neighbor positions out of the
//! cell caches into the compute pipelines.
//!
//! The controller walks cells in groups of `n_cpar` banks. For each group it
//! loads a batch of `n_ppar` reference particles per bank (one address
//! column per cycle), then sweeps the neighbor address upward through the
//! half-shell of every bank until a whole row of fetches comes back `Null`.
//! Occupancy is contiguous within a half, so an all-`Null` row means the
//! group is exhausted.
//!
//! The reader's staleness result crosses into the controller through a
//! register, giving the feedback path its mandatory one-cycle delay.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{SimConfig, DBSIZE};
use crate::framework::{Fabric, InPort, Io, Logic, OutPort, Transit, Value};
use crate::universe::{half_shell, N_FILTER};

pub struct PositionReadController {
    n_cell: usize,
    n_cpar: usize,
    n_ppar: usize,

    next_timestep: bool,
    cell_r: usize,
    addr_r: usize,
    addr_n: usize,
    /// `Some(p)` while loading reference column `p`; `None` while sweeping
    /// neighbors.
    new_reference: Option<usize>,
    /// Whether every reference fetched in the current batch was `Null`.
    stale_batch: bool,

    pub ready: InPort,
    pub double_buffer: InPort,
    pub stale_reference: InPort,
    pub oaddr: OutPort,
    pub cell_r_o: OutPort,
    pub new_reference_o: OutPort,
    pub done: OutPort,
}

impl PositionReadController {
    pub fn insert(fab: &mut Fabric, cfg: &SimConfig) -> Rc<RefCell<PositionReadController>> {
        let u = fab.declare("position-read-controller");
        let ready = fab.input(u, "ready");
        let double_buffer = fab.input(u, "double-buffer");
        let stale_reference = fab.input(u, "stale-reference");
        let oaddr = fab.output(u, "oaddr");
        let cell_r_o = fab.output(u, "cell-r");
        let new_reference_o = fab.output(u, "new-reference");
        let done = fab.output(u, "done");
        fab.bind(
            u,
            0,
            PositionReadController {
                n_cell: cfg.n_cell(),
                n_cpar: cfg.n_cpar,
                n_ppar: cfg.n_ppar,
                next_timestep: true,
                cell_r: 0,
                addr_r: 0,
                addr_n: 0,
                new_reference: None,
                stale_batch: true,
                ready,
                double_buffer,
                stale_reference,
                oaddr,
                cell_r_o,
                new_reference_o,
                done,
            },
        )
    }

    fn idle(&mut self, io: &mut Io<'_>) {
        io.set(self.done, Value::Null);
        io.set(self.oaddr, Value::Null);
        io.set(self.cell_r_o, Value::Null);
        io.set(self.new_reference_o, Value::Null);
    }

    fn halt(&mut self, io: &mut Io<'_>) {
        io.set(self.done, Value::bit(true));
        io.set(self.oaddr, Value::Null);
        io.set(self.cell_r_o, Value::Null);
        io.set(self.new_reference_o, Value::Null);
    }

    /// `addr == None` marks a reference column past the end of the half;
    /// the reader latches `Reset` there instead of fetching.
    fn emit(&mut self, io: &mut Io<'_>, addr: Option<usize>) {
        io.set(self.done, Value::bit(false));
        io.set(self.oaddr, addr.map(Value::addr).unwrap_or(Value::Null));
        io.set(self.cell_r_o, Value::addr(self.cell_r));
        match self.new_reference {
            Some(p) => io.set(self.new_reference_o, Value::addr(p)),
            None => io.set(self.new_reference_o, Value::Null),
        }
    }

    /// Start loading reference column 0 at the current `addr_r`.
    fn begin_batch(&mut self, io: &mut Io<'_>) {
        self.stale_batch = true;
        self.new_reference = Some(0);
        let addr = self.addr_r;
        self.emit(io, Some(addr));
    }

    /// Step to the next cell group, or finish the timestep.
    fn advance_cells(&mut self, io: &mut Io<'_>, base: usize) {
        self.cell_r += self.n_cpar;
        if self.cell_r >= self.n_cell {
            self.halt(io);
            return;
        }
        self.addr_r = base;
        self.begin_batch(io);
    }
}

impl Logic for PositionReadController {
    fn compute(&mut self, io: &mut Io<'_>) {
        if !io.get(self.ready).truthy() {
            // reset once the control unit has taken the phase away
            self.next_timestep = true;
            self.cell_r = 0;
            self.idle(io);
            return;
        }

        if self.cell_r >= self.n_cell {
            self.halt(io);
            return;
        }

        let db = io.get(self.double_buffer).truthy();
        let base = if db { DBSIZE } else { 0 };
        let stale = io.get(self.stale_reference).truthy();

        if self.next_timestep {
            self.next_timestep = false;
            self.cell_r = 0;
            self.addr_r = base;
            self.addr_n = base;
            self.begin_batch(io);
            return;
        }

        match self.new_reference {
            Some(p) => {
                // `stale` is the reader's verdict on column `p`
                if !stale {
                    self.stale_batch = false;
                }
                let next = p + 1;
                if next < self.n_ppar {
                    self.new_reference = Some(next);
                    let addr = self.addr_r + next;
                    let addr = (addr < base + DBSIZE).then_some(addr);
                    self.emit(io, addr);
                } else if self.stale_batch {
                    // a whole batch of empty slots: the group is exhausted
                    self.advance_cells(io, base);
                } else {
                    // references latched; start the neighbor sweep
                    self.new_reference = None;
                    self.addr_n = base;
                    let addr = self.addr_n;
                    self.emit(io, Some(addr));
                }
            }
            None => {
                if stale || self.addr_n + 1 >= base + DBSIZE {
                    // neighbors exhausted: next reference batch
                    self.addr_r += self.n_ppar;
                    if self.addr_r >= base + DBSIZE {
                        self.advance_cells(io, base);
                        return;
                    }
                    self.begin_batch(io);
                } else {
                    self.addr_n += 1;
                    let addr = self.addr_n;
                    self.emit(io, Some(addr));
                }
            }
        }
    }
}

/// Fetches positions for the controller: a `n_cpar × n_ppar` reference grid
/// in reference mode, a `n_cpar × N_FILTER` half-shell grid in neighbor
/// mode. Banks that fall past the last cell emit `Reset` so stale reference
/// registers downstream are cleared rather than reused.
pub struct PositionReader {
    universe_size: usize,
    n_cell: usize,
    n_cpar: usize,

    pub i: Vec<InPort>,
    pub cell_r: InPort,
    pub addr: InPort,
    pub new_reference: InPort,
    /// `references[bank][pipeline]`
    pub references: Vec<Vec<OutPort>>,
    /// `o[bank][filter]`
    pub o: Vec<Vec<OutPort>>,
    pub stale_reference: OutPort,
}

impl PositionReader {
    pub fn insert(fab: &mut Fabric, cfg: &SimConfig) -> Rc<RefCell<PositionReader>> {
        let u = fab.declare("position-reader");
        let i = (0..cfg.n_cell()).map(|c| fab.input(u, format!("i{c}"))).collect();
        let cell_r = fab.input(u, "cell-r");
        let addr = fab.input(u, "addr");
        let new_reference = fab.input(u, "new-reference");
        let references = (0..cfg.n_cpar)
            .map(|b| {
                (0..cfg.n_ppar).map(|p| fab.output(u, format!("reference-{b}-{p}"))).collect()
            })
            .collect();
        let o = (0..cfg.n_cpar)
            .map(|b| (0..N_FILTER).map(|f| fab.output(u, format!("o{b}-{f}"))).collect())
            .collect();
        let stale_reference = fab.output(u, "stale-reference");
        fab.bind(
            u,
            0,
            PositionReader {
                universe_size: cfg.universe_size,
                n_cell: cfg.n_cell(),
                n_cpar: cfg.n_cpar,
                i,
                cell_r,
                addr,
                new_reference,
                references,
                o,
                stale_reference,
            },
        )
    }

    fn all_null(&self, io: &mut Io<'_>) {
        for bank in self.references.clone() {
            for r in bank {
                io.set(r, Value::Null);
            }
        }
        for bank in self.o.clone() {
            for o in bank {
                io.set(o, Value::Null);
            }
        }
        io.set(self.stale_reference, Value::Null);
    }
}

impl Logic for PositionReader {
    fn compute(&mut self, io: &mut Io<'_>) {
        let cell_r = match io.get(self.cell_r).as_addr() {
            Some(c) => c,
            None => {
                self.all_null(io);
                return;
            }
        };
        let addr = io.get(self.addr).as_addr();

        if let Some(p) = io.get(self.new_reference).as_addr() {
            // reference mode: latch column `p` of every bank; a missing
            // address means the column lies past the half and clears
            let mut stale = true;
            for b in 0..self.n_cpar {
                let cell = cell_r + b;
                let v = match (addr, cell < self.n_cell) {
                    (Some(addr), true) => match io.get(self.i[cell]).as_vec3() {
                        None => Value::Reset,
                        Some(r) => {
                            stale = false;
                            Value::tagged(Transit::position(cell, addr, r))
                        }
                    },
                    _ => Value::Reset,
                };
                for (pidx, port) in self.references[b].clone().into_iter().enumerate() {
                    io.set(port, if pidx == p { v } else { Value::Null });
                }
            }
            for bank in self.o.clone() {
                for o in bank {
                    io.set(o, Value::Null);
                }
            }
            io.set(self.stale_reference, Value::bit(stale));
            return;
        }

        // neighbor mode: one half-shell fetch per bank and filter slot
        let addr = addr.expect("neighbor sweep without an address");
        let mut stale = true;
        for b in 0..self.n_cpar {
            let cell = cell_r + b;
            if cell >= self.n_cell {
                for o in self.o[b].clone() {
                    io.set(o, Value::Null);
                }
                continue;
            }
            let shell = half_shell(cell, self.universe_size);
            for (o, cn) in self.o[b].clone().into_iter().zip(shell) {
                match io.get(self.i[cn]).as_vec3() {
                    None => io.set(o, Value::Null),
                    Some(r) => {
                        stale = false;
                        io.set(o, Value::tagged(Transit::position(cn, addr, r)));
                    }
                }
            }
        }
        for bank in self.references.clone() {
            for r in bank {
                io.set(r, Value::Null);
            }
        }
        io.set(self.stale_reference, Value::bit(stale));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::Vec3;

    struct Const {
        o: OutPort,
        v: Value,
    }
    impl Logic for Const {
        fn compute(&mut self, io: &mut Io<'_>) {
            io.set(self.o, self.v);
        }
    }

    /// Records `(new_reference, oaddr, cell_r, done)` every cycle.
    struct Probe {
        newref: InPort,
        oaddr: InPort,
        cell: InPort,
        done: InPort,
        log: Rc<RefCell<Vec<(Value, Value, Value, Value)>>>,
    }
    impl Logic for Probe {
        fn compute(&mut self, io: &mut Io<'_>) {
            let row = (
                io.get(self.newref),
                io.get(self.oaddr),
                io.get(self.cell),
                io.get(self.done),
            );
            self.log.borrow_mut().push(row);
        }
    }

    #[test]
    fn controller_schedule_for_one_occupied_cell() {
        let cfg = SimConfig { n_cpar: 1, n_ppar: 1, ..Default::default() };
        let mut fab = Fabric::new();

        let ctl = PositionReadController::insert(&mut fab, &cfg);
        let reader = PositionReader::insert(&mut fab, &cfg);
        let stale = fab.add_register("stale-reference");

        let mk_const = |fab: &mut Fabric, name: &str, v: Value| {
            let u = fab.declare(name);
            let o = fab.output(u, "o");
            fab.bind(u, 0, Const { o, v });
            o
        };
        let ready = mk_const(&mut fab, "ready", Value::bit(true));
        let db = mk_const(&mut fab, "db", Value::bit(false));
        let null = mk_const(&mut fab, "null", Value::Null);

        // two particles in cell 0, nothing anywhere else
        let mut brams = Vec::new();
        for cell in 0..cfg.n_cell() {
            let b = fab.add_bram(format!("p-{cell}"), crate::config::BSIZE);
            fab.connect(null, b.i);
            fab.connect(null, b.iaddr);
            brams.push(b);
        }
        brams[0].data.set(0, Value::vec3(Vec3::new(0.1, 0.1, 0.1)));
        brams[0].data.set(1, Value::vec3(Vec3::new(0.2, 0.1, 0.1)));

        {
            let c = ctl.borrow();
            fab.connect(ready, c.ready);
            fab.connect(db, c.double_buffer);
            fab.connect(stale.o, c.stale_reference);
            let r = reader.borrow();
            fab.connect(c.cell_r_o, r.cell_r);
            fab.connect(c.oaddr, r.addr);
            fab.connect(c.new_reference_o, r.new_reference);
            fab.connect(r.stale_reference, stale.i);
            for (cell, b) in brams.iter().enumerate() {
                fab.connect(c.oaddr, b.oaddr);
                fab.connect(b.o, r.i[cell]);
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let u = fab.declare("probe");
        let probe = Probe {
            newref: fab.input(u, "newref"),
            oaddr: fab.input(u, "oaddr"),
            cell: fab.input(u, "cell"),
            done: fab.input(u, "done"),
            log: log.clone(),
        };
        {
            let c = ctl.borrow();
            fab.connect(c.new_reference_o, probe.newref);
            fab.connect(c.oaddr, probe.oaddr);
            fab.connect(c.cell_r_o, probe.cell);
            fab.connect(c.done, probe.done);
        }
        fab.bind(u, 0, probe);
        fab.finalize().unwrap();

        for _ in 0..60 {
            fab.clock();
        }
        let log = log.borrow();

        // load reference 0, sweep neighbors 0..2, reload at 1, sweep again,
        // then a stale batch at 2 ends the cell
        let expected = [
            (Value::addr(0), Value::addr(0)),
            (Value::Null, Value::addr(0)),
            (Value::Null, Value::addr(1)),
            (Value::Null, Value::addr(2)),
            (Value::addr(0), Value::addr(1)),
            (Value::Null, Value::addr(0)),
            (Value::Null, Value::addr(1)),
            (Value::Null, Value::addr(2)),
            (Value::addr(0), Value::addr(2)),
        ];
        for (cycle, (newref, oaddr)) in expected.iter().enumerate() {
            assert_eq!(&log[cycle].0, newref, "new_reference at cycle {cycle}");
            assert_eq!(&log[cycle].1, oaddr, "oaddr at cycle {cycle}");
            assert_eq!(log[cycle].2, Value::addr(0), "cell at cycle {cycle}");
        }
        // the next cycle advances to cell 1, and the sweep ends with done
        assert_eq!(log[9].2, Value::addr(1));
        assert!(log.iter().any(|row| row.3.truthy()), "controller never finished");
        // every emission before done carried an address
        let done_at = log.iter().position(|row| row.3.truthy()).unwrap();
        assert!(log[..done_at].iter().all(|row| !row.1.is_null() || !row.0.is_null()));
    }
}
