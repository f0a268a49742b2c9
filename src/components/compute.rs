//! One compute pipeline: a reference register fanned out to a bank of
//! particle filters, a pair queue, the force pipeline and the reader that
//! coalesces its output stream.
//!
//! A pipeline is done when the front end has stopped streaming, every filter
//! and the force pipeline have drained, the pair queue is empty and the
//! reader's own queue has flushed; the `almost-done` AND tree gathers
//! exactly those signals.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::SimConfig;
use crate::framework::{
    AndGate, Fabric, InPort, Io, Logic, OutPort, RegisterHandle, Transit, UnitId, Value,
};
use crate::lj::LjParams;
use crate::universe::{modr, n3l, N_FILTER};
use crate::verify::ExpectSets;

/// Admits a `(reference, neighbor)` pair iff the two are distinct, within
/// the cutoff, and - for intra-cell pairs - on the kept side of the
/// half-shell ordering.
pub struct ParticleFilter {
    cutoff: f64,
    box_len: f64,
    expect: Rc<RefCell<ExpectSets>>,

    pub unit: UnitId,
    pub reference: InPort,
    pub neighbor: InPort,
    pub o: OutPort,
}

impl ParticleFilter {
    pub fn insert(
        fab: &mut Fabric,
        cfg: &SimConfig,
        expect: Rc<RefCell<ExpectSets>>,
        bank: usize,
        pidx: usize,
        fidx: usize,
    ) -> Rc<RefCell<ParticleFilter>> {
        let unit = fab.declare(format!("particle-filter-{bank}-{pidx}-{fidx}"));
        let reference = fab.input(unit, "reference");
        let neighbor = fab.input(unit, "neighbor");
        let o = fab.output(unit, "o");
        fab.bind(
            unit,
            cfg.filter_pipeline_stages,
            ParticleFilter {
                cutoff: cfg.cutoff(),
                box_len: cfg.box_len(),
                expect,
                unit,
                reference,
                neighbor,
                o,
            },
        )
    }
}

impl Logic for ParticleFilter {
    fn compute(&mut self, io: &mut Io<'_>) {
        let reference = io.get(self.reference).as_tagged();
        let neighbor = io.get(self.neighbor).as_tagged();
        let (Some(reference), Some(neighbor)) = (reference, neighbor) else {
            io.set(self.o, Value::Null);
            return;
        };

        self.expect.borrow_mut().consume_filter(&reference, &neighbor);

        if reference.origin() == neighbor.origin() {
            io.set(self.o, Value::Null);
            return;
        }
        if reference.cell == neighbor.cell && !n3l(reference.v, neighbor.v, self.box_len) {
            io.set(self.o, Value::Null);
            return;
        }

        let dist = modr(reference.v, neighbor.v, self.box_len).norm();
        if dist == 0.0 {
            panic!(
                "distinct particles {:?} and {:?} share a position {}",
                reference.origin(),
                neighbor.origin(),
                reference.v
            );
        }
        if dist < self.cutoff {
            io.set(self.o, Value::pair(reference, neighbor));
        } else {
            io.set(self.o, Value::Null);
        }
    }
}

/// Collects admitted pairs from the whole filter bank and feeds the force
/// pipeline one pair per cycle.
pub struct PairQueue {
    queue: VecDeque<(Transit, Transit)>,

    pub i: Vec<InPort>,
    pub o: OutPort,
    pub qempty: OutPort,
}

impl PairQueue {
    pub fn insert(
        fab: &mut Fabric,
        bank: usize,
        pidx: usize,
    ) -> Rc<RefCell<PairQueue>> {
        let u = fab.declare(format!("pair-queue-{bank}-{pidx}"));
        let i = (0..N_FILTER).map(|f| fab.input(u, format!("i{f}"))).collect();
        let o = fab.output(u, "o");
        let qempty = fab.output(u, "qempty");
        fab.bind(u, 0, PairQueue { queue: VecDeque::new(), i, o, qempty })
    }
}

impl Logic for PairQueue {
    fn compute(&mut self, io: &mut Io<'_>) {
        for p in self.i.clone() {
            if let Some(pair) = io.get(p).as_pair() {
                self.queue.push_back(pair);
            }
        }
        io.set(self.qempty, Value::bit(self.queue.is_empty()));
        match self.queue.pop_front() {
            Some((a, b)) => io.set(self.o, Value::pair(a, b)),
            None => io.set(self.o, Value::Null),
        }
    }
}

/// Evaluates the capped Lennard-Jones force for one pair per cycle and emits
/// the two opposite fragments, tagged with their particles' origins:
/// velocity impulses `±f·DT` in the direct mode, raw accelerations `±f`
/// when the split velocity update banks them for the middle phase.
pub struct ForcePipeline {
    lj: LjParams,
    dt: f64,
    emit_impulse: bool,
    expect: Rc<RefCell<ExpectSets>>,

    pub unit: UnitId,
    pub i: InPort,
    pub o: OutPort,
}

impl ForcePipeline {
    pub fn insert(
        fab: &mut Fabric,
        cfg: &SimConfig,
        expect: Rc<RefCell<ExpectSets>>,
        bank: usize,
        pidx: usize,
    ) -> Rc<RefCell<ForcePipeline>> {
        let unit = fab.declare(format!("force-pipeline-{bank}-{pidx}"));
        let i = fab.input(unit, "i");
        let o = fab.output(unit, "o");
        fab.bind(
            unit,
            cfg.force_pipeline_stages,
            ForcePipeline {
                lj: cfg.lj(),
                dt: cfg.dt,
                emit_impulse: !cfg.split_velocity_update,
                expect,
                unit,
                i,
                o,
            },
        )
    }
}

impl Logic for ForcePipeline {
    fn compute(&mut self, io: &mut Io<'_>) {
        let Some((reference, neighbor)) = io.get(self.i).as_pair() else {
            io.set(self.o, Value::Null);
            return;
        };

        self.expect.borrow_mut().consume_pipeline(&reference, &neighbor);

        let f = self.lj.force(reference.v, neighbor.v);
        let pair = if self.emit_impulse {
            let impulse = f * self.dt;
            Value::pair(
                Transit::velocity(reference.cell, reference.addr, impulse),
                Transit::velocity(neighbor.cell, neighbor.addr, -impulse),
            )
        } else {
            Value::pair(
                Transit::acceleration(reference.cell, reference.addr, f),
                Transit::acceleration(neighbor.cell, neighbor.addr, -f),
            )
        };
        io.set(self.o, pair);
    }
}

/// Coalesces the force pipeline's output: consecutive impulses for the same
/// reference are summed before being released, neighbors pass through, and
/// everything is flushed once upstream runs dry. Emits one tagged velocity
/// fragment per cycle.
pub struct PipelineReader {
    current: Option<Transit>,
    queue: VecDeque<Transit>,

    pub i: InPort,
    pub almost_done: InPort,
    pub o: OutPort,
    pub done: OutPort,
}

impl PipelineReader {
    pub fn insert(
        fab: &mut Fabric,
        bank: usize,
        pidx: usize,
    ) -> Rc<RefCell<PipelineReader>> {
        let u = fab.declare(format!("pipeline-reader-{bank}-{pidx}"));
        let i = fab.input(u, "i");
        let almost_done = fab.input(u, "almost-done");
        let o = fab.output(u, "o");
        let done = fab.output(u, "done");
        fab.bind(u, 0, PipelineReader { current: None, queue: VecDeque::new(), i, almost_done, o, done })
    }
}

impl Logic for PipelineReader {
    fn compute(&mut self, io: &mut Io<'_>) {
        let almost_done = io.get(self.almost_done).truthy();

        if let Some((reference, neighbor)) = io.get(self.i).as_pair() {
            match &mut self.current {
                None => self.current = Some(reference),
                Some(cur) if cur.origin() != reference.origin() => {
                    self.queue.push_back(*cur);
                    self.current = Some(reference);
                }
                Some(cur) => cur.v += reference.v,
            }
            self.queue.push_back(neighbor);
        }

        // flush after absorbing this cycle's input: a fragment landing on
        // the same cycle the drain condition asserts still coalesces
        if almost_done {
            if let Some(current) = self.current.take() {
                self.queue.push_back(current);
            }
        }

        io.set(self.done, Value::bit(self.queue.is_empty() && almost_done));
        match self.queue.pop_front() {
            Some(fragment) => io.set(self.o, Value::tagged(fragment)),
            None => io.set(self.o, Value::Null),
        }
    }
}

/// The full per-slot chain, wired.
pub struct ComputePipeline {
    pub reference: RegisterHandle,
    pub filters: Vec<Rc<RefCell<ParticleFilter>>>,
    /// Neighbor input of each filter, fed by the position reader.
    pub neighbor_inputs: Vec<InPort>,
    /// Fragment stream consumed by the velocity scoreboard.
    pub o: OutPort,
    /// True once this pipeline has flushed everything for the phase.
    pub done: OutPort,
}

impl ComputePipeline {
    /// `controller_done_delayed` is the stream-done signal pushed through a
    /// delay matching the filter+force pipeline depth: the end-of-phase
    /// flush then sits at a constant offset from the data path, which is
    /// what keeps trajectories bit-identical across pipeline depths.
    pub fn build(
        fab: &mut Fabric,
        cfg: &SimConfig,
        expect: &Rc<RefCell<ExpectSets>>,
        controller_done: OutPort,
        controller_done_delayed: OutPort,
        bank: usize,
        pidx: usize,
    ) -> ComputePipeline {
        let reference = fab.add_register(format!("reference-{bank}-{pidx}"));

        let filters: Vec<_> = (0..N_FILTER)
            .map(|f| ParticleFilter::insert(fab, cfg, expect.clone(), bank, pidx, f))
            .collect();
        let mut neighbor_inputs = Vec::with_capacity(N_FILTER);
        for filter in &filters {
            let (r_in, n_in) = {
                let f = filter.borrow();
                (f.reference, f.neighbor)
            };
            fab.connect(reference.o, r_in);
            neighbor_inputs.push(n_in);
        }

        let filters_empty =
            AndGate::insert(fab, format!("filters-empty-{bank}-{pidx}"), N_FILTER);
        for (filter, gate_in) in filters.iter().zip(filters_empty.borrow().i.clone()) {
            let e = fab.empty_port(filter.borrow().unit);
            fab.connect(e, gate_in);
        }

        let pair_queue = PairQueue::insert(fab, bank, pidx);
        for (filter, queue_in) in filters.iter().zip(pair_queue.borrow().i.clone()) {
            let o = filter.borrow().o;
            fab.connect(o, queue_in);
        }

        let force = ForcePipeline::insert(fab, cfg, expect.clone(), bank, pidx);
        {
            let (qo, fi) = (pair_queue.borrow().o, force.borrow().i);
            fab.connect(qo, fi);
        }

        let almost_done = AndGate::insert(fab, format!("almost-done-{bank}-{pidx}"), 5);
        {
            let gate = almost_done.borrow();
            fab.connect(controller_done, gate.i[0]);
            fab.connect(controller_done_delayed, gate.i[1]);
            let fe = filters_empty.borrow().o;
            fab.connect(fe, gate.i[2]);
            let qe = pair_queue.borrow().qempty;
            fab.connect(qe, gate.i[3]);
            let pe = fab.empty_port(force.borrow().unit);
            fab.connect(pe, gate.i[4]);
        }

        let reader = PipelineReader::insert(fab, bank, pidx);
        let (o, done) = {
            let r = reader.borrow();
            fab.connect(force.borrow().o, r.i);
            fab.connect(almost_done.borrow().o, r.almost_done);
            (r.o, r.done)
        };

        ComputePipeline { reference, filters, neighbor_inputs, o, done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::Vec3;

    /// Emits a scripted sequence, then idles on a constant.
    struct Feed {
        o: OutPort,
        seq: VecDeque<Value>,
        idle: Value,
    }

    impl Logic for Feed {
        fn compute(&mut self, io: &mut Io<'_>) {
            let v = self.seq.pop_front().unwrap_or(self.idle);
            io.set(self.o, v);
        }
    }

    fn feed(fab: &mut Fabric, name: &str, seq: Vec<Value>, idle: Value) -> OutPort {
        let u = fab.declare(name);
        let o = fab.output(u, "o");
        fab.bind(u, 0, Feed { o, seq: seq.into(), idle });
        o
    }

    fn cfg() -> SimConfig {
        SimConfig {
            sigma: 1.0,
            epsilon: 1.0,
            universe_size: 3,
            filter_pipeline_stages: 0,
            force_pipeline_stages: 0,
            verify: false,
            ..Default::default()
        }
    }

    fn filter_verdict(reference: Value, neighbor: Value) -> Value {
        let cfg = cfg();
        let mut fab = Fabric::new();
        let expect = Rc::new(RefCell::new(ExpectSets::new(&cfg)));
        let r = feed(&mut fab, "ref", vec![reference], Value::Null);
        let n = feed(&mut fab, "nbr", vec![neighbor], Value::Null);
        let filter = ParticleFilter::insert(&mut fab, &cfg, expect, 0, 0, 0);
        let (ri, ni, o) = {
            let f = filter.borrow();
            (f.reference, f.neighbor, f.o)
        };
        fab.connect(r, ri);
        fab.connect(n, ni);
        let sink = fab.add_register("sink");
        fab.connect(o, sink.i);
        fab.finalize().unwrap();
        fab.clock();
        sink.stored()
    }

    fn pos(cell: usize, addr: usize, x: f64, y: f64, z: f64) -> Value {
        Value::tagged(Transit::position(cell, addr, Vec3::new(x, y, z)))
    }

    #[test]
    fn filter_admits_in_range_intercell_pair() {
        let v = filter_verdict(pos(0, 0, 1.0, 1.0, 1.0), pos(1, 0, 3.0, 1.0, 1.0));
        let (a, b) = v.as_pair().expect("pair admitted");
        assert_eq!(a.origin(), (0, 0));
        assert_eq!(b.origin(), (1, 0));
    }

    #[test]
    fn filter_drops_beyond_cutoff() {
        let v = filter_verdict(pos(0, 0, 1.0, 1.0, 1.0), pos(1, 0, 3.6, 1.0, 1.0));
        assert!(v.is_null());
    }

    #[test]
    fn filter_drops_self() {
        let v = filter_verdict(pos(0, 3, 1.0, 1.0, 1.0), pos(0, 3, 1.0, 1.0, 1.0));
        assert!(v.is_null());
    }

    #[test]
    fn filter_keeps_one_ordering_within_a_cell() {
        let fwd = filter_verdict(pos(0, 0, 1.0, 1.0, 1.0), pos(0, 1, 1.4, 1.0, 1.0));
        let rev = filter_verdict(pos(0, 1, 1.4, 1.0, 1.0), pos(0, 0, 1.0, 1.0, 1.0));
        assert_ne!(fwd.is_null(), rev.is_null());
    }

    #[test]
    #[should_panic(expected = "share a position")]
    fn coincident_particles_in_distinct_cells_abort() {
        // same coordinates, different origin cells: the distance check must
        // trip before the cutoff comparison
        filter_verdict(pos(0, 0, 2.5, 1.0, 1.0), pos(1, 0, 2.5, 1.0, 1.0));
    }

    #[test]
    fn reader_coalesces_reference_fragments() {
        let mut fab = Fabric::new();
        let frag = |cell: usize, addr: usize, x: f64| Transit::velocity(cell, addr, Vec3::new(x, 0.0, 0.0));
        let pairs = vec![
            Value::pair(frag(0, 0, 1.0), frag(1, 0, -1.0)),
            Value::pair(frag(0, 0, 2.0), frag(2, 0, -2.0)),
        ];
        let i = feed(&mut fab, "force-out", pairs, Value::Null);
        let almost = feed(
            &mut fab,
            "almost",
            vec![Value::bit(false), Value::bit(false)],
            Value::bit(true),
        );
        let reader = PipelineReader::insert(&mut fab, 0, 0);
        let (ri, ra, ro, rd) = {
            let r = reader.borrow();
            (r.i, r.almost_done, r.o, r.done)
        };
        fab.connect(i, ri);
        fab.connect(almost, ra);
        let sink = fab.add_register("sink");
        fab.connect(ro, sink.i);
        let done = fab.add_register("done");
        fab.connect(rd, done.i);
        fab.finalize().unwrap();

        // the two neighbor fragments pass through first
        fab.clock();
        assert_eq!(sink.stored().as_tagged().unwrap().origin(), (1, 0));
        fab.clock();
        assert_eq!(sink.stored().as_tagged().unwrap().origin(), (2, 0));
        // then the flushed reference carries both impulses summed
        fab.clock();
        let flushed = sink.stored().as_tagged().unwrap();
        assert_eq!(flushed.origin(), (0, 0));
        assert_eq!(flushed.v.x, 3.0);
        assert!(!done.stored().truthy());
        fab.clock();
        assert!(done.stored().truthy());
    }
}
