//! A tiny synchronous-circuit runtime: logic blocks, registers and block
//! RAMs connected by typed wires, clocked one rising edge at a time.
//!
//! One [`Fabric::clock`] call is one cycle. Within a cycle every unit's
//! outputs are produced exactly once, on demand: reading an input forces the
//! producing unit to run first. Feedback must pass through a [`Register`] or
//! a BRAM write port; a combinational loop is reported as a fatal diagnostic
//! the moment evaluation re-enters a busy unit.
//!
//! Side effects are deferred: register and BRAM writes made in cycle `k`
//! become readable in cycle `k+1`, applied in unit registration order.

mod signal;

pub use signal::{BramData, Quantity, Transit, Value, Word};

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use thiserror::Error;

/// A combinational block. `compute` must drive every declared output exactly
/// once per cycle (the implicit `empty` output is maintained by the runtime).
pub trait Logic {
    fn compute(&mut self, io: &mut Io<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitId(usize);

/// Handle to one input port of one unit.
#[derive(Debug, Clone, Copy)]
pub struct InPort {
    unit: usize,
    slot: usize,
}

/// Handle to one output port of one unit.
#[derive(Debug, Clone, Copy)]
pub struct OutPort {
    unit: usize,
    slot: usize,
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("inputs not connected: {0}")]
    DanglingInputs(String),
    #[error("unit name `{0}` is not unique")]
    DuplicateName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalState {
    Idle,
    Busy,
    Done,
}

struct InputMeta {
    name: String,
    src: Cell<Option<OutPort>>,
}

struct OutputMeta {
    name: String,
    staged: Cell<Option<Value>>,
    current: Cell<Option<Value>>,
}

enum UnitKind {
    /// Declared, ports allocated, block not yet bound.
    Pending,
    Logic {
        block: Rc<RefCell<dyn Logic>>,
        fifo: RefCell<VecDeque<Vec<Value>>>,
        inflight: Cell<usize>,
        /// Output slot of the implicit `empty` flag; also the count of
        /// explicit outputs routed through the pipeline.
        empty_slot: usize,
    },
    Register {
        contents: Rc<Cell<Value>>,
    },
    Bram {
        data: BramData,
    },
}

struct Unit {
    name: String,
    kind: UnitKind,
    inputs: Vec<InputMeta>,
    outputs: Vec<OutputMeta>,
    state: Cell<EvalState>,
}

const REG_I: usize = 0;
const BRAM_I: usize = 0;
const BRAM_IADDR: usize = 1;
const BRAM_OADDR: usize = 2;

/// Port handles of a [`Fabric::add_register`] register. The shared contents
/// handle lets tests and loaders observe or preset the stored value between
/// cycles.
#[derive(Clone)]
pub struct RegisterHandle {
    pub i: InPort,
    pub o: OutPort,
    contents: Rc<Cell<Value>>,
}

impl RegisterHandle {
    pub fn stored(&self) -> Value {
        self.contents.get()
    }

    pub fn preset(&self, v: Value) {
        self.contents.set(v);
    }
}

/// Port handles and backing store of a [`Fabric::add_bram`] block RAM.
#[derive(Clone)]
pub struct BramHandle {
    pub i: InPort,
    pub iaddr: InPort,
    pub oaddr: InPort,
    pub o: OutPort,
    pub data: BramData,
}

/// The clocked graph: owns every unit and evaluates one cycle per call.
#[derive(Default)]
pub struct Fabric {
    units: Vec<Unit>,
    cycles: u64,
    finalized: bool,
}

/// Per-cycle port access handed to [`Logic::compute`].
pub struct Io<'f> {
    fab: &'f Fabric,
    unit: usize,
}

impl Io<'_> {
    /// Read an input, forcing the producing unit to run if it has not yet
    /// run this cycle.
    pub fn get(&mut self, p: InPort) -> Value {
        assert_eq!(p.unit, self.unit, "a block may only read its own inputs");
        self.fab.read_in(p)
    }

    /// Drive an output. Driving the same output twice in one cycle is fatal.
    pub fn set(&mut self, p: OutPort, v: Value) {
        assert_eq!(p.unit, self.unit, "a block may only drive its own outputs");
        let out = &self.fab.units[p.unit].outputs[p.slot];
        if out.staged.replace(Some(v)).is_some() {
            panic!(
                "output `{}/{}` is driven twice in one cycle",
                self.fab.units[p.unit].name, out.name
            );
        }
    }
}

impl Fabric {
    pub fn new() -> Self {
        Fabric::default()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Declare a logic unit. Ports are allocated against the returned id,
    /// then the block is attached with [`Fabric::bind`].
    pub fn declare(&mut self, name: impl Into<String>) -> UnitId {
        self.units.push(Unit {
            name: name.into(),
            kind: UnitKind::Pending,
            inputs: Vec::new(),
            outputs: Vec::new(),
            state: Cell::new(EvalState::Idle),
        });
        UnitId(self.units.len() - 1)
    }

    pub fn input(&mut self, u: UnitId, name: impl Into<String>) -> InPort {
        let unit = &mut self.units[u.0];
        assert!(
            matches!(unit.kind, UnitKind::Pending),
            "ports must be allocated before binding `{}`",
            unit.name
        );
        unit.inputs.push(InputMeta { name: name.into(), src: Cell::new(None) });
        InPort { unit: u.0, slot: unit.inputs.len() - 1 }
    }

    pub fn output(&mut self, u: UnitId, name: impl Into<String>) -> OutPort {
        let unit = &mut self.units[u.0];
        assert!(
            matches!(unit.kind, UnitKind::Pending),
            "ports must be allocated before binding `{}`",
            unit.name
        );
        unit.outputs.push(OutputMeta {
            name: name.into(),
            staged: Cell::new(None),
            current: Cell::new(None),
        });
        OutPort { unit: u.0, slot: unit.outputs.len() - 1 }
    }

    /// Attach the block to a declared unit, giving its outputs a pipeline of
    /// `depth` stages. Values produced by `compute` emerge `depth` cycles
    /// later; the implicit `empty` output is true iff no non-`Null` row is
    /// in flight.
    pub fn bind<B: Logic + 'static>(&mut self, u: UnitId, depth: usize, block: B) -> Rc<RefCell<B>> {
        let rc = Rc::new(RefCell::new(block));
        let unit = &mut self.units[u.0];
        assert!(matches!(unit.kind, UnitKind::Pending), "unit `{}` bound twice", unit.name);
        let empty_slot = unit.outputs.len();
        unit.outputs.push(OutputMeta {
            name: "empty".into(),
            staged: Cell::new(None),
            current: Cell::new(None),
        });
        let fifo = (0..depth).map(|_| vec![Value::Null; empty_slot]).collect();
        unit.kind = UnitKind::Logic {
            block: rc.clone(),
            fifo: RefCell::new(fifo),
            inflight: Cell::new(0),
            empty_slot,
        };
        rc
    }

    /// The implicit `empty` output of a bound logic unit.
    pub fn empty_port(&self, u: UnitId) -> OutPort {
        match &self.units[u.0].kind {
            UnitKind::Logic { empty_slot, .. } => OutPort { unit: u.0, slot: *empty_slot },
            _ => panic!("unit `{}` has no empty flag", self.units[u.0].name),
        }
    }

    /// An edge-triggered one-slot memory. `Null` on `i` holds the contents,
    /// `Reset` clears them; `o` presents the previously stored value, which
    /// is what makes registers legal feedback points.
    pub fn add_register(&mut self, name: impl Into<String>) -> RegisterHandle {
        let u = self.declare(name);
        let i = self.input(u, "i");
        let o = self.output(u, "o");
        let contents = Rc::new(Cell::new(Value::Null));
        self.units[u.0].kind = UnitKind::Register { contents: contents.clone() };
        RegisterHandle { i, o, contents }
    }

    /// An indexed memory with a combinational read port and an
    /// edge-triggered write port.
    pub fn add_bram(&mut self, name: impl Into<String>, size: usize) -> BramHandle {
        let u = self.declare(name);
        let i = self.input(u, "i");
        let iaddr = self.input(u, "iaddr");
        let oaddr = self.input(u, "oaddr");
        let o = self.output(u, "o");
        let data = BramData::new(size);
        self.units[u.0].kind = UnitKind::Bram { data: data.clone() };
        BramHandle { i, iaddr, oaddr, o, data }
    }

    /// Link a producer to a consumer. Every input has exactly one producer;
    /// an output may fan out to any number of inputs.
    pub fn connect(&mut self, o: OutPort, i: InPort) {
        let meta = &self.units[i.unit].inputs[i.slot];
        if let Some(prev) = meta.src.get() {
            panic!(
                "input `{}/{}` is already driven by `{}/{}`",
                self.units[i.unit].name,
                meta.name,
                self.units[prev.unit].name,
                self.units[prev.unit].outputs[prev.slot].name
            );
        }
        meta.src.set(Some(o));
    }

    /// Validate the wiring. Dangling inputs and duplicate unit names are
    /// construction bugs and refuse to clock.
    pub fn finalize(&mut self) -> Result<(), FabricError> {
        let mut names = HashSet::new();
        for unit in &self.units {
            if !names.insert(unit.name.as_str()) {
                return Err(FabricError::DuplicateName(unit.name.clone()));
            }
        }
        let mut dangling = Vec::new();
        for unit in &self.units {
            if matches!(unit.kind, UnitKind::Pending) {
                return Err(FabricError::DanglingInputs(format!(
                    "unit `{}` was declared but never bound",
                    unit.name
                )));
            }
            for input in &unit.inputs {
                if input.src.get().is_none() {
                    dangling.push(format!("{}/{}", unit.name, input.name));
                }
            }
        }
        if !dangling.is_empty() {
            return Err(FabricError::DanglingInputs(dangling.join(", ")));
        }
        self.finalized = true;
        Ok(())
    }

    /// One rising edge: evaluate every unit, apply edge-triggered writes in
    /// registration order, clear per-cycle state.
    pub fn clock(&mut self) {
        assert!(self.finalized, "fabric must be finalized before clocking");
        for u in 0..self.units.len() {
            self.ensure_eval(u);
        }
        for u in 0..self.units.len() {
            match &self.units[u].kind {
                UnitKind::Register { contents } => {
                    let v = self.read_in(InPort { unit: u, slot: REG_I });
                    match v {
                        Value::Null => {}
                        Value::Reset => contents.set(Value::Null),
                        v => contents.set(v),
                    }
                }
                UnitKind::Bram { data } => {
                    let v = self.read_in(InPort { unit: u, slot: BRAM_I });
                    let a = self.read_in(InPort { unit: u, slot: BRAM_IADDR });
                    if !v.is_null() && !a.is_null() {
                        let a = a.as_addr().unwrap_or_else(|| {
                            panic!("bram `{}` iaddr carries {a}", self.units[u].name)
                        });
                        let stored = if v == Value::Reset { Value::Null } else { v };
                        if a >= data.len() {
                            panic!("bram `{}` write address {a} out of range", self.units[u].name);
                        }
                        data.set(a, stored);
                    }
                }
                _ => {}
            }
        }
        for unit in &self.units {
            unit.state.set(EvalState::Idle);
            for out in &unit.outputs {
                out.staged.set(None);
                out.current.set(None);
            }
        }
        self.cycles += 1;
    }

    fn read_in(&self, p: InPort) -> Value {
        let meta = &self.units[p.unit].inputs[p.slot];
        let src = meta.src.get().unwrap_or_else(|| {
            panic!("input `{}/{}` read while unconnected", self.units[p.unit].name, meta.name)
        });
        self.read_out(src)
    }

    fn read_out(&self, p: OutPort) -> Value {
        self.ensure_eval(p.unit);
        let out = &self.units[p.unit].outputs[p.slot];
        let v = out.current.get().unwrap_or_else(|| {
            panic!("output `{}/{}` was never driven", self.units[p.unit].name, out.name)
        });
        v
    }

    fn ensure_eval(&self, u: usize) {
        let unit = &self.units[u];
        match unit.state.get() {
            EvalState::Done => return,
            EvalState::Busy => {
                panic!("combinational cycle detected through unit `{}`", unit.name)
            }
            EvalState::Idle => {}
        }
        unit.state.set(EvalState::Busy);
        match &unit.kind {
            UnitKind::Pending => panic!("unit `{}` was declared but never bound", unit.name),
            UnitKind::Register { contents } => {
                unit.outputs[0].current.set(Some(contents.get()));
            }
            UnitKind::Bram { data } => {
                let oaddr = self.read_in(InPort { unit: u, slot: BRAM_OADDR });
                let v = match oaddr {
                    Value::Null => Value::Null,
                    a => {
                        let a = a.as_addr().unwrap_or_else(|| {
                            panic!("bram `{}` oaddr carries {a}", unit.name)
                        });
                        if a >= data.len() {
                            panic!("bram `{}` read address {a} out of range", unit.name);
                        }
                        data.get(a)
                    }
                };
                unit.outputs[0].current.set(Some(v));
            }
            UnitKind::Logic { block, fifo, inflight, empty_slot } => {
                let block = Rc::clone(block);
                let mut io = Io { fab: self, unit: u };
                block.borrow_mut().compute(&mut io);

                let unit = &self.units[u];
                let mut row = Vec::with_capacity(*empty_slot);
                for slot in 0..*empty_slot {
                    let out = &unit.outputs[slot];
                    let v = out.staged.take().unwrap_or_else(|| {
                        panic!("unit `{}` did not drive output `{}`", unit.name, out.name)
                    });
                    row.push(v);
                }
                let mut fifo = fifo.borrow_mut();
                if row.iter().any(|v| !v.is_null()) {
                    inflight.set(inflight.get() + 1);
                }
                fifo.push_back(row);
                let head = fifo.pop_front().expect("pipeline row");
                if head.iter().any(|v| !v.is_null()) {
                    inflight.set(inflight.get() - 1);
                }
                for (slot, v) in head.into_iter().enumerate() {
                    unit.outputs[slot].current.set(Some(v));
                }
                unit.outputs[*empty_slot].current.set(Some(Value::bit(inflight.get() == 0)));
            }
        }
        self.units[u].state.set(EvalState::Done);
    }
}

/// Drives `Null` every cycle.
pub struct NullConst {
    pub o: OutPort,
}

impl NullConst {
    pub fn insert(fab: &mut Fabric, name: impl Into<String>) -> Rc<RefCell<NullConst>> {
        let u = fab.declare(name);
        let o = fab.output(u, "o");
        fab.bind(u, 0, NullConst { o })
    }
}

impl Logic for NullConst {
    fn compute(&mut self, io: &mut Io<'_>) {
        io.set(self.o, Value::Null);
    }
}

/// Drives `Reset` every cycle.
pub struct ResetConst {
    pub o: OutPort,
}

impl ResetConst {
    pub fn insert(fab: &mut Fabric, name: impl Into<String>) -> Rc<RefCell<ResetConst>> {
        let u = fab.declare(name);
        let o = fab.output(u, "o");
        fab.bind(u, 0, ResetConst { o })
    }
}

impl Logic for ResetConst {
    fn compute(&mut self, io: &mut Io<'_>) {
        io.set(self.o, Value::Reset);
    }
}

/// A pure wire delay: `o` replays `i` exactly `depth` cycles later. Used to
/// match a control signal's latency to a data path it travels beside.
pub struct Delay {
    pub i: InPort,
    pub o: OutPort,
}

impl Delay {
    pub fn insert(fab: &mut Fabric, name: impl Into<String>, depth: usize) -> Rc<RefCell<Delay>> {
        let u = fab.declare(name);
        let i = fab.input(u, "i");
        let o = fab.output(u, "o");
        fab.bind(u, depth, Delay { i, o })
    }
}

impl Logic for Delay {
    fn compute(&mut self, io: &mut Io<'_>) {
        let v = io.get(self.i);
        io.set(self.o, v);
    }
}

/// `o` is true iff every input carries `Bit(true)` this cycle; `Null` counts
/// as false, so an idle upstream never satisfies the gate.
pub struct AndGate {
    pub i: Vec<InPort>,
    pub o: OutPort,
}

impl AndGate {
    pub fn insert(fab: &mut Fabric, name: impl Into<String>, n: usize) -> Rc<RefCell<AndGate>> {
        let u = fab.declare(name);
        let i = (0..n).map(|k| fab.input(u, format!("i{k}"))).collect();
        let o = fab.output(u, "o");
        fab.bind(u, 0, AndGate { i, o })
    }
}

impl Logic for AndGate {
    fn compute(&mut self, io: &mut Io<'_>) {
        let mut all = true;
        for p in self.i.clone() {
            all &= io.get(p).truthy();
        }
        io.set(self.o, Value::bit(all));
    }
}
