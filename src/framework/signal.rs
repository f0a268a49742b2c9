//! The wire alphabet: every port carries exactly one [`Value`] per cycle.
//!
//! `Null` means "no data this cycle" and must never be conflated with a
//! numeric zero; `Reset` is the write sentinel that clears a storage slot.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::universe::Vec3;

/// Which physical quantity a transiting particle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Position,
    Velocity,
    Acceleration,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Position => write!(f, "r"),
            Quantity::Velocity => write!(f, "v"),
            Quantity::Acceleration => write!(f, "a"),
        }
    }
}

/// A particle datum in flight through a pipeline, wrapped with its origin.
///
/// Transits exist only between units; caches store raw vectors, and the
/// origin of a cached value is implicit in its address. Two transits are
/// equal when their quantity and origin agree; the payload does not
/// participate.
#[derive(Debug, Clone, Copy)]
pub struct Transit {
    pub kind: Quantity,
    pub cell: usize,
    pub addr: usize,
    pub v: Vec3,
}

impl Transit {
    pub fn position(cell: usize, addr: usize, r: Vec3) -> Self {
        Transit { kind: Quantity::Position, cell, addr, v: r }
    }

    pub fn velocity(cell: usize, addr: usize, v: Vec3) -> Self {
        Transit { kind: Quantity::Velocity, cell, addr, v }
    }

    pub fn acceleration(cell: usize, addr: usize, a: Vec3) -> Self {
        Transit { kind: Quantity::Acceleration, cell, addr, v: a }
    }

    pub fn origin(&self) -> (usize, usize) {
        (self.cell, self.addr)
    }
}

impl PartialEq for Transit {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.cell == other.cell && self.addr == other.addr
    }
}

impl fmt::Display for Transit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({}, {}) = {}", self.kind, self.cell, self.addr, self.v)
    }
}

/// A payload word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    Bit(bool),
    Addr(usize),
    Vec3(Vec3),
    Tagged(Transit),
    Pair(Transit, Transit),
}

/// What a wire carries on one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    /// No data this cycle (a bubble).
    #[default]
    Null,
    /// Write sentinel: clear the addressed storage slot.
    Reset,
    Word(Word),
}

impl Value {
    pub fn bit(b: bool) -> Value {
        Value::Word(Word::Bit(b))
    }

    pub fn addr(a: usize) -> Value {
        Value::Word(Word::Addr(a))
    }

    pub fn vec3(v: Vec3) -> Value {
        Value::Word(Word::Vec3(v))
    }

    pub fn tagged(t: Transit) -> Value {
        Value::Word(Word::Tagged(t))
    }

    pub fn pair(a: Transit, b: Transit) -> Value {
        Value::Word(Word::Pair(a, b))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `Bit(true)` only; `Null` and `Reset` are never truthy.
    pub fn truthy(&self) -> bool {
        matches!(self, Value::Word(Word::Bit(true)))
    }

    pub fn as_bit(&self) -> Option<bool> {
        match self {
            Value::Word(Word::Bit(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_addr(&self) -> Option<usize> {
        match self {
            Value::Word(Word::Addr(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Word(Word::Vec3(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tagged(&self) -> Option<Transit> {
        match self {
            Value::Word(Word::Tagged(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(Transit, Transit)> {
        match self {
            Value::Word(Word::Pair(a, b)) => Some((*a, *b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Reset => write!(f, "RESET"),
            Value::Word(Word::Bit(b)) => write!(f, "{b}"),
            Value::Word(Word::Addr(a)) => write!(f, "{a}"),
            Value::Word(Word::Vec3(v)) => write!(f, "{v}"),
            Value::Word(Word::Tagged(t)) => write!(f, "{t}"),
            Value::Word(Word::Pair(a, b)) => write!(f, "({a}; {b})"),
        }
    }
}

/// Shared handle to a cache's backing store.
///
/// The cache itself reads and writes through its ports; the verifier and the
/// record writer scan the same storage out-of-band between cycles.
#[derive(Clone)]
pub struct BramData(Rc<RefCell<Vec<Value>>>);

impl BramData {
    pub fn new(size: usize) -> Self {
        BramData(Rc::new(RefCell::new(vec![Value::Null; size])))
    }

    pub fn read(&self) -> Ref<'_, Vec<Value>> {
        self.0.borrow()
    }

    pub fn write(&self) -> RefMut<'_, Vec<Value>> {
        self.0.borrow_mut()
    }

    pub fn get(&self, addr: usize) -> Value {
        self.0.borrow()[addr]
    }

    pub fn set(&self, addr: usize, v: Value) {
        self.0.borrow_mut()[addr] = v;
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
