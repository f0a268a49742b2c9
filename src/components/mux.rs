//! Phase multiplexing for the cell caches.
//!
//! Every cache port is shared between the two phases of a timestep. The mux
//! routes whichever phase currently holds its `ready` line; with no phase
//! ready it drives `Null`, and two phases ready at once is a control bug.

use std::cell::RefCell;
use std::rc::Rc;

use crate::framework::{Fabric, InPort, Io, Logic, OutPort, Value};

pub struct CacheMux {
    name: String,
    /// One `ready` line per phase.
    pub ready: Vec<InPort>,
    /// Per phase, one line per routed port (`i`/`iaddr` or `oaddr`).
    pub lines: Vec<Vec<InPort>>,
    /// One output per routed port.
    pub o: Vec<OutPort>,
}

impl CacheMux {
    pub fn insert(
        fab: &mut Fabric,
        name: impl Into<String>,
        phases: &[&str],
        ports: &[&str],
    ) -> Rc<RefCell<CacheMux>> {
        let name = name.into();
        let u = fab.declare(name.clone());
        let mut ready = Vec::new();
        let mut lines = Vec::new();
        for phase in phases {
            ready.push(fab.input(u, format!("{phase}-ready")));
            lines.push(ports.iter().map(|p| fab.input(u, format!("{p}-{phase}"))).collect());
        }
        let o = ports.iter().map(|p| fab.output(u, p.to_string())).collect();
        fab.bind(u, 0, CacheMux { name, ready, lines, o })
    }
}

impl Logic for CacheMux {
    fn compute(&mut self, io: &mut Io<'_>) {
        let mut selected = None;
        for (phase, ready) in self.ready.iter().enumerate() {
            if io.get(*ready).truthy() {
                if let Some(prev) = selected {
                    panic!("cache mux `{}`: phases {prev} and {phase} ready at once", self.name);
                }
                selected = Some(phase);
            }
        }
        match selected {
            Some(phase) => {
                for (line, out) in self.lines[phase].clone().into_iter().zip(self.o.clone()) {
                    let v = io.get(line);
                    io.set(out, v);
                }
            }
            None => {
                for out in self.o.clone() {
                    io.set(out, Value::Null);
                }
            }
        }
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

    fn constant(fab: &mut Fabric, name: &str, v: Value) -> OutPort {
        let u = fab.declare(name);
        let o = fab.output(u, "o");
        fab.bind(u, 0, Const { o, v });
        o
    }

    #[test]
    fn routes_only_the_ready_phase() {
        let mut fab = Fabric::new();
        let ready_a = constant(&mut fab, "ready-a", Value::bit(false));
        let ready_b = constant(&mut fab, "ready-b", Value::bit(true));
        let line_a = constant(&mut fab, "line-a", Value::addr(1));
        let line_b = constant(&mut fab, "line-b", Value::addr(2));

        let mux = CacheMux::insert(&mut fab, "mux", &["a", "b"], &["oaddr"]);
        let (ra, rb, la, lb, out) = {
            let m = mux.borrow();
            (m.ready[0], m.ready[1], m.lines[0][0], m.lines[1][0], m.o[0])
        };
        fab.connect(ready_a, ra);
        fab.connect(ready_b, rb);
        fab.connect(line_a, la);
        fab.connect(line_b, lb);
        let sink = fab.add_register("sink");
        fab.connect(out, sink.i);
        fab.finalize().unwrap();
        fab.clock();
        // phase b owns the cycle
        assert_eq!(sink.stored(), Value::addr(2));
    }

    #[test]
    fn idle_mux_drives_null() {
        let mut fab = Fabric::new();
        let ready_a = constant(&mut fab, "ready-a", Value::Null);
        let line_a = constant(&mut fab, "line-a", Value::addr(1));
        let mux = CacheMux::insert(&mut fab, "mux", &["a"], &["oaddr"]);
        let (ra, la, out) = {
            let m = mux.borrow();
            (m.ready[0], m.lines[0][0], m.o[0])
        };
        fab.connect(ready_a, ra);
        fab.connect(line_a, la);
        let sink = fab.add_register("sink");
        sink.preset(Value::addr(9));
        fab.connect(out, sink.i);
        fab.finalize().unwrap();
        fab.clock();
        // Null from the mux holds the register
        assert_eq!(sink.stored(), Value::addr(9));
    }
}
