//! Builds the full accelerator fabric, loads the initial particle set and
//! clocks the graph until the requested number of timesteps has completed.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::components::{
    CacheMux, ComputePipeline, ControlUnit, PositionReadController, PositionReader,
    PositionUpdateController, PositionUpdater, VelocityIntegrateController, VelocityIntegrator,
    VelocityUpdateController, VelocityUpdater,
};
use crate::config::{ConfigError, SimConfig, BSIZE, DBSIZE};
use crate::framework::{
    AndGate, BramData, BramHandle, Delay, Fabric, NullConst, ResetConst, Value,
};
use crate::record;
use crate::universe::{cell_from_position, Vec3};
use crate::verify::Verifier;

/// What a finished run reports.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub timesteps: usize,
    pub cycles_total: u64,
}

struct CacheArray {
    caches: Vec<BramHandle>,
    imux: Vec<Rc<RefCell<CacheMux>>>,
    omux: Vec<Rc<RefCell<CacheMux>>>,
}

pub struct Emulator {
    cfg: SimConfig,
    fabric: Fabric,
    control: Rc<RefCell<ControlUnit>>,
    p_data: Vec<BramData>,
    v_data: Vec<BramData>,
    records_dir: Option<PathBuf>,
    records_written: usize,
}

impl Emulator {
    /// Build the fabric and seed `n_particle` particles from the configured
    /// seed: positions uniform in the box, velocities `ε·(u - ½)` per axis.
    pub fn new(cfg: SimConfig) -> Result<Emulator> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let l = cfg.box_len();
        let epsilon = cfg.epsilon;
        let particles: Vec<(Vec3, Vec3)> = (0..cfg.n_particle)
            .map(|_| {
                let r = Vec3::new(rng.gen::<f64>() * l, rng.gen::<f64>() * l, rng.gen::<f64>() * l);
                let v = Vec3::new(
                    epsilon * (rng.gen::<f64>() - 0.5),
                    epsilon * (rng.gen::<f64>() - 0.5),
                    epsilon * (rng.gen::<f64>() - 0.5),
                );
                (r, v)
            })
            .collect();
        Emulator::with_particles(cfg, &particles)
    }

    /// Build the fabric around an explicit particle set; `n_particle` is
    /// taken from the slice.
    pub fn with_particles(cfg: SimConfig, particles: &[(Vec3, Vec3)]) -> Result<Emulator> {
        let cfg = SimConfig { n_particle: particles.len(), ..cfg };
        cfg.validate()?;
        let mut emu = Emulator::build(cfg)?;
        emu.load(particles)?;
        emu.control.borrow_mut().start();
        Ok(emu)
    }

    /// Snapshot records are written under `dir`, one file per timestep.
    pub fn with_records(mut self, dir: impl Into<PathBuf>) -> Result<Emulator> {
        let dir = dir.into();
        record::clear_records(&dir)
            .with_context(|| format!("could not prepare record directory `{}`", dir.display()))?;
        self.records_dir = Some(dir);
        Ok(self)
    }

    fn build(cfg: SimConfig) -> Result<Emulator> {
        let n_cell = cfg.n_cell();
        let n_pipelines = cfg.n_cpar * cfg.n_ppar;
        let mut fab = Fabric::new();

        let split = cfg.split_velocity_update;

        // control state and its output registers; the done→ready feedback
        // crosses cycles through these
        let control = ControlUnit::insert(&mut fab, split);
        let p1_ready = fab.add_register("phase1-ready");
        let p2_ready = fab.add_register("phase2-ready");
        let p3_ready = fab.add_register("phase3-ready");
        let dbuf = fab.add_register("double-buffer");
        {
            let c = control.borrow();
            fab.connect(c.phase1_ready, p1_ready.i);
            fab.connect(c.phase2_ready, p2_ready.i);
            fab.connect(c.phase3_ready, p3_ready.i);
            fab.connect(c.double_buffer_o, dbuf.i);
        }

        let null_const = NullConst::insert(&mut fab, "null-const");
        let null_o = null_const.borrow().o;

        // position caches are written by phase 3 and read by phase 1. In the
        // direct mode the velocity caches are read-modified by phase 1 and
        // rewritten by phase 3; in the split mode force evaluation banks
        // accelerations into their own caches and the middle phase owns the
        // velocity side.
        let p_bank = Self::cache_array(&mut fab, "p", &["phase3", "phase1"], n_cell);
        let v_bank = if split {
            Self::cache_array(&mut fab, "v", &["phase2", "phase3"], n_cell)
        } else {
            Self::cache_array(&mut fab, "v", &["phase1", "phase3"], n_cell)
        };
        let a_bank =
            split.then(|| Self::cache_array(&mut fab, "a", &["phase1", "phase2"], n_cell));
        for mux in p_bank.imux.iter().chain(&p_bank.omux) {
            let m = mux.borrow();
            fab.connect(p3_ready.o, m.ready[0]);
            fab.connect(p1_ready.o, m.ready[1]);
        }
        let v_front_ready = if split { &p2_ready } else { &p1_ready };
        for mux in v_bank.imux.iter().chain(&v_bank.omux) {
            let m = mux.borrow();
            fab.connect(v_front_ready.o, m.ready[0]);
            fab.connect(p3_ready.o, m.ready[1]);
        }
        if let Some(a_bank) = &a_bank {
            for mux in a_bank.imux.iter().chain(&a_bank.omux) {
                let m = mux.borrow();
                fab.connect(p1_ready.o, m.ready[0]);
                fab.connect(p2_ready.o, m.ready[1]);
            }
        }

        let p_data: Vec<BramData> = p_bank.caches.iter().map(|c| c.data.clone()).collect();
        let v_data: Vec<BramData> = v_bank.caches.iter().map(|c| c.data.clone()).collect();
        let verifier = Rc::new(RefCell::new(Verifier::new(&cfg, p_data.clone(), v_data.clone())));
        let expect = verifier.borrow().expect.clone();

        // ---- phase 1: streaming front end ----
        let read_ctl = PositionReadController::insert(&mut fab, &cfg);
        let reader = PositionReader::insert(&mut fab, &cfg);
        let stale = fab.add_register("stale-reference");
        {
            let c = read_ctl.borrow();
            fab.connect(p1_ready.o, c.ready);
            fab.connect(dbuf.o, c.double_buffer);
            fab.connect(stale.o, c.stale_reference);
        }
        {
            let r = reader.borrow();
            let c = read_ctl.borrow();
            fab.connect(c.cell_r_o, r.cell_r);
            fab.connect(c.oaddr, r.addr);
            fab.connect(c.new_reference_o, r.new_reference);
            fab.connect(r.stale_reference, stale.i);
            for (cell, cache) in p_bank.caches.iter().enumerate() {
                fab.connect(cache.o, r.i[cell]);
            }
            // every position cache reads the streaming address in phase 1
            for mux in &p_bank.omux {
                fab.connect(c.oaddr, mux.borrow().lines[1][0]);
            }
            // phase 1 never writes positions
            for mux in &p_bank.imux {
                let m = mux.borrow();
                fab.connect(null_o, m.lines[1][0]);
                fab.connect(null_o, m.lines[1][1]);
            }
        }

        // ---- phase 1: compute pipelines ----
        let controller_done = read_ctl.borrow().done;
        let done_delay = Delay::insert(
            &mut fab,
            "stream-done-delay",
            cfg.filter_pipeline_stages + cfg.force_pipeline_stages,
        );
        let done_delayed = {
            let d = done_delay.borrow();
            fab.connect(controller_done, d.i);
            d.o
        };
        let mut pipelines = Vec::with_capacity(n_pipelines);
        for bank in 0..cfg.n_cpar {
            for pidx in 0..cfg.n_ppar {
                let cp = ComputePipeline::build(
                    &mut fab,
                    &cfg,
                    &expect,
                    controller_done,
                    done_delayed,
                    bank,
                    pidx,
                );
                {
                    let r = reader.borrow();
                    fab.connect(r.references[bank][pidx], cp.reference.i);
                    for (f, n_in) in cp.neighbor_inputs.iter().enumerate() {
                        fab.connect(r.o[bank][f], *n_in);
                    }
                }
                pipelines.push(cp);
            }
        }

        // ---- phase 1: fragment write-back ----
        // the scoreboard folds fragments into the velocity caches directly,
        // or into the acceleration caches when the update is split
        let acc_bank = a_bank.as_ref().unwrap_or(&v_bank);
        let scoreboard = VelocityUpdateController::insert(&mut fab, n_pipelines, n_cell);
        let v_updater = VelocityUpdater::insert(&mut fab, n_cell);
        {
            let s = scoreboard.borrow();
            for (cp, s_in) in pipelines.iter().zip(s.i.clone()) {
                fab.connect(cp.o, s_in);
            }
            let u = v_updater.borrow();
            for cell in 0..n_cell {
                fab.connect(s.o[cell], u.fragments[cell]);
                fab.connect(acc_bank.caches[cell].o, u.vi[cell]);
                let imux = acc_bank.imux[cell].borrow();
                fab.connect(u.vo[cell], imux.lines[0][0]);
                fab.connect(s.oaddr[cell], imux.lines[0][1]);
                let omux = acc_bank.omux[cell].borrow();
                fab.connect(s.oaddr[cell], omux.lines[0][0]);
            }
        }

        // ---- phase 2 (split mode): lock-step velocity integration ----
        let phase2_done = if let Some(a_bank) = &a_bank {
            let reset_const = ResetConst::insert(&mut fab, "reset-const");
            let reset_o = reset_const.borrow().o;
            let integ_ctl = VelocityIntegrateController::insert(&mut fab);
            let integrator = VelocityIntegrator::insert(&mut fab, n_cell, cfg.dt);
            let c = integ_ctl.borrow();
            fab.connect(p2_ready.o, c.ready);
            fab.connect(dbuf.o, c.double_buffer);
            let g = integrator.borrow();
            fab.connect(p2_ready.o, g.ready);
            for cell in 0..n_cell {
                fab.connect(a_bank.caches[cell].o, g.a_in[cell]);
                fab.connect(v_bank.caches[cell].o, g.v_in[cell]);
                let a_omux = a_bank.omux[cell].borrow();
                fab.connect(c.oaddr, a_omux.lines[1][0]);
                let a_imux = a_bank.imux[cell].borrow();
                fab.connect(reset_o, a_imux.lines[1][0]);
                fab.connect(c.oaddr, a_imux.lines[1][1]);
                let v_imux = v_bank.imux[cell].borrow();
                fab.connect(g.vo[cell], v_imux.lines[0][0]);
                fab.connect(c.oaddr, v_imux.lines[0][1]);
                let v_omux = v_bank.omux[cell].borrow();
                fab.connect(c.oaddr, v_omux.lines[0][0]);
            }
            c.done
        } else {
            null_o
        };
        fab.connect(phase2_done, control.borrow().phase2_done);

        let signaler = AndGate::insert(&mut fab, "phase1-signaler", n_pipelines + 1);
        {
            let g = signaler.borrow();
            for (cp, g_in) in pipelines.iter().zip(g.i.clone()) {
                fab.connect(cp.done, g_in);
            }
            let qe = scoreboard.borrow().qempty;
            fab.connect(qe, g.i[n_pipelines]);
            fab.connect(g.o, control.borrow().phase1_done);
        }

        // ---- phase 3: clear + migrate ----
        let pos_ctl = PositionUpdateController::insert(&mut fab);
        let pos_upd = PositionUpdater::insert(&mut fab, &cfg);
        let mig_qempty = fab.add_register("migration-qempty");
        {
            let c = pos_ctl.borrow();
            let u = pos_upd.borrow();
            fab.connect(p3_ready.o, c.ready);
            fab.connect(p3_ready.o, u.ready);
            fab.connect(dbuf.o, c.double_buffer);
            fab.connect(dbuf.o, u.double_buffer);
            fab.connect(u.qempty, mig_qempty.i);
            fab.connect(mig_qempty.o, c.qempty);
            fab.connect(c.clear_addr, u.clear_addr);
            for cell in 0..n_cell {
                fab.connect(p_bank.caches[cell].o, u.p_in[cell]);
                fab.connect(v_bank.caches[cell].o, u.v_in[cell]);
                let p_omux = p_bank.omux[cell].borrow();
                fab.connect(c.raddr, p_omux.lines[0][0]);
                let v_omux = v_bank.omux[cell].borrow();
                fab.connect(c.raddr, v_omux.lines[1][0]);
                let p_imux = p_bank.imux[cell].borrow();
                fab.connect(u.wp[cell], p_imux.lines[0][0]);
                fab.connect(u.waddr[cell], p_imux.lines[0][1]);
                let v_imux = v_bank.imux[cell].borrow();
                fab.connect(u.wv[cell], v_imux.lines[1][0]);
                fab.connect(u.waddr[cell], v_imux.lines[1][1]);
            }
            fab.connect(c.done, control.borrow().phase3_done);
        }

        // verification hooks
        {
            let mut c = control.borrow_mut();
            let v = verifier.clone();
            c.set_on_enter_phase1(move |t, db| v.borrow_mut().on_timestep_start(t, db));
            let v = verifier.clone();
            c.set_on_enter_phase3(move |t, _db| v.borrow_mut().on_enter_phase3(t));
            let v = verifier.clone();
            c.set_on_timestep(move |t, new_db| v.borrow_mut().on_timestep_end(t, new_db));
        }

        fab.finalize()?;

        Ok(Emulator {
            cfg,
            fabric: fab,
            control,
            p_data,
            v_data,
            records_dir: None,
            records_written: 0,
        })
    }

    fn cache_array(fab: &mut Fabric, ident: &str, phases: &[&str], n_cell: usize) -> CacheArray {
        let mut caches = Vec::with_capacity(n_cell);
        let mut imux = Vec::with_capacity(n_cell);
        let mut omux = Vec::with_capacity(n_cell);
        for cell in 0..n_cell {
            let cache = fab.add_bram(format!("{ident}-cache-{cell}"), BSIZE);
            let im = CacheMux::insert(fab, format!("{ident}-imux-{cell}"), phases, &["i", "iaddr"]);
            let om = CacheMux::insert(fab, format!("{ident}-omux-{cell}"), phases, &["oaddr"]);
            {
                let m = im.borrow();
                fab.connect(m.o[0], cache.i);
                fab.connect(m.o[1], cache.iaddr);
                let m = om.borrow();
                fab.connect(m.o[0], cache.oaddr);
            }
            caches.push(cache);
            imux.push(im);
            omux.push(om);
        }
        CacheArray { caches, imux, omux }
    }

    /// Place particles into the lower half of the caches, contiguously per
    /// cell, the layout phase 1 of timestep 0 expects.
    fn load(&mut self, particles: &[(Vec3, Vec3)]) -> Result<()> {
        let cutoff = self.cfg.cutoff();
        let u = self.cfg.universe_size;
        let mut counts = vec![0usize; self.cfg.n_cell()];
        for (r, v) in particles {
            let cell = cell_from_position(*r, cutoff, u);
            let addr = counts[cell];
            if addr >= DBSIZE {
                return Err(ConfigError::CellOverflow {
                    cell,
                    count: addr + 1,
                    capacity: DBSIZE,
                }
                .into());
            }
            self.p_data[cell].set(addr, Value::vec3(*r));
            self.v_data[cell].set(addr, Value::vec3(*v));
            counts[cell] += 1;
        }
        Ok(())
    }

    /// Clock the fabric until every configured timestep has completed.
    pub fn run(&mut self) -> Result<RunSummary> {
        let cap = 3_000_000u64 * self.cfg.t as u64 + 3_000_000;
        tracing::info!(
            n_particle = self.cfg.n_particle,
            n_cell = self.cfg.n_cell(),
            t = self.cfg.t,
            "starting run"
        );
        while self.control.borrow().t() < self.cfg.t {
            self.fabric.clock();
            self.flush_records()?;
            if self.fabric.cycles() > cap {
                bail!("exceeded maximum cycle limit ({cap}); a phase never reported done");
            }
        }
        Ok(RunSummary { timesteps: self.cfg.t, cycles_total: self.fabric.cycles() })
    }

    fn flush_records(&mut self) -> Result<()> {
        let Some(dir) = self.records_dir.clone() else { return Ok(()) };
        let done = self.control.borrow().t();
        while self.records_written < done {
            let t = self.records_written;
            // the half written during timestep t is the read half of t + 1
            let base = self.cfg.db_base((t + 1) % 2 == 1);
            record::write_timestep(&dir, t, &self.p_data, base)
                .with_context(|| format!("could not write record t{t}"))?;
            self.records_written += 1;
        }
        Ok(())
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn cycles(&self) -> u64 {
        self.fabric.cycles()
    }

    /// Occupied `(cell, addr, position)` slots of the half holding the
    /// latest completed state.
    pub fn position_snapshot(&self) -> Vec<(usize, usize, Vec3)> {
        self.scan(&self.p_data)
    }

    /// Occupied `(cell, addr, velocity)` slots of the same half.
    pub fn velocity_snapshot(&self) -> Vec<(usize, usize, Vec3)> {
        self.scan(&self.v_data)
    }

    fn scan(&self, data: &[BramData]) -> Vec<(usize, usize, Vec3)> {
        let base = self.cfg.db_base(self.control.borrow().double_buffer());
        let mut out = Vec::new();
        for (cell, cache) in data.iter().enumerate() {
            for addr in base..base + DBSIZE {
                if let Some(v) = cache.get(addr).as_vec3() {
                    out.push((cell, addr, v));
                }
            }
        }
        out
    }

    /// Raw view of one position cache half, `Null` slots included. Used by
    /// double-buffer assertions.
    pub fn raw_half(&self, cell: usize, upper: bool) -> Vec<Value> {
        let base = if upper { DBSIZE } else { 0 };
        self.p_data[cell].read()[base..base + DBSIZE].to_vec()
    }
}
