use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use md_fabric_rs::{record, Emulator, SimConfig};

/// Cycle-accurate emulator of a molecular dynamics accelerator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of timesteps to simulate
    #[arg(short = 't', long = "time", default_value_t = 2)]
    time: usize,

    /// Total number of particles
    #[arg(short = 'n', long = "particles", default_value_t = 300)]
    particles: usize,

    /// Cells per axis of the periodic box
    #[arg(short = 'u', long = "size", default_value_t = 3)]
    size: usize,

    /// Cell parallelism factor
    #[arg(short = 'c', long = "cpar", default_value_t = 9)]
    cpar: usize,

    /// Particle parallelism factor
    #[arg(short = 'p', long = "ppar", default_value_t = 4)]
    ppar: usize,

    /// Integration step length
    #[arg(long, default_value_t = 1e-7)]
    dt: f64,

    /// Lennard-Jones well depth
    #[arg(long, default_value_t = 40.0)]
    epsilon: f64,

    /// Lennard-Jones zero-crossing length
    #[arg(long, default_value_t = 1.0)]
    sigma: f64,

    /// Seed for particle initialization
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Depth of each force pipeline
    #[arg(long = "force-stages", default_value_t = 70)]
    force_stages: usize,

    /// Depth of each filter pipeline
    #[arg(long = "filter-stages", default_value_t = 13)]
    filter_stages: usize,

    /// Relative error tolerated against the direct integrator
    #[arg(long, default_value_t = 1e-2)]
    tolerance: f64,

    /// Skip the per-timestep cross-check against the direct integrator
    #[arg(long)]
    no_verify: bool,

    /// Bank accelerations in a dedicated cache and integrate velocities in
    /// a separate lock-step phase
    #[arg(long)]
    split_velocity_update: bool,

    /// Directory for per-timestep position snapshots
    #[arg(long, default_value = "records")]
    records_dir: PathBuf,

    /// Append a summary row to this CSV after the run
    #[arg(long)]
    perf_csv: Option<PathBuf>,

    /// Print logs during simulation
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .without_time()
        .with_max_level(level)
        .init();

    let cfg = SimConfig {
        t: args.time,
        dt: args.dt,
        universe_size: args.size,
        epsilon: args.epsilon,
        sigma: args.sigma,
        seed: args.seed,
        n_particle: args.particles,
        force_pipeline_stages: args.force_stages,
        filter_pipeline_stages: args.filter_stages,
        n_cpar: args.cpar,
        n_ppar: args.ppar,
        err_tolerance: args.tolerance,
        verify: !args.no_verify,
        split_velocity_update: args.split_velocity_update,
    };

    let mut emu = Emulator::new(cfg.clone())
        .context("could not build the fabric")?
        .with_records(&args.records_dir)?;
    let summary = emu.run()?;

    tracing::info!(
        timesteps = summary.timesteps,
        cycles = summary.cycles_total,
        "run complete"
    );

    if let Some(path) = args.perf_csv {
        record::append_performance(
            &path,
            cfg.n_particle,
            cfg.n_cell(),
            cfg.t,
            cfg.n_cpar,
            cfg.n_ppar,
            summary.cycles_total,
        )
        .with_context(|| format!("could not write `{}`", path.display()))?;
    }

    Ok(())
}
