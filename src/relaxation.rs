//! Ramsey-style decay of a single qubit under T1/T2 relaxation.
//!
//! Usage: `relaxation [config.toml]`. Writes `output/relaxation_time.npy` and
//! `output/relaxation_expect.npy` (rows: `<n>`, `<X>`).

use std::{ f64::consts::FRAC_1_SQRT_2, path::PathBuf };
use anyhow::Context;
use ndarray as nd;
use ndarray_npy::write_npy;
use num_complex::Complex64 as C64;
use tracing::info;
use tracing_subscriber::{ fmt, prelude::*, EnvFilter };
use pulse_sim::{
    hilbert::{ num, sigmax },
    Processor,
    ProcessorConfig,
    SolverMode,
    State,
};

const DEFAULT_CONFIG: &str = r#"
dims = [2]
t1 = 1.0
t2 = 0.5
seed = 10546

[solver]
max_step = 0.01
"#;

fn main() -> anyhow::Result<()> {
    let filter
        = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    let config: ProcessorConfig
        = match std::env::args().nth(1) {
            Some(path) => {
                ProcessorConfig::from_file(&path)
                    .with_context(|| format!("reading config {}", path))?
            },
            None => ProcessorConfig::from_toml_str(DEFAULT_CONFIG)?,
        };
    let mut proc = Processor::from_config(&config)?;

    // zero-amplitude control, only there to fix the time grid
    let time: nd::Array1<f64> = nd::Array1::linspace(0.0, 3.0, 301);
    let n = proc.spline_kind().coeff_len(time.len());
    proc.add_control(sigmax(), Some(&[0]), false)?;
    proc.set_all_tlist(time.clone());
    if let Some(p) = proc.pulse_mut(0) { p.set_coeff(nd::Array1::zeros(n)); }

    let a = C64::from(FRAC_1_SQRT_2);
    let psi0 = State::Ket(nd::array![a, a]);
    let res
        = proc.run_state(
            &psi0,
            SolverMode::Deterministic,
            &config.solver,
            &[num(2), sigmax()],
        )?;
    info!(
        final_population = res.expect[[0, res.times.len() - 1]],
        final_coherence = res.expect[[1, res.times.len() - 1]],
        "done"
    );

    let outdir = PathBuf::from("output");
    std::fs::create_dir_all(&outdir)?;
    write_npy(outdir.join("relaxation_time.npy"), &res.times)?;
    write_npy(outdir.join("relaxation_expect.npy"), &res.expect)?;
    Ok(())
}
