//! Functions for numerical time evolution under an assembled [`Generator`].
//!
//! Deterministic integration uses an adaptive Dormand-Prince 5(4) scheme that
//! stops exactly on every output time and, unless told otherwise, on every
//! breakpoint of the generator's time grid, so that no internal step crosses a
//! discontinuity of a piecewise-constant coefficient.

use std::{
    str::FromStr,
    sync::{ Arc, atomic::{ AtomicBool, Ordering } },
};
use ndarray as nd;
use num_complex::Complex64 as C64;
use serde::Deserialize;
use tracing::{ info, trace, warn };
use crate::{
    error::{ SimError, SimResult },
    generator::Generator,
    hilbert::{ Operator, State },
    noise::Dissipator,
};

pub mod schrodinger;
pub mod lindblad;
pub mod mcsolve;
pub mod analytical;

/// Integration segment `(t_start, t_end)` inside which piecewise-constant
/// coefficients are sampled.
pub(crate) type Window = Option<(f64, f64)>;

/* Options ********************************************************************/

/// How dissipation and time dependence are resolved numerically.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverMode {
    /// Exact propagators over each grid interval; piecewise-constant,
    /// dissipation-free generators only.
    Analytical,
    /// Schrödinger equation for pure states without dissipators, Lindblad
    /// master equation otherwise.
    #[default]
    Deterministic,
    /// Quantum-jump trajectories averaged over many runs.
    Stochastic,
}

impl FromStr for SolverMode {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        match s {
            "analytical" => Ok(Self::Analytical),
            "deterministic" | "mesolve" | "sesolve" => Ok(Self::Deterministic),
            "stochastic" | "mcsolve" => Ok(Self::Stochastic),
            other => Err(SimError::InvalidSolverMode(
                format!("unknown solver mode {:?}", other))),
        }
    }
}

/// Options for [`run`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Absolute error tolerance per step.
    pub atol: f64,
    /// Relative error tolerance per step.
    pub rtol: f64,
    /// Upper bound on internal step size.
    pub max_step: Option<f64>,
    /// Initial internal step size; defaults to the first segment's length.
    pub first_step: Option<f64>,
    /// Maximum number of internal steps between two stops.
    pub nsteps: usize,
    /// Stop on every point of the generator's time grid. When disabled, steps
    /// may cross discontinuities of piecewise-constant coefficients.
    pub respect_breakpoints: bool,
    /// Output times; defaults to the generator's merged grid.
    pub times: Option<Vec<f64>>,
    /// Store the full state at every output time; defaults to storing states
    /// only when no observables are given.
    pub store_states: Option<bool>,
    /// Store the state at the last output time.
    pub store_final_state: bool,
    /// Number of stochastic trajectories.
    pub ntraj: usize,
    /// Seed for stochastic trajectories; trajectory `k` uses `seed + k`.
    pub seed: Option<u64>,
    #[serde(skip)]
    abort: Arc<AtomicBool>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-6,
            max_step: None,
            first_step: None,
            nsteps: 10_000,
            respect_breakpoints: true,
            times: None,
            store_states: None,
            store_final_state: false,
            ntraj: 500,
            seed: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SolverOptions {
    /// Handle that aborts a running integration when set to `true`. The flag
    /// is checked between internal steps.
    pub fn abort_handle(&self) -> Arc<AtomicBool> { Arc::clone(&self.abort) }

    pub(crate) fn check_abort(&self) -> SimResult<()> {
        if self.abort.load(Ordering::Relaxed) {
            Err(SimError::Aborted)
        } else {
            Ok(())
        }
    }
}

/* Results ********************************************************************/

/// Output of a single call to [`run`].
#[derive(Clone, Debug)]
pub struct EvolutionResult {
    /// Solver mode that produced the result.
    pub mode: SolverMode,
    /// Output times.
    pub times: nd::Array1<f64>,
    /// States at each output time, if stored. Stochastic runs store
    /// trajectory-averaged density matrices.
    pub states: Vec<State>,
    /// Expectation values, indexed by `[observable, time]`.
    pub expect: nd::Array2<f64>,
    /// State at the last output time, if requested.
    pub final_state: Option<State>,
    /// Number of trajectories averaged over; `1` for deterministic modes.
    pub ntraj: usize,
}

// collects output for deterministic runs
pub(crate) struct Recorder<'a> {
    observables: &'a [Operator],
    n_times: usize,
    store_states: bool,
    store_final: bool,
    states: Vec<State>,
    expect: nd::Array2<f64>,
    final_state: Option<State>,
}

impl<'a> Recorder<'a> {
    pub(crate) fn new(
        observables: &'a [Operator],
        n_times: usize,
        opts: &SolverOptions,
    ) -> Self
    {
        Self {
            observables,
            n_times,
            store_states: opts.store_states.unwrap_or(observables.is_empty()),
            store_final: opts.store_final_state,
            states: Vec::new(),
            expect: nd::Array2::zeros((observables.len(), n_times)),
            final_state: None,
        }
    }

    pub(crate) fn record(&mut self, k: usize, state: State) -> SimResult<()> {
        for (j, op) in self.observables.iter().enumerate() {
            self.expect[[j, k]] = state.expect(op)?;
        }
        if self.store_final && k + 1 == self.n_times {
            self.final_state = Some(state.clone());
        }
        if self.store_states { self.states.push(state); }
        Ok(())
    }

    pub(crate) fn finish(self, mode: SolverMode, times: &[f64])
        -> EvolutionResult
    {
        EvolutionResult {
            mode,
            times: times.to_vec().into(),
            states: self.states,
            expect: self.expect,
            final_state: self.final_state,
            ntraj: 1,
        }
    }
}

/* Integration ****************************************************************/

/// Norm of an unnormalized trajectory state; its square decays as jump
/// probability accumulates.
pub(crate) trait StateNorm {
    fn norm(&self) -> C64;
}

impl StateNorm for nd::Array1<C64> {
    fn norm(&self) -> C64 { self.mapv(|a| a * a.conj()).sum().sqrt() }
}

/// A point the integrator must land on exactly: an output time (with its
/// index) or a generator breakpoint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Stop {
    pub(crate) t: f64,
    pub(crate) output: Option<usize>,
}

fn same_time(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}

// merge output times with the breakpoints lying strictly between the first
// and last output time
pub(crate) fn plan_stops(times: &[f64], breakpoints: &[f64]) -> Vec<Stop> {
    let mut stops: Vec<Stop>
        = times.iter().enumerate()
        .map(|(k, &t)| Stop { t, output: Some(k) })
        .collect();
    if let (Some(&t0), Some(&t1)) = (times.first(), times.last()) {
        stops.extend(
            breakpoints.iter()
            .filter(|&&b| b > t0 && b < t1)
            .filter(|&&b| !times.iter().any(|&t| same_time(t, b)))
            .map(|&t| Stop { t, output: None })
        );
    }
    stops.sort_by(|a, b| a.t.total_cmp(&b.t));
    stops.dedup_by(|b, a| b.output.is_none() && same_time(a.t, b.t));
    stops
}

// check caller-supplied output times, or fall back to the generator's grid
pub(crate) fn output_times(generator: &Generator, opts: &SolverOptions)
    -> SimResult<Vec<f64>>
{
    let times: Vec<f64>
        = match &opts.times {
            Some(t) => t.clone(),
            None => generator.tlist().to_vec(),
        };
    if times.is_empty() {
        return Err(SimError::InvalidPulseSpec("no output times".into()));
    }
    if times.iter().any(|t| !t.is_finite())
        || times.iter().zip(times.iter().skip(1)).any(|(a, b)| b <= a)
    {
        return Err(SimError::InvalidPulseSpec(
            "output times must be finite and strictly increasing".into()));
    }
    Ok(times)
}

// Dormand-Prince 5(4) tableau
const DP_C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const DP_A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0,
        -212.0 / 729.0, 0.0, 0.0,
    ],
    [
        9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0,
        49.0 / 176.0, -5103.0 / 18656.0, 0.0,
    ],
    [
        35.0 / 384.0, 0.0, 500.0 / 1113.0,
        125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0,
    ],
];
const DP_B: [f64; 7] = [
    35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0,
    -2187.0 / 6784.0, 11.0 / 84.0, 0.0,
];
// fifth- minus fourth-order weights
const DP_E: [f64; 7] = [
    71.0 / 57600.0, 0.0, -71.0 / 16695.0, 71.0 / 1920.0,
    -17253.0 / 339200.0, 22.0 / 525.0, -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

// one Dormand-Prince step of size `h`; returns the fifth-order solution and
// the embedded error estimate
pub(crate) fn dp45_step<D, F>(
    rhs: &F,
    t: f64,
    y: &nd::Array<C64, D>,
    h: f64,
    window: Window,
) -> (nd::Array<C64, D>, nd::Array<C64, D>)
where
    D: nd::Dimension,
    F: Fn(f64, Window, &nd::Array<C64, D>) -> nd::Array<C64, D>,
{
    let mut k: Vec<nd::Array<C64, D>> = Vec::with_capacity(7);
    k.push(rhs(t, window, y));
    for i in 1..7 {
        let mut yi = y.clone();
        for (j, kj) in k.iter().enumerate() {
            let a = DP_A[i][j];
            if a == 0.0 { continue; }
            yi.scaled_add(C64::from(a * h), kj);
        }
        k.push(rhs(t + DP_C[i] * h, window, &yi));
    }
    let mut y_new = y.clone();
    let mut err: nd::Array<C64, D> = nd::Array::zeros(y.raw_dim());
    for (j, kj) in k.iter().enumerate() {
        if DP_B[j] != 0.0 { y_new.scaled_add(C64::from(DP_B[j] * h), kj); }
        if DP_E[j] != 0.0 { err.scaled_add(C64::from(DP_E[j] * h), kj); }
    }
    (y_new, err)
}

// RMS of the error estimate scaled by the mixed tolerance
pub(crate) fn error_norm<D>(
    y: &nd::Array<C64, D>,
    y_new: &nd::Array<C64, D>,
    err: &nd::Array<C64, D>,
    opts: &SolverOptions,
) -> f64
where D: nd::Dimension
{
    let n = err.len().max(1) as f64;
    let sum: f64
        = y.iter().zip(y_new.iter()).zip(err.iter())
        .map(|((a, b), e)| {
            let scale = opts.atol + opts.rtol * a.norm().max(b.norm());
            (e.norm() / scale).powi(2)
        })
        .sum();
    (sum / n).sqrt()
}

pub(crate) fn step_factor(err: f64) -> f64 {
    if err <= 0.0 {
        MAX_FACTOR
    } else {
        (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
    }
}

// advance `y` from `a` to exactly `b`; `h` carries the step size between
// calls
pub(crate) fn integrate_segment<D, F>(
    rhs: &F,
    mut y: nd::Array<C64, D>,
    a: f64,
    b: f64,
    window: Window,
    h: &mut Option<f64>,
    opts: &SolverOptions,
) -> SimResult<nd::Array<C64, D>>
where
    D: nd::Dimension,
    F: Fn(f64, Window, &nd::Array<C64, D>) -> nd::Array<C64, D>,
{
    let eps = 1e-12 * a.abs().max(b.abs()).max(1.0);
    if b - a <= eps { return Ok(y); }
    let mut t = a;
    let mut step = h.unwrap_or(b - a);
    let mut count: usize = 0;
    while b - t > eps {
        opts.check_abort()?;
        if count >= opts.nsteps {
            return Err(SimError::Integration(format!(
                "exceeded {} internal steps between t = {} and t = {}",
                opts.nsteps, a, b,
            )));
        }
        count += 1;
        if let Some(max) = opts.max_step { step = step.min(max); }
        let last = step >= b - t;
        let h_try = if last { b - t } else { step };
        let (y_new, e) = dp45_step(rhs, t, &y, h_try, window);
        let err = error_norm(&y, &y_new, &e, opts);
        if !err.is_finite() {
            return Err(SimError::Integration(
                format!("non-finite state at t = {}", t)));
        }
        if err <= 1.0 {
            t = if last { b } else { t + h_try };
            y = y_new;
            step = h_try * step_factor(err);
        } else {
            step = h_try * step_factor(err).min(1.0);
            trace!(t, h = h_try, err, "step rejected");
            if step <= 16.0 * f64::EPSILON * t.abs().max(1.0) {
                return Err(SimError::Integration(
                    format!("step size underflow at t = {}", t)));
            }
        }
    }
    *h = Some(step);
    Ok(y)
}

// integrate over every stop, calling `observe` at each output time
pub(crate) fn integrate<D, F, O>(
    y0: nd::Array<C64, D>,
    rhs: F,
    stops: &[Stop],
    use_windows: bool,
    opts: &SolverOptions,
    mut observe: O,
) -> SimResult<()>
where
    D: nd::Dimension,
    F: Fn(f64, Window, &nd::Array<C64, D>) -> nd::Array<C64, D>,
    O: FnMut(usize, &nd::Array<C64, D>) -> SimResult<()>,
{
    let mut y = y0;
    let mut h: Option<f64> = opts.first_step;
    if let Some(k) = stops.first().and_then(|s| s.output) {
        observe(k, &y)?;
    }
    for (sa, sb) in stops.iter().zip(stops.iter().skip(1)) {
        let window = use_windows.then_some((sa.t, sb.t));
        y = integrate_segment(&rhs, y, sa.t, sb.t, window, &mut h, opts)?;
        if let Some(k) = sb.output { observe(k, &y)?; }
    }
    Ok(())
}

/* Driver *********************************************************************/

/// Evolve `init` under `generator` and `dissipators`.
///
/// Expectation values of `observables` are computed at every output time. The
/// initial state and every observable must match the generator's dimension.
///
/// Stochastic mode without dissipators runs a single deterministic
/// trajectory.
pub fn run(
    init: &State,
    generator: &Generator,
    dissipators: &[Dissipator],
    mode: SolverMode,
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    let n = generator.size();
    init.check_dim(n, "run: initial state")?;
    if let Some(op) = observables.iter().find(|op| op.size() != n) {
        return Err(SimError::dims("run: observable", n, op.size()));
    }
    let times = output_times(generator, opts)?;
    info!(
        ?mode,
        dim = n,
        times = times.len(),
        dissipators = dissipators.len(),
        "running evolution"
    );
    match mode {
        SolverMode::Analytical => {
            analytical::evolve(init, generator, dissipators, &times, opts, observables)
        },
        SolverMode::Deterministic => {
            deterministic(init, generator, dissipators, &times, opts, observables)
        },
        SolverMode::Stochastic if dissipators.is_empty() => {
            warn!("stochastic mode without dissipators; running one deterministic trajectory");
            let mut res
                = deterministic(init, generator, dissipators, &times, opts, observables)?;
            res.mode = SolverMode::Stochastic;
            Ok(res)
        },
        SolverMode::Stochastic => {
            mcsolve::evolve(init, generator, dissipators, &times, opts, observables)
        },
    }
}

fn deterministic(
    init: &State,
    generator: &Generator,
    dissipators: &[Dissipator],
    times: &[f64],
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    match init {
        State::Ket(psi0) if dissipators.is_empty() => {
            schrodinger::evolve(psi0, generator, times, opts, observables)
        },
        _ => {
            lindblad::evolve(
                &init.to_density(), generator, dissipators, times, opts, observables)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_include_breakpoints() {
        let stops = plan_stops(&[0.0, 2.0], &[0.0, 0.5, 1.0, 2.0, 3.0]);
        let ts: Vec<f64> = stops.iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![0.0, 0.5, 1.0, 2.0]);
        assert_eq!(stops[0].output, Some(0));
        assert_eq!(stops[1].output, None);
        assert_eq!(stops[3].output, Some(1));
    }

    #[test]
    fn dp45_exponential_decay() {
        // y' = -y over [0, 1]
        let rhs = |_t: f64, _w: Window, y: &nd::Array1<C64>| y * C64::from(-1.0);
        let opts = SolverOptions::default();
        let mut h = None;
        let y = integrate_segment(
            &rhs, nd::array![C64::from(1.0)], 0.0, 1.0, None, &mut h, &opts)
            .unwrap();
        assert!((y[0].re - (-1.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn nsteps_limit() {
        let rhs = |_t: f64, _w: Window, y: &nd::Array1<C64>| y * C64::from(-1.0);
        let opts = SolverOptions { max_step: Some(1e-3), nsteps: 10, ..Default::default() };
        let mut h = None;
        let res = integrate_segment(
            &rhs, nd::array![C64::from(1.0)], 0.0, 1.0, None, &mut h, &opts);
        assert!(matches!(res, Err(SimError::Integration(_))));
    }

    #[test]
    fn abort_flag() {
        let rhs = |_t: f64, _w: Window, y: &nd::Array1<C64>| y * C64::from(-1.0);
        let opts = SolverOptions::default();
        opts.abort_handle().store(true, Ordering::Relaxed);
        let mut h = None;
        let res = integrate_segment(
            &rhs, nd::array![C64::from(1.0)], 0.0, 1.0, None, &mut h, &opts);
        assert!(matches!(res, Err(SimError::Aborted)));
    }

    #[test]
    fn mode_names() {
        assert_eq!("mcsolve".parse::<SolverMode>().unwrap(), SolverMode::Stochastic);
        assert!("euler".parse::<SolverMode>().is_err());
    }
}
