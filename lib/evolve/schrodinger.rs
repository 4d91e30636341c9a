//! Evolution functions for the Schrödinger equation.

use super::*;

fn rhs(H: &nd::Array2<C64>, psi: &nd::Array1<C64>) -> nd::Array1<C64> {
    H.dot(psi) * (-C64::i())
}

/// Numerically integrate the Schrödinger equation `d psi / dt = -i H(t) psi`
/// from `times[0]`, recording at every output time.
pub fn evolve(
    psi0: &nd::Array1<C64>,
    generator: &Generator,
    times: &[f64],
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    let breakpoints: &[f64]
        = if opts.respect_breakpoints {
            generator.tlist().as_slice().unwrap_or(&[])
        } else {
            &[]
        };
    let stops = plan_stops(times, breakpoints);
    let use_windows = opts.respect_breakpoints && generator.step_func_coeff();
    let mut recorder = Recorder::new(observables, times.len(), opts);
    integrate(
        psi0.clone(),
        |t, window, psi| rhs(&generator.hamiltonian_at(t, window), psi),
        &stops,
        use_windows,
        opts,
        |k, psi| recorder.record(k, State::Ket(psi.clone())),
    )?;
    Ok(recorder.finish(SolverMode::Deterministic, times))
}
