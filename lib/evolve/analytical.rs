//! Closed-form propagation for piecewise-constant generators.

use super::*;
use crate::linalg::propagator;

fn check_propagable(generator: &Generator, dissipators: &[Dissipator])
    -> SimResult<()>
{
    if !dissipators.is_empty() {
        warn!("analytical propagation refused: dissipators present");
        return Err(SimError::InvalidSolverMode(
            "analytical propagation does not support dissipators".into()));
    }
    if !generator.is_piecewise_constant() {
        warn!("analytical propagation refused: continuously varying terms");
        return Err(SimError::InvalidSolverMode(
            "analytical propagation needs a piecewise-constant generator".into()));
    }
    Ok(())
}

// `exp(-i H dt)` over `[a, b]`, with `H` sampled inside the interval
fn interval_propagator(generator: &Generator, a: f64, b: f64)
    -> SimResult<nd::Array2<C64>>
{
    let mid = 0.5 * (a + b);
    let H = generator.hamiltonian_at(mid, Some((a, b)));
    propagator(&H, b - a)
}

/// Propagators `exp(-i H_k (t_{k+1} - t_k))` for each interval of `tlist`,
/// where `H_k` is the generator inside the interval.
///
/// Fails if there are dissipators or any term varies continuously in time.
pub fn propagators(
    generator: &Generator,
    dissipators: &[Dissipator],
    tlist: &[f64],
) -> SimResult<Vec<Operator>>
{
    check_propagable(generator, dissipators)?;
    tlist.iter().zip(tlist.iter().skip(1))
        .map(|(&a, &b)| {
            let U = interval_propagator(generator, a, b)?;
            Operator::new(U, generator.dims().to_vec())
        })
        .collect()
}

/// Apply interval propagators sequentially to `init`, recording at every
/// output time. Breakpoints of the generator are always respected.
pub fn evolve(
    init: &State,
    generator: &Generator,
    dissipators: &[Dissipator],
    times: &[f64],
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    check_propagable(generator, dissipators)?;
    let breakpoints = generator.tlist().as_slice().unwrap_or(&[]);
    let stops = plan_stops(times, breakpoints);
    let mut recorder = Recorder::new(observables, times.len(), opts);
    let mut state = init.clone();
    if let Some(k) = stops.first().and_then(|s| s.output) {
        recorder.record(k, state.clone())?;
    }
    for (sa, sb) in stops.iter().zip(stops.iter().skip(1)) {
        opts.check_abort()?;
        let U = interval_propagator(generator, sa.t, sb.t)?;
        state
            = match state {
                State::Ket(psi) => State::Ket(U.dot(&psi)),
                State::Density(rho) => {
                    let Ud = U.t().mapv(|a| a.conj());
                    State::Density(U.dot(&rho).dot(&Ud))
                },
            };
        if let Some(k) = sb.output { recorder.record(k, state.clone())?; }
    }
    Ok(recorder.finish(SolverMode::Analytical, times))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        generator::assemble,
        hilbert::{ basis, sigmax, sigmaz },
        pulse::{ Pulse, SplineKind },
    };

    #[test]
    fn drift_rotation() {
        let mut rng = StdRng::seed_from_u64(10546);
        let h0 = sigmax().scale(0.5);
        let tlist = vec![0.0, PI, 2.0 * PI, 3.0 * PI];
        let (hgen, diss)
            = assemble(
                Some(&h0), &[Pulse::placeholder(tlist.clone())], &[], &[2],
                SplineKind::Step, true, &mut rng,
            )
            .unwrap();
        let props = propagators(&hgen, &diss, &tlist).unwrap();
        assert_eq!(props.len(), 3);
        let psi
            = props.iter()
            .fold(basis(2, 0).unwrap(), |psi, U| U.data().dot(&psi));
        let fid = State::Ket(psi).fidelity(&State::Ket(basis(2, 1).unwrap())).unwrap();
        assert!((1.0 - fid).abs() < 1e-10);
    }

    #[test]
    fn cubic_terms_refused() {
        let mut rng = StdRng::seed_from_u64(10546);
        let p = Pulse::new(
            Some(sigmaz()), None, vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 0.0],
            SplineKind::Cubic);
        let (hgen, diss)
            = assemble(None, &[p], &[], &[2], SplineKind::Cubic, false, &mut rng)
            .unwrap();
        let res = propagators(&hgen, &diss, &[0.0, 1.0]);
        assert!(matches!(res, Err(SimError::InvalidSolverMode(_))));
    }
}
