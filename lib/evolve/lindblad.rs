//! Evolution functions for the Lindblad master equation.

use super::*;
use crate::hilbert::{ anti_commutator, commutator };

// a dissipator with its adjoint and L^dag L precomputed
pub(crate) struct Channel<'a> {
    pub(crate) source: &'a Dissipator,
    pub(crate) L: nd::Array2<C64>,
    pub(crate) Ld: nd::Array2<C64>,
    pub(crate) LdL: nd::Array2<C64>,
}

impl<'a> Channel<'a> {
    pub(crate) fn new(source: &'a Dissipator) -> Self {
        let L = source.operator().data().clone();
        let Ld = source.operator().dag().into_data();
        let LdL = Ld.dot(&L);
        Self { source, L, Ld, LdL }
    }

    // gamma(t) (L rho L^dag - {L^dag L, rho} / 2)
    fn apply(&self, rate: f64, rho: &nd::Array2<C64>) -> nd::Array2<C64> {
        (self.L.dot(rho).dot(&self.Ld) - anti_commutator(&self.LdL, rho) / 2.0)
            * C64::from(rate)
    }
}

fn rhs(
    H: &nd::Array2<C64>,
    channels: &[Channel],
    t: f64,
    window: Window,
    rho: &nd::Array2<C64>,
) -> nd::Array2<C64>
{
    let mut drho = commutator(H, rho) * (-C64::i());
    for ch in channels.iter() {
        let rate = ch.source.rate_at(t, window);
        if rate == 0.0 { continue; }
        drho += &ch.apply(rate, rho);
    }
    drho
}

/// Numerically integrate the Lindblad equation
/// `d rho / dt = -i [H(t), rho] + sum_k D[L_k](rho)` from `times[0]`,
/// recording at every output time.
pub fn evolve(
    rho0: &nd::Array2<C64>,
    generator: &Generator,
    dissipators: &[Dissipator],
    times: &[f64],
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    let channels: Vec<Channel> = dissipators.iter().map(Channel::new).collect();
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
        rho0.clone(),
        |t, window, rho| {
            rhs(&generator.hamiltonian_at(t, window), &channels, t, window, rho)
        },
        &stops,
        use_windows,
        opts,
        |k, rho| recorder.record(k, State::Density(rho.clone())),
    )?;
    Ok(recorder.finish(SolverMode::Deterministic, times))
}
