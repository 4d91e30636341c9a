//! Quantum-jump (Monte-Carlo) unraveling of the Lindblad equation.
//!
//! Each trajectory evolves an unnormalized state vector under the effective
//! Hamiltonian `H - (i / 2) sum_k gamma_k L_k^dag L_k`. A jump happens when the
//! squared norm drops below a uniform random threshold; the jump time is
//! located by bisection and the channel is chosen with probability
//! proportional to `gamma_k |L_k psi|^2`. Trajectories are independent and run
//! in parallel, trajectory `k` seeded with `seed + k`.

use rand::{ Rng, SeedableRng, rngs::StdRng };
use rayon::prelude::*;
use tracing::debug;
use super::*;
use super::lindblad::Channel;

const JUMP_BISECTIONS: usize = 48;

fn norm_sqr(psi: &nd::Array1<C64>) -> f64 { psi.norm().re.powi(2) }

fn normalized(psi: &nd::Array1<C64>) -> nd::Array1<C64> {
    psi / psi.norm()
}

// output of one trajectory
struct Trajectory {
    expect: nd::Array2<f64>,
    densities: Vec<nd::Array2<C64>>,
    jumps: usize,
}

struct Unraveling<'a> {
    generator: &'a Generator,
    channels: Vec<Channel<'a>>,
    stops: Vec<Stop>,
    use_windows: bool,
    n_times: usize,
    store_states: bool,
}

impl<'a> Unraveling<'a> {
    fn rhs(&self, t: f64, window: Window, psi: &nd::Array1<C64>)
        -> nd::Array1<C64>
    {
        let mut H_eff: nd::Array2<C64> = self.generator.hamiltonian_at(t, window);
        for ch in self.channels.iter() {
            let rate = ch.source.rate_at(t, window);
            if rate == 0.0 { continue; }
            H_eff.scaled_add(C64::new(0.0, -0.5 * rate), &ch.LdL);
        }
        H_eff.dot(psi) * (-C64::i())
    }

    // collapse `psi` through one channel chosen by weight; returns `false` if
    // every channel annihilates the state
    fn jump(
        &self,
        t: f64,
        window: Window,
        psi: &mut nd::Array1<C64>,
        rng: &mut StdRng,
    ) -> bool
    {
        let candidates: Vec<(nd::Array1<C64>, f64)>
            = self.channels.iter()
            .map(|ch| {
                let phi = ch.L.dot(&*psi);
                let w = ch.source.rate_at(t, window) * norm_sqr(&phi);
                (phi, w)
            })
            .collect();
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        if total <= 0.0 { return false; }
        let mut r = rng.gen::<f64>() * total;
        let last = candidates.iter().rposition(|(_, w)| *w > 0.0).unwrap_or(0);
        for (k, (phi, w)) in candidates.into_iter().enumerate() {
            if r < w || k == last {
                *psi = normalized(&phi);
                return true;
            }
            r -= w;
        }
        false
    }

    // advance from `a` to `b`, applying jumps on the way
    #[allow(clippy::too_many_arguments)]
    fn segment(
        &self,
        mut psi: nd::Array1<C64>,
        a: f64,
        b: f64,
        h: &mut Option<f64>,
        threshold: &mut f64,
        jumps: &mut usize,
        rng: &mut StdRng,
        opts: &SolverOptions,
    ) -> SimResult<nd::Array1<C64>>
    {
        let window = self.use_windows.then_some((a, b));
        let rhs = |t: f64, w: Window, y: &nd::Array1<C64>| self.rhs(t, w, y);
        let eps = 1e-12 * a.abs().max(b.abs()).max(1.0);
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
            let (y_new, e) = dp45_step(&rhs, t, &psi, h_try, window);
            let err = error_norm(&psi, &y_new, &e, opts);
            if !err.is_finite() {
                return Err(SimError::Integration(
                    format!("non-finite state at t = {}", t)));
            }
            if err > 1.0 {
                step = h_try * step_factor(err).min(1.0);
                trace!(t, h = h_try, err, "step rejected");
                if step <= 16.0 * f64::EPSILON * t.abs().max(1.0) {
                    return Err(SimError::Integration(
                        format!("step size underflow at t = {}", t)));
                }
                continue;
            }
            step = h_try * step_factor(err);
            if norm_sqr(&y_new) > *threshold {
                t = if last { b } else { t + h_try };
                psi = y_new;
                continue;
            }
            // the norm crossed the threshold inside this step
            let (mut lo, mut hi) = (0.0, h_try);
            let mut psi_hi = y_new;
            for _ in 0..JUMP_BISECTIONS {
                if hi - lo <= eps { break; }
                let mid = 0.5 * (lo + hi);
                let (y_mid, _) = dp45_step(&rhs, t, &psi, mid, window);
                if norm_sqr(&y_mid) > *threshold {
                    lo = mid;
                } else {
                    hi = mid;
                    psi_hi = y_mid;
                }
            }
            t = if last && hi >= h_try { b } else { t + hi };
            psi = psi_hi;
            if self.jump(t, window, &mut psi, rng) {
                *jumps += 1;
            } else {
                psi = normalized(&psi);
            }
            *threshold = rng.gen::<f64>();
        }
        *h = Some(step);
        Ok(psi)
    }

    fn trajectory(
        &self,
        psi0: &nd::Array1<C64>,
        observables: &[Operator],
        seed: u64,
        opts: &SolverOptions,
    ) -> SimResult<Trajectory>
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut threshold: f64 = rng.gen();
        let mut jumps: usize = 0;
        let mut expect: nd::Array2<f64>
            = nd::Array2::zeros((observables.len(), self.n_times));
        let mut densities: Vec<nd::Array2<C64>> = Vec::new();
        let mut record = |k: usize, psi: &nd::Array1<C64>| -> SimResult<()> {
            let state = State::Ket(normalized(psi));
            for (j, op) in observables.iter().enumerate() {
                expect[[j, k]] = state.expect(op)?;
            }
            if self.store_states { densities.push(state.to_density()); }
            Ok(())
        };

        let mut psi = normalized(psi0);
        let mut h: Option<f64> = opts.first_step;
        if let Some(k) = self.stops.first().and_then(|s| s.output) {
            record(k, &psi)?;
        }
        for (sa, sb) in self.stops.iter().zip(self.stops.iter().skip(1)) {
            psi = self.segment(
                psi, sa.t, sb.t, &mut h, &mut threshold, &mut jumps, &mut rng, opts)?;
            if let Some(k) = sb.output { record(k, &psi)?; }
        }
        Ok(Trajectory { expect, densities, jumps })
    }
}

/// Average `ntraj` quantum-jump trajectories starting from the pure state
/// `init`.
///
/// Stored states are trajectory-averaged density matrices.
pub fn evolve(
    init: &State,
    generator: &Generator,
    dissipators: &[Dissipator],
    times: &[f64],
    opts: &SolverOptions,
    observables: &[Operator],
) -> SimResult<EvolutionResult>
{
    let psi0
        = init.as_ket()
        .ok_or_else(|| {
            SimError::InvalidState(
                "stochastic evolution requires a pure initial state".into())
        })?;
    if psi0.norm().re <= 0.0 {
        return Err(SimError::InvalidState("zero norm".into()));
    }
    if opts.ntraj == 0 {
        return Err(SimError::InvalidSolverMode(
            "stochastic evolution needs at least one trajectory".into()));
    }
    let breakpoints: &[f64]
        = if opts.respect_breakpoints {
            generator.tlist().as_slice().unwrap_or(&[])
        } else {
            &[]
        };
    let store_states = opts.store_states.unwrap_or(observables.is_empty());
    let unraveling = Unraveling {
        generator,
        channels: dissipators.iter().map(Channel::new).collect(),
        stops: plan_stops(times, breakpoints),
        use_windows: opts.respect_breakpoints && generator.step_func_coeff(),
        n_times: times.len(),
        store_states: store_states || opts.store_final_state,
    };
    let seed: u64 = opts.seed.unwrap_or_else(rand::random);
    let trajectories: Vec<Trajectory>
        = (0..opts.ntraj as u64).into_par_iter()
        .map(|k| {
            unraveling.trajectory(psi0, observables, seed.wrapping_add(k), opts)
        })
        .collect::<SimResult<Vec<Trajectory>>>()?;

    let ntraj = trajectories.len();
    let scale = 1.0 / ntraj as f64;
    let mut expect: nd::Array2<f64>
        = nd::Array2::zeros((observables.len(), times.len()));
    let mut densities: Vec<nd::Array2<C64>> = Vec::new();
    let mut jumps: usize = 0;
    for traj in trajectories.into_iter() {
        expect.scaled_add(scale, &traj.expect);
        if densities.is_empty() {
            densities
                = traj.densities.into_iter()
                .map(|rho| rho * C64::from(scale))
                .collect();
        } else {
            densities.iter_mut().zip(traj.densities.iter())
                .for_each(|(acc, rho)| acc.scaled_add(C64::from(scale), rho));
        }
        jumps += traj.jumps;
    }
    debug!(ntraj, jumps, "trajectories averaged");

    let final_state
        = opts.store_final_state
        .then(|| densities.last().cloned().map(State::Density))
        .flatten();
    let states: Vec<State>
        = if store_states {
            densities.into_iter().map(State::Density).collect()
        } else {
            Vec::new()
        };
    Ok(EvolutionResult {
        mode: SolverMode::Stochastic,
        times: times.to_vec().into(),
        states,
        expect,
        final_state,
        ntraj,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::{
        generator::assemble,
        hilbert::{ basis, destroy, identity, num, outer_prod },
        pulse::{ Pulse, SplineKind },
    };

    #[test]
    fn decay_matches_master_equation() {
        let mut rng = StdRng::seed_from_u64(10546);
        let tlist: Vec<f64> = (0..=10).map(|k| 0.1 * k as f64).collect();
        let pulse = Pulse::new(
            Some(identity(2)), Some(vec![0]), tlist.clone(), false, SplineKind::Step);
        let (hgen, _)
            = assemble(None, &[pulse], &[], &[2], SplineKind::Step, false, &mut rng)
            .unwrap();
        let diss = vec![Dissipator::new(destroy(2))];
        let opts = SolverOptions { ntraj: 400, seed: Some(7), ..Default::default() };
        let init = State::Ket(basis(2, 1).unwrap());
        let res = evolve(&init, &hgen, &diss, &tlist, &opts, &[num(2)]).unwrap();
        assert_eq!(res.ntraj, 400);
        assert!((res.expect[[0, 0]] - 1.0).abs() < 1e-12);
        let p_end = res.expect[[0, 10]];
        assert!((p_end - (-1.0_f64).exp()).abs() < 0.08);

        let again = evolve(&init, &hgen, &diss, &tlist, &opts, &[num(2)]).unwrap();
        assert_eq!(again.expect, res.expect);
    }

    #[test]
    fn density_initial_state_rejected() {
        let mut rng = StdRng::seed_from_u64(10546);
        let pulse = Pulse::new(
            Some(identity(2)), Some(vec![0]), vec![0.0, 1.0], false, SplineKind::Step);
        let (hgen, _)
            = assemble(None, &[pulse], &[], &[2], SplineKind::Step, false, &mut rng)
            .unwrap();
        let diss = vec![Dissipator::new(destroy(2))];
        let init = State::Density(outer_prod(&basis(2, 1).unwrap(), &basis(2, 1).unwrap()));
        let res = evolve(&init, &hgen, &diss, &[0.0, 1.0], &SolverOptions::default(), &[]);
        assert!(matches!(res, Err(SimError::InvalidState(_))));
    }
}
