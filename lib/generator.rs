//! Assembly of drift, control pulses, and noise into a single time-dependent
//! generator plus a list of dissipators.

use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::rngs::StdRng;
use rustc_hash::FxHashMap as HashMap;
use tracing::debug;
use crate::{
    error::{ SimError, SimResult },
    hilbert::Operator,
    noise::{ Dissipator, NoiseContext, NoiseSource },
    pulse::{ Interpolant, Pulse, SplineKind },
};

/// One time-dependent term `c(t) A` of a [`Generator`], with `A` on the full
/// space.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorTerm {
    operator: Operator,
    interpolant: Interpolant,
    spline_kind: SplineKind,
}

impl GeneratorTerm {
    pub fn operator(&self) -> &Operator { &self.operator }

    pub fn interpolant(&self) -> &Interpolant { &self.interpolant }

    pub fn spline_kind(&self) -> SplineKind { self.spline_kind }

    /// Coefficient at time `t`.
    pub fn coeff(&self, t: f64) -> f64 { self.interpolant.eval(t) }
}

/// A time-dependent Hamiltonian `H(t) = H_0 + sum_k c_k(t) A_k` over a merged
/// time grid.
#[derive(Clone, Debug)]
pub struct Generator {
    dims: Vec<usize>,
    constant: Option<Operator>,
    terms: Vec<GeneratorTerm>,
    tlist: nd::Array1<f64>,
    spline_kind: SplineKind,
    step_func_coeff: bool,
    args: HashMap<String, f64>,
}

impl Generator {
    /// Subsystem dimensions.
    pub fn dims(&self) -> &[usize] { &self.dims }

    /// Size of the full space.
    pub fn size(&self) -> usize { self.dims.iter().product() }

    /// Time-independent part, if any.
    pub fn constant(&self) -> Option<&Operator> { self.constant.as_ref() }

    /// Time-dependent terms, in pulse order followed by noise terms.
    pub fn terms(&self) -> &[GeneratorTerm] { &self.terms }

    /// Merged, strictly increasing time grid.
    pub fn tlist(&self) -> &nd::Array1<f64> { &self.tlist }

    /// Interpolation kind of the assembling processor.
    pub fn spline_kind(&self) -> SplineKind { self.spline_kind }

    /// `true` if any term or dissipator coefficient is piecewise constant, in
    /// which case integrators must sample coefficients within breakpoint
    /// segments.
    pub fn step_func_coeff(&self) -> bool { self.step_func_coeff }

    /// Named arguments carried alongside the generator.
    pub fn args(&self) -> &HashMap<String, f64> { &self.args }

    /// Attach named arguments.
    pub fn with_args<I, K>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.args.extend(args.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Return `true` if there are no time-dependent terms.
    pub fn is_constant(&self) -> bool { self.terms.is_empty() }

    /// Return `true` if every term is constant between grid points.
    pub fn is_piecewise_constant(&self) -> bool {
        self.terms.iter().all(|term| term.interpolant.is_piecewise_constant())
    }

    /// Evaluate `H(t)`. Piecewise-constant coefficients are sampled at the
    /// middle of `window` when one is given.
    pub fn hamiltonian_at(&self, t: f64, window: Option<(f64, f64)>)
        -> nd::Array2<C64>
    {
        let n = self.size();
        let mut H: nd::Array2<C64>
            = match &self.constant {
                Some(h0) => h0.data().clone(),
                None => nd::Array2::zeros((n, n)),
            };
        for term in self.terms.iter() {
            let c = term.interpolant.eval_in(t, window);
            if c == 0.0 { continue; }
            H.scaled_add(C64::from(c), term.operator.data());
        }
        H
    }

    /// Time-dependent terms as `(operator, coefficient on the merged grid)`
    /// pairs, for inspection.
    pub fn to_list(&self) -> Vec<(Operator, nd::Array1<f64>)> {
        self.terms.iter()
            .map(|term| {
                let c = self.tlist.mapv(|t| term.interpolant.eval(t));
                (term.operator.clone(), c)
            })
            .collect()
    }
}

/// Sorted union of several time grids; points closer than a relative `1e-12`
/// are merged.
pub fn merge_grids<'a, I>(grids: I) -> nd::Array1<f64>
where I: IntoIterator<Item = &'a nd::Array1<f64>>
{
    let mut all: Vec<f64> = Vec::new();
    grids.into_iter().for_each(|g| all.extend(g.iter().copied()));
    all.sort_by(|a, b| a.total_cmp(b));
    all.dedup_by(|b, a| (*b - *a).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0));
    all.into()
}

/// Build a [`Generator`] and its dissipators.
///
/// `drift` is a time-independent term on the full space. Every pulse is
/// validated and compiled; pulses without an operator only contribute their
/// time grid. If `include_noise` is set, each noise source is queried once
/// against `pulses`, in order, and its extra pulses, coefficient
/// perturbations, and dissipators are folded in.
///
/// Fails with [`SimError::EmptyGenerator`] if there is neither a drift nor
/// any pulse.
pub fn assemble(
    drift: Option<&Operator>,
    pulses: &[Pulse],
    noises: &[&dyn NoiseSource],
    dims: &[usize],
    spline_kind: SplineKind,
    include_noise: bool,
    rng: &mut StdRng,
) -> SimResult<(Generator, Vec<Dissipator>)>
{
    if let Some(h0) = drift {
        if h0.dims() != dims {
            return Err(SimError::dims("assemble: drift", dims, h0.dims()));
        }
    }
    let size: usize = dims.iter().product();

    let mut all_pulses: Vec<Pulse> = pulses.to_vec();
    let mut dissipators: Vec<Dissipator> = Vec::new();
    if include_noise {
        let mut ctx = NoiseContext { spline_kind, rng };
        for noise in noises.iter() {
            let contrib = noise.contribute(pulses, dims, &mut ctx)?;
            for pert in contrib.perturbations.iter() {
                let target
                    = all_pulses.get(pert.index)
                    .ok_or(SimError::PulseIndex {
                        index: pert.index,
                        len: pulses.len(),
                    })?;
                let updated = pert.apply(target)?;
                all_pulses[pert.index] = updated;
            }
            all_pulses.extend(contrib.pulses);
            dissipators.extend(contrib.dissipators);
        }
    }
    if drift.is_none() && all_pulses.is_empty() {
        return Err(SimError::EmptyGenerator);
    }

    let mut terms: Vec<GeneratorTerm> = Vec::with_capacity(all_pulses.len());
    for pulse in all_pulses.iter() {
        let interpolant = pulse.envelope().compile()?;
        if let Some(operator) = pulse.full_operator(dims)? {
            terms.push(GeneratorTerm {
                operator,
                interpolant,
                spline_kind: pulse.spline_kind(),
            });
        }
    }
    for diss in dissipators.iter() {
        if diss.operator().size() != size {
            return Err(SimError::dims(
                "assemble: dissipator", size, diss.operator().size()));
        }
    }

    let origin = nd::array![0.0];
    let tlist = merge_grids(
        std::iter::once(&origin)
            .chain(all_pulses.iter().map(|p| p.tlist()))
            .chain(dissipators.iter().filter_map(|d| d.tlist()))
    );
    let step_func_coeff
        = terms.iter().any(|term| term.interpolant.is_piecewise_constant())
        || dissipators.iter().any(|d| d.is_step());
    debug!(
        terms = terms.len(),
        dissipators = dissipators.len(),
        grid = tlist.len(),
        step_func_coeff,
        "assembled generator"
    );
    let generator = Generator {
        dims: dims.to_vec(),
        constant: drift.cloned(),
        terms,
        tlist,
        spline_kind,
        step_func_coeff,
        args: HashMap::default(),
    };
    Ok((generator, dissipators))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::{
        hilbert::{ destroy, sigmax, sigmaz },
        noise::{ ControlAmplitude, Decoherence },
    };

    fn rng() -> StdRng { StdRng::seed_from_u64(10546) }

    #[test]
    fn empty_generator() {
        let res = assemble(None, &[], &[], &[2], SplineKind::Step, true, &mut rng());
        assert!(matches!(res, Err(SimError::EmptyGenerator)));
    }

    #[test]
    fn merged_grid_and_flag() {
        let p1 = Pulse::new(
            Some(sigmaz()), Some(vec![0]), vec![1.0, 2.0, 3.0], vec![1.0, 1.0],
            SplineKind::Step);
        let p2 = Pulse::new(
            Some(sigmax()), Some(vec![1]), vec![0.5, 2.0, 4.0], vec![1.0, 2.0, 3.0],
            SplineKind::Cubic);
        let (hgen, diss)
            = assemble(None, &[p1, p2], &[], &[2, 2], SplineKind::Step, false, &mut rng())
            .unwrap();
        assert!(diss.is_empty());
        assert_eq!(hgen.tlist(), &nd::array![0.0, 0.5, 1.0, 2.0, 3.0, 4.0]);
        assert!(hgen.step_func_coeff());
        assert!(!hgen.is_piecewise_constant());
        let H = hgen.hamiltonian_at(0.75, None);
        // only the cubic term is active before t = 1
        assert!(H[[0, 0]].norm() < 1e-15);
        assert!(H[[0, 1]].norm() > 0.0);
    }

    #[test]
    fn noise_is_optional() {
        let p = Pulse::new(
            Some(sigmaz()), None, vec![0.0, 1.0, 2.0], vec![1.0, 1.0],
            SplineKind::Step);
        let dec = Decoherence::new(vec![destroy(2)]);
        let amp = ControlAmplitude::new(vec![0.0, 2.0], vec![0.5]).unwrap();
        let noises: [&dyn NoiseSource; 2] = [&dec, &amp];
        let (hgen, diss)
            = assemble(None, &[p.clone()], &noises, &[2], SplineKind::Step, false, &mut rng())
            .unwrap();
        assert!(diss.is_empty());
        assert_eq!(hgen.terms()[0].coeff(0.5), 1.0);

        let (hgen, diss)
            = assemble(None, &[p], &noises, &[2], SplineKind::Step, true, &mut rng())
            .unwrap();
        assert_eq!(diss.len(), 1);
        assert_eq!(hgen.terms().len(), 1);
        assert_eq!(hgen.terms()[0].coeff(0.5), 1.5);
    }

    #[test]
    fn drift_only_is_constant() {
        let h0 = sigmax().scale(0.5);
        let (hgen, _)
            = assemble(
                Some(&h0), &[Pulse::placeholder(vec![0.0, 1.0])], &[], &[2],
                SplineKind::Step, true, &mut rng(),
            )
            .unwrap();
        assert!(hgen.is_constant());
        assert_eq!(hgen.constant(), Some(&h0));
        assert!(!hgen.step_func_coeff());
    }

    #[test]
    fn drift_must_match_subsystems() {
        let flat = Operator::eye(&[4]);
        let res
            = assemble(
                Some(&flat), &[Pulse::placeholder(vec![0.0, 1.0])], &[], &[2, 2],
                SplineKind::Step, false, &mut rng(),
            );
        assert!(matches!(res, Err(SimError::DimensionMismatch { .. })));
        let split = Operator::eye(&[2, 2]);
        assert!(
            assemble(
                Some(&split), &[Pulse::placeholder(vec![0.0, 1.0])], &[], &[2, 2],
                SplineKind::Step, false, &mut rng(),
            )
            .is_ok()
        );
    }

    #[test]
    fn bad_pulse_fails_assembly() {
        let p = Pulse::new(
            Some(sigmaz()), None, vec![0.0, 1.0], vec![1.0, 1.0, 1.0],
            SplineKind::Cubic);
        let res = assemble(None, &[p], &[], &[2], SplineKind::Cubic, false, &mut rng());
        assert!(matches!(res, Err(SimError::InvalidPulseSpec(_))));
    }
}
