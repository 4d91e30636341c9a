//! Noise models.
//!
//! Every model implements [`NoiseSource`]: given the current pulse list and
//! subsystem dimensions it returns a [`NoiseContribution`] of extra pulses,
//! perturbations of existing pulse coefficients, and dissipators. The
//! generator assembler treats all models the same way.

use ndarray as nd;
use rand::{ distributions::Distribution, rngs::StdRng };
use tracing::debug;
use crate::{
    error::{ SimError, SimResult },
    hilbert::{ Operator, destroy, embed, num },
    pulse::{ Coeff, Envelope, Interpolant, Pulse, SplineKind },
};

/* Dissipators ****************************************************************/

/// A collapse operator on the full space, optionally scaled by a
/// time-dependent coefficient.
///
/// With coefficient `c(t)` the channel acts as `c(t) L`, so its rate is
/// `c(t)^2`.
#[derive(Clone, Debug, PartialEq)]
pub struct Dissipator {
    operator: Operator,
    envelope: Option<Envelope>,
    interpolant: Option<Interpolant>,
}

impl Dissipator {
    /// Create a new time-independent `Dissipator`.
    pub fn new(operator: Operator) -> Self {
        Self { operator, envelope: None, interpolant: None }
    }

    /// Create a new `Dissipator` scaled by `envelope`.
    pub fn with_envelope(operator: Operator, envelope: Envelope)
        -> SimResult<Self>
    {
        let interpolant = envelope.compile()?;
        Ok(Self { operator, envelope: Some(envelope), interpolant: Some(interpolant) })
    }

    pub fn operator(&self) -> &Operator { &self.operator }

    pub fn envelope(&self) -> Option<&Envelope> { self.envelope.as_ref() }

    /// Time grid of the coefficient, if time-dependent.
    pub fn tlist(&self) -> Option<&nd::Array1<f64>> {
        self.envelope.as_ref().map(|env| &env.tlist)
    }

    /// Return `true` if the coefficient is piecewise constant.
    pub fn is_step(&self) -> bool {
        self.interpolant.as_ref()
            .is_some_and(|interp| interp.is_piecewise_constant())
    }

    /// Channel rate `c(t)^2` inside the integration segment `window`.
    pub fn rate_at(&self, t: f64, window: Option<(f64, f64)>) -> f64 {
        match &self.interpolant {
            Some(interp) => interp.eval_in(t, window).powi(2),
            None => 1.0,
        }
    }
}

/* Noise interface ************************************************************/

/// Additive change to the coefficients of an existing pulse, sampled on that
/// pulse's own grid.
#[derive(Clone, Debug, PartialEq)]
pub struct CoeffPerturbation {
    /// Position of the pulse in the list passed to [`NoiseSource::contribute`].
    pub index: usize,
    /// Values added to the pulse's coefficients, one per coefficient.
    pub delta: nd::Array1<f64>,
}

/// Everything a noise model adds to one generator assembly.
#[derive(Clone, Debug, Default)]
pub struct NoiseContribution {
    pub pulses: Vec<Pulse>,
    pub perturbations: Vec<CoeffPerturbation>,
    pub dissipators: Vec<Dissipator>,
}

impl NoiseContribution {
    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
            && self.perturbations.is_empty()
            && self.dissipators.is_empty()
    }
}

/// Per-assembly information handed to noise models.
pub struct NoiseContext<'a> {
    /// Interpolation kind of the assembling processor.
    pub spline_kind: SplineKind,
    /// Random source for the whole assembly.
    pub rng: &'a mut StdRng,
}

/// A source of noise terms.
pub trait NoiseSource: Send + Sync + std::fmt::Debug {
    /// Compute this model's contribution to a generator built from `pulses`
    /// on a space with subsystem dimensions `dims`.
    fn contribute(
        &self,
        pulses: &[Pulse],
        dims: &[usize],
        ctx: &mut NoiseContext,
    ) -> SimResult<NoiseContribution>;
}

// indices of the pulses a model acts on: the given ones, or every pulse that
// carries an operator
fn select_pulses(pulses: &[Pulse], indices: Option<&[usize]>)
    -> SimResult<Vec<usize>>
{
    match indices {
        Some(idx) => {
            idx.iter()
                .map(|&index| {
                    if index < pulses.len() {
                        Ok(index)
                    } else {
                        Err(SimError::PulseIndex { index, len: pulses.len() })
                    }
                })
                .collect()
        },
        None => {
            Ok(
                pulses.iter().enumerate()
                .filter(|(_, p)| p.operator().is_some())
                .map(|(k, _)| k)
                .collect()
            )
        },
    }
}

/* Decoherence ****************************************************************/

/// Fixed collapse operators, optionally scaled by a common coefficient.
#[derive(Clone, Debug)]
pub struct Decoherence {
    c_ops: Vec<Operator>,
    targets: Option<Vec<usize>>,
    all_targets: bool,
    envelope: Option<Envelope>,
}

impl Decoherence {
    /// Create a new `Decoherence` from collapse operators that act on the full
    /// space unless targets are set.
    pub fn new(c_ops: Vec<Operator>) -> Self {
        Self { c_ops, targets: None, all_targets: false, envelope: None }
    }

    /// Place every collapse operator on `targets`.
    pub fn with_targets(mut self, targets: Vec<usize>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Place every collapse operator on each subsystem of matching dimension
    /// individually.
    pub fn on_all_targets(mut self) -> Self {
        self.all_targets = true;
        self
    }

    /// Scale every collapse operator by a time-dependent coefficient. The
    /// interpolation kind is inferred from the lengths of `tlist` and
    /// `coeff`.
    pub fn with_coeff<T, C>(mut self, tlist: T, coeff: C) -> SimResult<Self>
    where
        T: Into<nd::Array1<f64>>,
        C: Into<nd::Array1<f64>>,
    {
        self.envelope = Some(Envelope::inferred(tlist, coeff)?);
        Ok(self)
    }

    fn dissipator(&self, op: Operator) -> SimResult<Dissipator> {
        match &self.envelope {
            Some(env) => Dissipator::with_envelope(op, env.clone()),
            None => Ok(Dissipator::new(op)),
        }
    }
}

impl NoiseSource for Decoherence {
    fn contribute(
        &self,
        _pulses: &[Pulse],
        dims: &[usize],
        _ctx: &mut NoiseContext,
    ) -> SimResult<NoiseContribution>
    {
        let mut dissipators: Vec<Dissipator> = Vec::new();
        for c_op in self.c_ops.iter() {
            if self.all_targets {
                let candidates: Vec<usize>
                    = match &self.targets {
                        Some(t) => t.clone(),
                        None => (0..dims.len()).collect(),
                    };
                let mut placed = 0;
                for k in candidates {
                    if dims.get(k) != Some(&c_op.size()) { continue; }
                    dissipators.push(self.dissipator(embed(c_op, &[k], dims)?)?);
                    placed += 1;
                }
                if placed == 0 {
                    return Err(SimError::dims(
                        "Decoherence::contribute", dims, c_op.size()));
                }
            } else {
                let full
                    = match &self.targets {
                        Some(t) => embed(c_op, t, dims)?,
                        None => {
                            Operator::new(c_op.data().clone(), dims.to_vec())
                                .map_err(|_| {
                                    SimError::dims(
                                        "Decoherence::contribute",
                                        dims,
                                        c_op.dims(),
                                    )
                                })?
                        },
                    };
                dissipators.push(self.dissipator(full)?);
            }
        }
        Ok(NoiseContribution { dissipators, ..NoiseContribution::default() })
    }
}

/* Relaxation *****************************************************************/

/// Amplitude damping (`T1`) and pure dephasing (`T2`) on every requested
/// subsystem.
///
/// For each target of dimension `d` with lowering operator `a`:
/// - `L1 = sqrt(1 / T1) a`
/// - `L2 = sqrt(2 / T2') a^dag a`, where `1 / T2' = 1 / T2 - 1 / (2 T1)`
///
/// so that coherences of a two-level system decay as `exp(-t / T2)`. `T2`
/// must not exceed `2 T1`.
#[derive(Clone, Debug, Default)]
pub struct Relaxation {
    t1: Option<f64>,
    t2: Option<f64>,
    targets: Option<Vec<usize>>,
}

impl Relaxation {
    /// Create a new `Relaxation`, acting on every subsystem.
    pub fn new(t1: Option<f64>, t2: Option<f64>) -> SimResult<Self> {
        for (name, t) in [("T1", t1), ("T2", t2)] {
            if let Some(t) = t {
                if !(t.is_finite() && t > 0.0) {
                    return Err(SimError::InvalidNoise(format!(
                        "{} must be positive and finite, got {}", name, t)));
                }
            }
        }
        if let (Some(t1), Some(t2)) = (t1, t2) {
            if t2 > 2.0 * t1 * (1.0 + 1e-12) {
                return Err(SimError::InvalidNoise(format!(
                    "T2 = {} exceeds 2 T1 = {}", t2, 2.0 * t1)));
            }
        }
        Ok(Self { t1, t2, targets: None })
    }

    /// Restrict to `targets`.
    pub fn with_targets(mut self, targets: Vec<usize>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn t1(&self) -> Option<f64> { self.t1 }

    pub fn t2(&self) -> Option<f64> { self.t2 }

    // dephasing rate of a^dag a
    fn dephasing_rate(&self) -> Option<f64> {
        let t2 = self.t2?;
        let inv = 1.0 / t2 - self.t1.map(|t1| 0.5 / t1).unwrap_or(0.0);
        (inv > 1e-12 / t2).then_some(2.0 * inv)
    }
}

impl NoiseSource for Relaxation {
    fn contribute(
        &self,
        _pulses: &[Pulse],
        dims: &[usize],
        _ctx: &mut NoiseContext,
    ) -> SimResult<NoiseContribution>
    {
        let targets: Vec<usize>
            = match &self.targets {
                Some(t) => t.clone(),
                None => (0..dims.len()).collect(),
            };
        let gamma2 = self.dephasing_rate();
        let mut dissipators: Vec<Dissipator> = Vec::new();
        for k in targets {
            let d
                = *dims.get(k)
                .ok_or_else(|| {
                    SimError::dims("Relaxation::contribute", dims.len(), k)
                })?;
            if let Some(t1) = self.t1 {
                let l1 = destroy(d).scale((1.0 / t1).sqrt());
                dissipators.push(Dissipator::new(embed(&l1, &[k], dims)?));
            }
            if let Some(g) = gamma2 {
                let l2 = num(d).scale(g.sqrt());
                dissipators.push(Dissipator::new(embed(&l2, &[k], dims)?));
            }
        }
        Ok(NoiseContribution { dissipators, ..NoiseContribution::default() })
    }
}

/* Random amplitude ***********************************************************/

/// Additive amplitude jitter: for each selected pulse, a new term with the
/// same operator whose coefficients are drawn from `distribution` once per
/// assembly.
#[derive(Clone, Debug)]
pub struct RandomAmplitude<D> {
    distribution: D,
    dt: Option<f64>,
    indices: Option<Vec<usize>>,
}

impl<D> RandomAmplitude<D>
where D: Distribution<f64>
{
    /// Create a new `RandomAmplitude` sampling on each pulse's own grid.
    pub fn new(distribution: D) -> Self {
        Self { distribution, dt: None, indices: None }
    }

    /// Sample on a grid of spacing `dt` spanning each pulse's domain instead.
    pub fn with_dt(mut self, dt: f64) -> SimResult<Self> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidNoise(format!(
                "sampling interval must be positive, got {}", dt)));
        }
        self.dt = Some(dt);
        Ok(self)
    }

    /// Act only on the pulses at these positions.
    pub fn with_indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = Some(indices);
        self
    }

    fn grid(&self, pulse: &Pulse) -> Option<nd::Array1<f64>> {
        let (t0, t1) = pulse.domain()?;
        if t1 <= t0 { return None; }
        match self.dt {
            Some(dt) => {
                let n = ((t1 - t0) / dt).ceil() as usize;
                let mut grid: Vec<f64>
                    = (0..n).map(|k| t0 + k as f64 * dt)
                    .filter(|t| *t < t1 - 1e-9 * dt)
                    .collect();
                grid.push(t1);
                Some(grid.into())
            },
            None => Some(pulse.tlist().clone()),
        }
    }
}

impl<D> NoiseSource for RandomAmplitude<D>
where D: Distribution<f64> + Send + Sync + std::fmt::Debug
{
    fn contribute(
        &self,
        pulses: &[Pulse],
        _dims: &[usize],
        ctx: &mut NoiseContext,
    ) -> SimResult<NoiseContribution>
    {
        let mut extra: Vec<Pulse> = Vec::new();
        for k in select_pulses(pulses, self.indices.as_deref())? {
            let pulse = &pulses[k];
            let Some(op) = pulse.operator() else { continue; };
            let Some(tlist) = self.grid(pulse) else { continue; };
            let n = ctx.spline_kind.coeff_len(tlist.len());
            let coeff: nd::Array1<f64>
                = (0..n).map(|_| self.distribution.sample(&mut *ctx.rng))
                .collect();
            extra.push(Pulse::new(
                Some(op.clone()),
                pulse.targets().map(|t| t.to_vec()),
                tlist,
                coeff,
                ctx.spline_kind,
            ));
        }
        debug!(terms = extra.len(), "random amplitude noise sampled");
        Ok(NoiseContribution { pulses: extra, ..NoiseContribution::default() })
    }
}

/* Control amplitude **********************************************************/

/// Miscalibrated drive amplitude: a fixed noise sequence added to the
/// coefficients of existing pulses, resampled on each pulse's grid.
#[derive(Clone, Debug)]
pub struct ControlAmplitude {
    noise: Envelope,
    interpolant: Interpolant,
    indices: Option<Vec<usize>>,
}

impl ControlAmplitude {
    /// Create a new `ControlAmplitude`. The interpolation kind of the noise
    /// sequence is inferred from the lengths of `tlist` and `coeff`.
    pub fn new<T, C>(tlist: T, coeff: C) -> SimResult<Self>
    where
        T: Into<nd::Array1<f64>>,
        C: Into<nd::Array1<f64>>,
    {
        let noise = Envelope::inferred(tlist, coeff)?;
        let interpolant = noise.compile()?;
        Ok(Self { noise, interpolant, indices: None })
    }

    /// Act only on the pulses at these positions.
    pub fn with_indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn envelope(&self) -> &Envelope { &self.noise }
}

impl NoiseSource for ControlAmplitude {
    fn contribute(
        &self,
        pulses: &[Pulse],
        _dims: &[usize],
        _ctx: &mut NoiseContext,
    ) -> SimResult<NoiseContribution>
    {
        let mut perturbations: Vec<CoeffPerturbation> = Vec::new();
        for index in select_pulses(pulses, self.indices.as_deref())? {
            let pulse = &pulses[index];
            if pulse.operator().is_none() || pulse.tlist().len() < 2 {
                continue;
            }
            let n = pulse.spline_kind().coeff_len(pulse.tlist().len());
            let delta: nd::Array1<f64>
                = pulse.tlist().iter().take(n)
                .map(|t| self.interpolant.eval(*t))
                .collect();
            perturbations.push(CoeffPerturbation { index, delta });
        }
        Ok(NoiseContribution { perturbations, ..NoiseContribution::default() })
    }
}

impl CoeffPerturbation {
    /// Apply to a copy of `pulse`; constant coefficients are expanded over the
    /// grid first.
    pub fn apply(&self, pulse: &Pulse) -> SimResult<Pulse> {
        let n = pulse.spline_kind().coeff_len(pulse.tlist().len());
        if self.delta.len() != n {
            return Err(SimError::InvalidPulseSpec(format!(
                "perturbation of length {} for a pulse with {} coefficients",
                self.delta.len(), n,
            )));
        }
        let base: nd::Array1<f64>
            = match pulse.coeff() {
                Coeff::Constant(c) => nd::Array1::from_elem(n, *c),
                Coeff::Array(c) => c.clone(),
            };
        if base.len() != n {
            return Err(SimError::InvalidPulseSpec(format!(
                "pulse has {} coefficients, expected {}", base.len(), n)));
        }
        let mut out = pulse.clone();
        out.set_coeff(base + &self.delta);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::hilbert::{ sigmax, sigmaz };

    fn ctx_run<N: NoiseSource>(noise: &N, pulses: &[Pulse], dims: &[usize])
        -> SimResult<NoiseContribution>
    {
        let mut rng = StdRng::seed_from_u64(10546);
        let mut ctx = NoiseContext { spline_kind: SplineKind::Step, rng: &mut rng };
        noise.contribute(pulses, dims, &mut ctx)
    }

    #[test]
    fn relaxation_operators() {
        let relax = Relaxation::new(Some(1.0), Some(0.5)).unwrap();
        let contrib = ctx_run(&relax, &[], &[2]).unwrap();
        assert_eq!(contrib.dissipators.len(), 2);
        let l1 = contrib.dissipators[0].operator();
        assert!(l1.approx_eq(&destroy(2), 1e-12));
        // 1/T2' = 2 - 0.5 = 1.5, rate 3
        let l2 = contrib.dissipators[1].operator();
        assert!(l2.approx_eq(&num(2).scale(3.0_f64.sqrt()), 1e-12));
    }

    #[test]
    fn relaxation_limits() {
        assert!(matches!(
            Relaxation::new(Some(1.0), Some(2.5)),
            Err(SimError::InvalidNoise(_)),
        ));
        assert!(Relaxation::new(Some(-1.0), None).is_err());
        let relax = Relaxation::new(Some(1.0), Some(2.0)).unwrap();
        let contrib = ctx_run(&relax, &[], &[2, 3]).unwrap();
        // one amplitude-damping operator per subsystem, no dephasing
        assert_eq!(contrib.dissipators.len(), 2);
        assert_eq!(contrib.dissipators[1].operator().size(), 6);
    }

    #[test]
    fn decoherence_targets() {
        let dec = Decoherence::new(vec![destroy(2)]).on_all_targets();
        let contrib = ctx_run(&dec, &[], &[2, 2, 2]).unwrap();
        assert_eq!(contrib.dissipators.len(), 3);

        let dec = Decoherence::new(vec![sigmax()])
            .with_coeff(vec![0.0, 1.0, 2.0], vec![1.0, 2.0, 3.0]).unwrap();
        let contrib = ctx_run(&dec, &[], &[2]).unwrap();
        let diss = &contrib.dissipators[0];
        assert!(diss.operator().approx_eq(&sigmax(), 0.0));
        assert_eq!(diss.tlist().unwrap(), &nd::array![0.0, 1.0, 2.0]);
        assert!(!diss.is_step());
        assert!((diss.rate_at(1.0, None) - 4.0).abs() < 1e-12);

        let dec = Decoherence::new(vec![sigmax()]);
        assert!(ctx_run(&dec, &[], &[2, 2]).is_err());
    }

    #[test]
    fn random_amplitude_grid() {
        let pulse = Pulse::new(
            Some(sigmaz()), Some(vec![0]), vec![0.0, 1.0], vec![1.0], SplineKind::Step);
        let noise
            = RandomAmplitude::new(rand::distributions::Uniform::new(0.0, 1.0))
            .with_dt(0.3).unwrap();
        let contrib = ctx_run(&noise, &[pulse], &[2]).unwrap();
        let extra = &contrib.pulses[0];
        let expected = nd::array![0.0, 0.3, 0.6, 0.9, 1.0];
        assert_eq!(extra.tlist().len(), expected.len());
        assert!(extra.tlist().iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-12));
        extra.validate().unwrap();
        match extra.coeff() {
            Coeff::Array(c) => assert!(c.iter().all(|x| (0.0..1.0).contains(x))),
            Coeff::Constant(_) => panic!("expected sampled coefficients"),
        }
    }

    #[test]
    fn control_amplitude_perturbs() {
        let pulse = Pulse::new(
            Some(sigmaz()), None, vec![0.0, 1.0, 2.0], vec![1.0, 2.0], SplineKind::Step);
        let noise
            = ControlAmplitude::new(vec![0.0, 2.0], vec![0.5]).unwrap();
        let contrib = ctx_run(&noise, &[pulse.clone()], &[2]).unwrap();
        assert!(contrib.pulses.is_empty());
        let perturbed = contrib.perturbations[0].apply(&pulse).unwrap();
        assert_eq!(perturbed.coeff(), &Coeff::Array(nd::array![1.5, 2.5]));
    }
}
