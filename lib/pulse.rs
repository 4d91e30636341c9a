//! Time-dependent coefficients and the pulses that carry them.
//!
//! A [`Pulse`] is an operator acting on a set of target subsystems, scaled by
//! a real coefficient sampled on its own time grid. The coefficient is turned
//! into a function of time by an [`Interpolant`] chosen through
//! [`SplineKind`].

use std::str::FromStr;
use ndarray as nd;
use serde::Deserialize;
use crate::{
    error::{ SimError, SimResult },
    hilbert::{ Operator, embed },
};

/// Interpolation convention for turning a coefficient sequence into a
/// function of time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplineKind {
    /// Held constant from each grid point to the next. A grid of `n` points
    /// carries `n - 1` coefficients.
    #[default]
    Step,
    /// Natural cubic spline through every `(t, c)` pair. A grid of `n` points
    /// carries `n` coefficients.
    Cubic,
}

impl SplineKind {
    /// Number of coefficients expected for a grid of `n_t` points.
    pub fn coeff_len(&self, n_t: usize) -> usize {
        match self {
            Self::Step => n_t.saturating_sub(1),
            Self::Cubic => n_t,
        }
    }

    /// Infer the kind from the lengths of a grid and its coefficients.
    pub fn infer(n_t: usize, n_c: usize) -> SimResult<Self> {
        if n_t >= 2 && n_c == n_t {
            Ok(Self::Cubic)
        } else if n_t >= 2 && n_c + 1 == n_t {
            Ok(Self::Step)
        } else {
            Err(SimError::InvalidPulseSpec(format!(
                "cannot pair {} coefficients with {} time points", n_c, n_t)))
        }
    }
}

impl FromStr for SplineKind {
    type Err = SimError;

    fn from_str(s: &str) -> SimResult<Self> {
        match s {
            "step" | "step_func" => Ok(Self::Step),
            "cubic" => Ok(Self::Cubic),
            other => Err(SimError::InvalidPulseSpec(
                format!("unknown interpolation kind {:?}", other))),
        }
    }
}

/// Coefficient values of a pulse.
#[derive(Clone, Debug, PartialEq)]
pub enum Coeff {
    /// A single value held over the whole grid.
    Constant(f64),
    /// One value per grid point (cubic) or per grid interval (step).
    Array(nd::Array1<f64>),
}

impl From<bool> for Coeff {
    fn from(on: bool) -> Self { Self::Constant(if on { 1.0 } else { 0.0 }) }
}

impl From<f64> for Coeff {
    fn from(c: f64) -> Self { Self::Constant(c) }
}

impl From<nd::Array1<f64>> for Coeff {
    fn from(c: nd::Array1<f64>) -> Self { Self::Array(c) }
}

impl From<Vec<f64>> for Coeff {
    fn from(c: Vec<f64>) -> Self { Self::Array(c.into()) }
}

impl Default for Coeff {
    fn default() -> Self { Self::Array(nd::Array1::zeros(0)) }
}

/// A coefficient sequence together with its time grid and interpolation kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub tlist: nd::Array1<f64>,
    pub coeff: Coeff,
    pub spline_kind: SplineKind,
}

impl Envelope {
    /// Create a new `Envelope`. No validation is performed until
    /// [`Self::validate`] or [`Self::compile`].
    pub fn new<T, C>(tlist: T, coeff: C, spline_kind: SplineKind) -> Self
    where
        T: Into<nd::Array1<f64>>,
        C: Into<Coeff>,
    {
        Self { tlist: tlist.into(), coeff: coeff.into(), spline_kind }
    }

    /// Create a new `Envelope` whose kind is inferred from the lengths of
    /// `tlist` and `coeff`; see [`SplineKind::infer`].
    pub fn inferred<T, C>(tlist: T, coeff: C) -> SimResult<Self>
    where
        T: Into<nd::Array1<f64>>,
        C: Into<nd::Array1<f64>>,
    {
        let tlist = tlist.into();
        let coeff = coeff.into();
        let spline_kind = SplineKind::infer(tlist.len(), coeff.len())?;
        let env = Self { tlist, coeff: Coeff::Array(coeff), spline_kind };
        env.validate()?;
        Ok(env)
    }

    /// Check that the time grid is strictly increasing and finite, and that
    /// the coefficient length fits the interpolation kind.
    pub fn validate(&self) -> SimResult<()> {
        let n_t = self.tlist.len();
        if n_t < 2 {
            return Err(SimError::InvalidPulseSpec(format!(
                "time grid needs at least 2 points, got {}", n_t)));
        }
        if self.tlist.iter().any(|t| !t.is_finite()) {
            return Err(SimError::InvalidPulseSpec(
                "time grid contains non-finite values".into()));
        }
        if self.tlist.iter().zip(self.tlist.iter().skip(1))
            .any(|(tk, tkp1)| tkp1 <= tk)
        {
            return Err(SimError::InvalidPulseSpec(
                "time grid is not strictly increasing".into()));
        }
        match &self.coeff {
            Coeff::Constant(c) if !c.is_finite() => {
                Err(SimError::InvalidPulseSpec(
                    "constant coefficient is not finite".into()))
            },
            Coeff::Constant(_) => Ok(()),
            Coeff::Array(c) => {
                let expected = self.spline_kind.coeff_len(n_t);
                if c.len() != expected {
                    Err(SimError::InvalidPulseSpec(format!(
                        "{:?} interpolation over {} time points needs {} \
                        coefficients, got {}",
                        self.spline_kind, n_t, expected, c.len(),
                    )))
                } else if c.iter().any(|x| !x.is_finite()) {
                    Err(SimError::InvalidPulseSpec(
                        "coefficients contain non-finite values".into()))
                } else {
                    Ok(())
                }
            },
        }
    }

    /// Time extent `(t_min, t_max)` of the grid, if non-empty.
    pub fn domain(&self) -> Option<(f64, f64)> {
        Some((*self.tlist.first()?, *self.tlist.last()?))
    }

    /// Validate and build an evaluable [`Interpolant`].
    pub fn compile(&self) -> SimResult<Interpolant> {
        self.validate()?;
        let tlist: Vec<f64> = self.tlist.to_vec();
        let interp
            = match (&self.coeff, self.spline_kind) {
                (Coeff::Constant(c), kind) => {
                    let (t0, t1) = (tlist[0], tlist[tlist.len() - 1]);
                    Interpolant::Constant { value: *c, t0, t1, kind }
                },
                (Coeff::Array(c), SplineKind::Step) => {
                    Interpolant::Step { tlist, coeff: c.to_vec() }
                },
                (Coeff::Array(c), SplineKind::Cubic) => {
                    Interpolant::Cubic(CubicSpline::new(tlist, c.to_vec())?)
                },
            };
        Ok(interp)
    }

    /// Evaluate the coefficient at time `t`.
    ///
    /// This compiles the envelope on every call, which for cubic envelopes
    /// means solving the spline system again; use [`Self::sample`] or hold on
    /// to [`Self::compile`]'s result when evaluating at many times.
    pub fn evaluate(&self, t: f64) -> SimResult<f64> {
        Ok(self.compile()?.eval(t))
    }

    /// Evaluate the coefficient at each of `times`, compiling once.
    pub fn sample(&self, times: &[f64]) -> SimResult<nd::Array1<f64>> {
        let interp = self.compile()?;
        Ok(times.iter().map(|t| interp.eval(*t)).collect())
    }
}

/// A compiled coefficient function of time.
#[derive(Clone, Debug, PartialEq)]
pub enum Interpolant {
    /// A single value over `[t0, t1)` (step) or `[t0, t1]` (cubic), zero
    /// elsewhere.
    Constant { value: f64, t0: f64, t1: f64, kind: SplineKind },
    /// Piecewise-constant over `[tlist[0], tlist[n - 1])`, zero elsewhere.
    Step { tlist: Vec<f64>, coeff: Vec<f64> },
    /// Natural cubic spline, zero outside its knots.
    Cubic(CubicSpline),
}

impl Interpolant {
    /// Evaluate at time `t`.
    pub fn eval(&self, t: f64) -> f64 {
        match self {
            Self::Constant { value, t0, t1, kind } => {
                let inside
                    = match kind {
                        SplineKind::Step => *t0 <= t && t < *t1,
                        SplineKind::Cubic => *t0 <= t && t <= *t1,
                    };
                if inside { *value } else { 0.0 }
            },
            Self::Step { tlist, coeff } => {
                let n = tlist.len();
                if t < tlist[0] || t >= tlist[n - 1] { return 0.0; }
                let k = tlist.partition_point(|tk| *tk <= t);
                coeff[k - 1]
            },
            Self::Cubic(spline) => spline.eval(t),
        }
    }

    /// Evaluate at time `t` inside the integration segment `window`.
    ///
    /// Piecewise-constant coefficients are sampled at the middle of the
    /// segment, so that a value is never taken from the far side of a
    /// discontinuity lying on a segment boundary.
    pub fn eval_in(&self, t: f64, window: Option<(f64, f64)>) -> f64 {
        match (self.is_piecewise_constant(), window) {
            (true, Some((a, b))) => self.eval(0.5 * (a + b)),
            _ => self.eval(t),
        }
    }

    /// Return `true` if the coefficient is constant between grid points.
    pub fn is_piecewise_constant(&self) -> bool {
        match self {
            Self::Constant { kind, .. } => *kind == SplineKind::Step,
            Self::Step { .. } => true,
            Self::Cubic(_) => false,
        }
    }
}

/// Natural cubic spline through a set of knots.
#[derive(Clone, Debug, PartialEq)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    // second derivatives at the knots
    m: Vec<f64>,
}

impl CubicSpline {
    /// Fit a natural spline. `x` must be strictly increasing with at least two
    /// points and `y` must have the same length.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> SimResult<Self> {
        let n = x.len();
        if n < 2 || y.len() != n {
            return Err(SimError::InvalidPulseSpec(format!(
                "cubic spline needs at least 2 knots and one value per knot, \
                got {} knots and {} values",
                n, y.len(),
            )));
        }
        if x.iter().zip(x.iter().skip(1)).any(|(xk, xkp1)| xkp1 <= xk) {
            return Err(SimError::InvalidPulseSpec(
                "spline knots are not strictly increasing".into()));
        }
        let mut m = vec![0.0; n];
        if n > 2 {
            let h: Vec<f64>
                = x.iter().zip(x.iter().skip(1))
                .map(|(xk, xkp1)| xkp1 - xk)
                .collect();
            // tridiagonal system for interior knots, Thomas algorithm
            let k = n - 2;
            let mut diag: Vec<f64> = (0..k).map(|i| 2.0 * (h[i] + h[i + 1])).collect();
            let mut rhs: Vec<f64>
                = (0..k)
                .map(|i| {
                    6.0 * (
                        (y[i + 2] - y[i + 1]) / h[i + 1]
                        - (y[i + 1] - y[i]) / h[i]
                    )
                })
                .collect();
            for i in 1..k {
                let w = h[i] / diag[i - 1];
                diag[i] -= w * h[i];
                rhs[i] -= w * rhs[i - 1];
            }
            m[k] = rhs[k - 1] / diag[k - 1];
            for i in (0..k - 1).rev() {
                m[i + 1] = (rhs[i] - h[i + 1] * m[i + 2]) / diag[i];
            }
        }
        Ok(Self { x, y, m })
    }

    /// Evaluate the spline; zero outside `[x[0], x[n - 1]]`.
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        if t < self.x[0] || t > self.x[n - 1] { return 0.0; }
        let i = self.x.partition_point(|xk| *xk <= t).clamp(1, n - 1) - 1;
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        a * self.y[i] + b * self.y[i + 1]
            + (
                (a * a * a - a) * self.m[i]
                + (b * b * b - b) * self.m[i + 1]
            ) * h * h / 6.0
    }
}

/// A single time-dependent term: an operator on some target subsystems with a
/// coefficient envelope.
///
/// A pulse without an operator only anchors a time grid.
#[derive(Clone, Debug, PartialEq)]
pub struct Pulse {
    operator: Option<Operator>,
    targets: Option<Vec<usize>>,
    envelope: Envelope,
}

impl Pulse {
    /// Create a new `Pulse`.
    ///
    /// `targets = None` means `operator` already acts on the full space.
    pub fn new<T, C>(
        operator: Option<Operator>,
        targets: Option<Vec<usize>>,
        tlist: T,
        coeff: C,
        spline_kind: SplineKind,
    ) -> Self
    where
        T: Into<nd::Array1<f64>>,
        C: Into<Coeff>,
    {
        Self {
            operator,
            targets,
            envelope: Envelope::new(tlist, coeff, spline_kind),
        }
    }

    /// Create a control pulse with an empty grid, to be filled in later.
    pub fn control(
        operator: Operator,
        targets: Option<Vec<usize>>,
        spline_kind: SplineKind,
    ) -> Self
    {
        Self {
            operator: Some(operator),
            targets,
            envelope: Envelope { spline_kind, ..Envelope::default() },
        }
    }

    /// Create an operator-less pulse that only contributes its time grid.
    pub fn placeholder<T>(tlist: T) -> Self
    where T: Into<nd::Array1<f64>>
    {
        Self::new(None, None, tlist, false, SplineKind::Step)
    }

    /// Local operator, if any.
    pub fn operator(&self) -> Option<&Operator> { self.operator.as_ref() }

    /// Target subsystems, if any.
    pub fn targets(&self) -> Option<&[usize]> { self.targets.as_deref() }

    /// Time grid.
    pub fn tlist(&self) -> &nd::Array1<f64> { &self.envelope.tlist }

    /// Coefficients.
    pub fn coeff(&self) -> &Coeff { &self.envelope.coeff }

    /// Interpolation kind.
    pub fn spline_kind(&self) -> SplineKind { self.envelope.spline_kind }

    /// Coefficient envelope.
    pub fn envelope(&self) -> &Envelope { &self.envelope }

    /// Replace the time grid.
    pub fn set_tlist<T>(&mut self, tlist: T)
    where T: Into<nd::Array1<f64>>
    {
        self.envelope.tlist = tlist.into();
    }

    /// Replace the coefficients.
    pub fn set_coeff<C>(&mut self, coeff: C)
    where C: Into<Coeff>
    {
        self.envelope.coeff = coeff.into();
    }

    /// Replace the interpolation kind.
    pub fn set_spline_kind(&mut self, spline_kind: SplineKind) {
        self.envelope.spline_kind = spline_kind;
    }

    /// See [`Envelope::validate`].
    pub fn validate(&self) -> SimResult<()> { self.envelope.validate() }

    /// See [`Envelope::domain`].
    pub fn domain(&self) -> Option<(f64, f64)> { self.envelope.domain() }

    /// See [`Envelope::evaluate`].
    pub fn evaluate(&self, t: f64) -> SimResult<f64> {
        self.envelope.evaluate(t)
    }

    /// See [`Envelope::sample`].
    pub fn sample(&self, times: &[f64]) -> SimResult<nd::Array1<f64>> {
        self.envelope.sample(times)
    }

    /// The operator placed in the full space described by `dims`, or `None`
    /// for an operator-less pulse.
    pub fn full_operator(&self, dims: &[usize]) -> SimResult<Option<Operator>> {
        let Some(op) = &self.operator else { return Ok(None); };
        match &self.targets {
            Some(targets) => embed(op, targets, dims).map(Some),
            None => {
                Operator::new(op.data().clone(), dims.to_vec())
                    .map(Some)
                    .map_err(|_| {
                        SimError::dims("Pulse::full_operator", dims, op.dims())
                    })
            },
        }
    }
}
