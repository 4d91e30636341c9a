//! The collaborator-facing processor: a register of finite-level subsystems
//! with drift terms, control pulses, and noise models.
//!
//! Pulses live in an insertion-ordered arena keyed by stable
//! [`PulseHandle`]s; positional indices always refer to the current order.

use std::path::Path;
use indexmap::IndexMap;
use ndarray as nd;
use rand::{ SeedableRng, rngs::StdRng };
use rustc_hash::FxHashSet as HashSet;
use tracing::debug;
use crate::{
    config::ProcessorConfig,
    error::{ SimError, SimResult },
    evolve::{ self, EvolutionResult, SolverMode, SolverOptions, analytical },
    generator::{ Generator, assemble, merge_grids },
    hilbert::{ Operator, State, embed, expand_cyclic },
    noise::{ Dissipator, NoiseSource, Relaxation },
    pulse::{ Pulse, SplineKind },
    table,
};

/// Stable identifier of a pulse held by a [`Processor`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PulseHandle(u64);

/// A register of subsystems driven by control pulses.
#[derive(Debug)]
pub struct Processor {
    dims: Vec<usize>,
    spline_kind: SplineKind,
    relaxation: Option<Relaxation>,
    drift: Vec<Operator>,
    pulses: IndexMap<PulseHandle, Pulse>,
    next_handle: u64,
    noise: Vec<Box<dyn NoiseSource>>,
    seed: Option<u64>,
}

impl Processor {
    /// Create a new `Processor` of `n` qubits.
    pub fn new(n: usize) -> SimResult<Self> {
        Self::with_dims(vec![2; n])
    }

    /// Create a new `Processor` with arbitrary subsystem dimensions.
    pub fn with_dims(dims: Vec<usize>) -> SimResult<Self> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(SimError::dims("Processor::with_dims", "non-zero dims", &dims));
        }
        Ok(Self {
            dims,
            spline_kind: SplineKind::Step,
            relaxation: None,
            drift: Vec::new(),
            pulses: IndexMap::new(),
            next_handle: 0,
            noise: Vec::new(),
            seed: None,
        })
    }

    /// Create a new `Processor` from a configuration. Solver settings in the
    /// configuration are left for the caller to pass to
    /// [`Self::run_state`].
    pub fn from_config(config: &ProcessorConfig) -> SimResult<Self> {
        let mut proc = Self::with_dims(config.dims.clone())?
            .with_spline_kind(config.spline_kind)
            .with_relaxation(config.t1, config.t2)?;
        proc.seed = config.seed;
        Ok(proc)
    }

    /// Set the relaxation times applied to every subsystem in noisy runs.
    pub fn with_relaxation(mut self, t1: Option<f64>, t2: Option<f64>)
        -> SimResult<Self>
    {
        self.set_relaxation(t1, t2)?;
        Ok(self)
    }

    /// Set the default interpolation kind for new control pulses.
    pub fn with_spline_kind(mut self, spline_kind: SplineKind) -> Self {
        self.spline_kind = spline_kind;
        self
    }

    /// Seed noise sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the relaxation times.
    pub fn set_relaxation(&mut self, t1: Option<f64>, t2: Option<f64>)
        -> SimResult<()>
    {
        self.relaxation
            = if t1.is_none() && t2.is_none() {
                None
            } else {
                Some(Relaxation::new(t1, t2)?)
            };
        Ok(())
    }

    pub fn dims(&self) -> &[usize] { &self.dims }

    pub fn spline_kind(&self) -> SplineKind { self.spline_kind }

    pub fn t1(&self) -> Option<f64> { self.relaxation.as_ref()?.t1() }

    pub fn t2(&self) -> Option<f64> { self.relaxation.as_ref()?.t2() }

    // leading subsystems whose dimensions multiply to `size`
    fn default_targets(&self, size: usize) -> SimResult<Vec<usize>> {
        let mut prod: usize = 1;
        for (k, d) in self.dims.iter().enumerate() {
            prod *= d;
            if prod == size { return Ok((0..=k).collect()); }
            if prod > size { break; }
        }
        Err(SimError::dims("Processor: default targets", &self.dims, size))
    }

    fn insert(&mut self, pulse: Pulse) -> PulseHandle {
        let handle = PulseHandle(self.next_handle);
        self.next_handle += 1;
        self.pulses.insert(handle, pulse);
        handle
    }

    /// Register a control operator with an empty pulse.
    ///
    /// Without `targets` the operator is placed on the leading subsystems
    /// whose dimensions match its size. With `cyclic`, one pulse is added for
    /// every rotation of the targets along the register.
    pub fn add_control(
        &mut self,
        operator: Operator,
        targets: Option<&[usize]>,
        cyclic: bool,
    ) -> SimResult<Vec<PulseHandle>>
    {
        let targets: Vec<usize>
            = match targets {
                Some(t) => t.to_vec(),
                None => self.default_targets(operator.size())?,
            };
        let placements: Vec<Vec<usize>>
            = if cyclic {
                expand_cyclic(&operator, &targets, &self.dims, 1)?
                    .into_iter()
                    .map(|(t, _)| t)
                    .collect()
            } else {
                embed(&operator, &targets, &self.dims)?;
                vec![targets]
            };
        let kind = self.spline_kind;
        let handles: Vec<PulseHandle>
            = placements.into_iter()
            .map(|t| self.insert(Pulse::control(operator.clone(), Some(t), kind)))
            .collect();
        debug!(added = handles.len(), total = self.pulses.len(), "controls added");
        Ok(handles)
    }

    /// Add a time-independent term, on `targets` or on the full space.
    pub fn add_drift(&mut self, operator: Operator, targets: Option<&[usize]>)
        -> SimResult<()>
    {
        let full
            = match targets {
                Some(t) => embed(&operator, t, &self.dims)?,
                None => {
                    Operator::new(operator.data().clone(), self.dims.clone())
                        .map_err(|_| {
                            SimError::dims(
                                "Processor::add_drift", &self.dims, operator.dims())
                        })?
                },
            };
        self.drift.push(full);
        Ok(())
    }

    /// Add a ready-made pulse.
    pub fn add_pulse(&mut self, pulse: Pulse) -> SimResult<PulseHandle> {
        pulse.full_operator(&self.dims)?;
        Ok(self.insert(pulse))
    }

    /// Remove the pulses at the given positions, returning them in ascending
    /// positional order.
    pub fn remove_pulse(&mut self, indices: &[usize]) -> SimResult<Vec<Pulse>> {
        let len = self.pulses.len();
        let mut seen: HashSet<usize> = HashSet::default();
        for &index in indices.iter() {
            if index >= len || !seen.insert(index) {
                return Err(SimError::PulseIndex { index, len });
            }
        }
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        let mut removed: Vec<Pulse>
            = sorted.iter().rev()
            .filter_map(|&k| self.pulses.shift_remove_index(k).map(|(_, p)| p))
            .collect();
        removed.reverse();
        Ok(removed)
    }

    /// Remove a pulse by handle.
    pub fn remove_pulse_handle(&mut self, handle: PulseHandle) -> Option<Pulse> {
        self.pulses.shift_remove(&handle)
    }

    /// Number of pulses.
    pub fn num_pulses(&self) -> usize { self.pulses.len() }

    /// Pulses in positional order.
    pub fn pulses(&self) -> impl Iterator<Item = &Pulse> + '_ {
        self.pulses.values()
    }

    /// Handles in positional order.
    pub fn handles(&self) -> impl Iterator<Item = PulseHandle> + '_ {
        self.pulses.keys().copied()
    }

    pub fn pulse(&self, index: usize) -> Option<&Pulse> {
        self.pulses.get_index(index).map(|(_, p)| p)
    }

    pub fn pulse_mut(&mut self, index: usize) -> Option<&mut Pulse> {
        self.pulses.get_index_mut(index).map(|(_, p)| p)
    }

    pub fn pulse_by_handle(&self, handle: PulseHandle) -> Option<&Pulse> {
        self.pulses.get(&handle)
    }

    pub fn pulse_by_handle_mut(&mut self, handle: PulseHandle)
        -> Option<&mut Pulse>
    {
        self.pulses.get_mut(&handle)
    }

    /// Position of `handle` in the current order.
    pub fn index_of(&self, handle: PulseHandle) -> Option<usize> {
        self.pulses.get_index_of(&handle)
    }

    /// Operators of all pulses that carry one, placed in the full space.
    pub fn ctrls(&self) -> SimResult<Vec<Operator>> {
        self.pulses.values()
            .filter_map(|p| p.full_operator(&self.dims).transpose())
            .collect()
    }

    /// Sum of all drift terms, if any.
    pub fn drift(&self) -> SimResult<Option<Operator>> {
        let mut iter = self.drift.iter();
        let Some(first) = iter.next() else { return Ok(None); };
        iter.try_fold(first.clone(), |acc, op| acc.add(op)).map(Some)
    }

    /// Add a noise model, applied in noisy runs.
    pub fn add_noise<N>(&mut self, noise: N)
    where N: NoiseSource + 'static
    {
        self.noise.push(Box::new(noise));
    }

    /// Remove all noise models added with [`Self::add_noise`].
    pub fn clear_noise(&mut self) { self.noise.clear(); }

    pub fn noise(&self) -> &[Box<dyn NoiseSource>] { &self.noise }

    /// Give every pulse the same time grid.
    pub fn set_all_tlist<T>(&mut self, tlist: T)
    where T: Into<nd::Array1<f64>>
    {
        let tlist: nd::Array1<f64> = tlist.into();
        self.pulses.values_mut().for_each(|p| p.set_tlist(tlist.clone()));
    }

    /// Sorted union of every pulse's time grid.
    pub fn get_full_tlist(&self) -> nd::Array1<f64> {
        merge_grids(self.pulses.values().map(|p| p.tlist()))
    }

    /// Each pulse's coefficients resampled on [`Self::get_full_tlist`]: `n - 1`
    /// values for step pulses, `n` for cubic ones.
    pub fn get_full_coeffs(&self) -> SimResult<Vec<nd::Array1<f64>>> {
        let tlist = self.get_full_tlist();
        self.pulses.values()
            .map(|p| {
                let n = p.spline_kind().coeff_len(tlist.len());
                let times: Vec<f64> = tlist.iter().take(n).copied().collect();
                p.sample(&times)
            })
            .collect()
    }

    fn table_rows(&self) -> SimResult<Vec<Vec<f64>>> {
        Ok(self.get_full_coeffs()?.into_iter().map(|c| c.to_vec()).collect())
    }

    // set coefficients (and the grid, if given) from table rows, all or none
    fn apply_rows(&mut self, tlist: Option<nd::Array1<f64>>, rows: Vec<nd::Array1<f64>>)
        -> SimResult<()>
    {
        if rows.len() != self.pulses.len() {
            return Err(SimError::TableParse {
                line: 0,
                message: format!(
                    "table has {} coefficient rows for {} pulses",
                    rows.len(), self.pulses.len(),
                ),
            });
        }
        let mut updated: Vec<Pulse> = Vec::with_capacity(rows.len());
        for (pulse, row) in self.pulses.values().zip(rows) {
            let mut p = pulse.clone();
            if let Some(t) = &tlist {
                p.set_tlist(t.clone());
                p.set_coeff(row);
                p.validate()?;
            } else {
                p.set_coeff(row);
            }
            updated.push(p);
        }
        self.pulses.values_mut().zip(updated).for_each(|(p, q)| { *p = q; });
        Ok(())
    }

    /// Write all pulses to a text table, with the full time grid as the first
    /// row if `inctime`.
    pub fn save_coeff<P>(&self, path: P, inctime: bool) -> SimResult<()>
    where P: AsRef<Path>
    {
        let tlist = self.get_full_tlist();
        let rows = self.table_rows()?;
        let tlist_row = inctime.then(|| tlist.to_vec());
        table::save_table(path, tlist_row.as_deref(), &rows)
    }

    /// Read pulses from a text table written by [`Self::save_coeff`]. Without
    /// `inctime` only coefficients are set; the grid must then be set with
    /// [`Self::set_all_tlist`].
    pub fn read_coeff<P>(&mut self, path: P, inctime: bool) -> SimResult<()>
    where P: AsRef<Path>
    {
        let mut rows = table::load_table(path)?.into_iter();
        let tlist
            = if inctime {
                let t = rows.next().ok_or_else(|| SimError::TableParse {
                    line: 1,
                    message: "missing time grid row".into(),
                })?;
                Some(nd::Array1::from(t))
            } else {
                None
            };
        self.apply_rows(tlist, rows.map(nd::Array1::from).collect())
    }

    /// Write all pulses to a `.npy` table of width `len(get_full_tlist())`.
    pub fn save_coeff_npy<P>(&self, path: P, inctime: bool) -> SimResult<()>
    where P: AsRef<Path>
    {
        let tlist = self.get_full_tlist();
        let rows = self.table_rows()?;
        let tlist_row = inctime.then(|| tlist.to_vec());
        table::save_table_npy(path, tlist_row.as_deref(), &rows, tlist.len())
    }

    /// Read pulses from a `.npy` table written by [`Self::save_coeff_npy`].
    pub fn read_coeff_npy<P>(&mut self, path: P, inctime: bool) -> SimResult<()>
    where P: AsRef<Path>
    {
        let data = table::load_table_npy(path)?;
        let width = data.ncols();
        let mut rows = data.rows().into_iter();
        let tlist
            = if inctime {
                let t = rows.next().ok_or_else(|| SimError::TableParse {
                    line: 1,
                    message: "missing time grid row".into(),
                })?;
                Some(t.to_owned())
            } else {
                None
            };
        let coeffs: Vec<nd::Array1<f64>>
            = rows.zip(self.pulses.values())
            .map(|(row, p)| {
                let n = p.spline_kind().coeff_len(width);
                row.iter().take(n).copied().collect()
            })
            .collect();
        let n_rows = data.nrows() - usize::from(inctime);
        if coeffs.len() != n_rows {
            return Err(SimError::TableParse {
                line: 0,
                message: format!(
                    "table has {} coefficient rows for {} pulses",
                    n_rows, self.pulses.len(),
                ),
            });
        }
        self.apply_rows(tlist, coeffs)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Assemble the generator and dissipators, with noise (including
    /// relaxation) if `noisy`. `args` are carried on the generator.
    pub fn get_qobjevo(&self, args: &[(&str, f64)], noisy: bool)
        -> SimResult<(Generator, Vec<Dissipator>)>
    {
        let drift = self.drift()?;
        let pulses: Vec<Pulse> = self.pulses.values().cloned().collect();
        let mut sources: Vec<&dyn NoiseSource>
            = self.noise.iter().map(|n| &**n).collect();
        if let Some(relax) = &self.relaxation {
            sources.push(relax);
        }
        let mut rng = self.rng();
        let (generator, dissipators)
            = assemble(
                drift.as_ref(),
                &pulses,
                &sources,
                &self.dims,
                self.spline_kind,
                noisy,
                &mut rng,
            )?;
        Ok((generator.with_args(args.iter().copied()), dissipators))
    }

    /// Evolve `init` under the noisy generator.
    ///
    /// Stochastic runs without an explicit seed use the processor's seed.
    pub fn run_state(
        &self,
        init: &State,
        mode: SolverMode,
        options: &SolverOptions,
        observables: &[Operator],
    ) -> SimResult<EvolutionResult>
    {
        let size: usize = self.dims.iter().product();
        init.check_dim(size, "Processor::run_state")?;
        let (generator, dissipators) = self.get_qobjevo(&[], true)?;
        if options.seed.is_none() && self.seed.is_some() {
            let mut seeded = options.clone();
            seeded.seed = self.seed;
            evolve::run(init, &generator, &dissipators, mode, &seeded, observables)
        } else {
            evolve::run(init, &generator, &dissipators, mode, options, observables)
        }
    }

    /// Propagators over each interval of the noiseless generator's grid.
    pub fn run_analytically(&self) -> SimResult<Vec<Operator>> {
        let (generator, _) = self.get_qobjevo(&[], false)?;
        let tlist = generator.tlist().to_vec();
        analytical::propagators(&generator, &[], &tlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hilbert::{ identity, sigmax, sigmay, sigmaz };

    #[test]
    fn default_targets_follow_dims() {
        let mut proc = Processor::with_dims(vec![2, 3, 2]).unwrap();
        let op = Operator::eye(&[2, 3]);
        proc.add_control(op, None, false).unwrap();
        assert_eq!(proc.pulse(0).unwrap().targets(), Some(&[0, 1][..]));
        assert!(proc.add_control(Operator::eye(&[4]), None, false).is_err());
    }

    #[test]
    fn empty_register_is_rejected() {
        assert!(matches!(
            Processor::new(0),
            Err(SimError::DimensionMismatch { .. }),
        ));
        assert!(Processor::with_dims(vec![2, 0]).is_err());
        assert_eq!(Processor::new(3).unwrap().dims(), &[2, 2, 2]);
    }

    #[test]
    fn remove_by_position_and_handle() {
        let mut proc = Processor::new(2).unwrap();
        let h = proc.add_control(sigmax(), None, true).unwrap();
        proc.add_control(sigmay(), Some(&[1]), false).unwrap();
        assert_eq!(proc.num_pulses(), 3);
        assert!(matches!(
            proc.remove_pulse(&[0, 0]),
            Err(SimError::PulseIndex { .. }),
        ));
        let removed = proc.remove_pulse_handle(h[1]).unwrap();
        assert_eq!(removed.targets(), Some(&[1][..]));
        assert_eq!(proc.index_of(h[0]), Some(0));
        let removed = proc.remove_pulse(&[1, 0]).unwrap();
        assert_eq!(removed[0].operator(), Some(&sigmax()));
        assert_eq!(removed[1].operator(), Some(&sigmay()));
        assert_eq!(proc.num_pulses(), 0);
    }

    #[test]
    fn drift_sums_terms() {
        let mut proc = Processor::new(1).unwrap();
        proc.add_drift(sigmaz(), Some(&[0])).unwrap();
        proc.add_drift(sigmax(), None).unwrap();
        let drift = proc.drift().unwrap().unwrap();
        assert!(drift.approx_eq(&sigmaz().add(&sigmax()).unwrap(), 1e-15));
        assert!(proc.add_drift(identity(4), None).is_err());
    }

    #[test]
    fn relaxation_settings() {
        let proc = Processor::new(1).unwrap().with_relaxation(Some(1.0), None).unwrap();
        assert_eq!(proc.t1(), Some(1.0));
        assert_eq!(proc.t2(), None);
        assert!(Processor::new(1).unwrap().with_relaxation(Some(1.0), Some(3.0)).is_err());
    }
}
