//! Processor configuration loaded from TOML.
//!
//! ```toml
//! dims = [2, 2]
//! t1 = 50.0
//! t2 = 30.0
//! spline_kind = "cubic"
//! seed = 10546
//!
//! [solver]
//! rtol = 1e-8
//! max_step = 0.05
//! ntraj = 200
//! ```

use std::path::Path;
use serde::Deserialize;
use crate::{
    error::SimResult,
    evolve::SolverOptions,
    pulse::SplineKind,
};

/// Everything needed to build a [`Processor`][crate::processor::Processor]
/// and run it.
#[derive(Clone, Debug, Deserialize)]
pub struct ProcessorConfig {
    /// Subsystem dimensions.
    pub dims: Vec<usize>,
    /// Amplitude-damping time applied to every subsystem.
    pub t1: Option<f64>,
    /// Dephasing time applied to every subsystem.
    pub t2: Option<f64>,
    /// Default interpolation kind for control pulses.
    #[serde(default)]
    pub spline_kind: SplineKind,
    /// Seed for noise sampling.
    pub seed: Option<u64>,
    /// Integrator settings.
    #[serde(default)]
    pub solver: SolverOptions,
}

impl ProcessorConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(s: &str) -> SimResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file<P>(path: P) -> SimResult<Self>
    where P: AsRef<Path>
    {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;

    #[test]
    fn parse_full() {
        let cfg = ProcessorConfig::from_toml_str(r#"
            dims = [2, 3]
            t1 = 50.0
            spline_kind = "cubic"
            seed = 10546

            [solver]
            rtol = 1e-8
            max_step = 0.05
            respect_breakpoints = false
        "#).unwrap();
        assert_eq!(cfg.dims, vec![2, 3]);
        assert_eq!(cfg.t1, Some(50.0));
        assert_eq!(cfg.t2, None);
        assert_eq!(cfg.spline_kind, SplineKind::Cubic);
        assert_eq!(cfg.solver.rtol, 1e-8);
        assert_eq!(cfg.solver.atol, 1e-8);
        assert_eq!(cfg.solver.max_step, Some(0.05));
        assert!(!cfg.solver.respect_breakpoints);
        assert_eq!(cfg.solver.ntraj, 500);
    }

    #[test]
    fn defaults() {
        let cfg = ProcessorConfig::from_toml_str("dims = [2]").unwrap();
        assert_eq!(cfg.spline_kind, SplineKind::Step);
        assert!(cfg.solver.respect_breakpoints);
        assert_eq!(cfg.seed, None);
    }

    #[test]
    fn bad_kind() {
        let res = ProcessorConfig::from_toml_str("dims = [2]\nspline_kind = \"linear\"");
        assert!(matches!(res, Err(SimError::Config(_))));
    }
}
