//! Error types shared across the crate.

use thiserror::Error;

/// Errors produced while building or running a pulse-level simulation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimError {
    /// An operator or state does not fit the declared subsystem dimensions.
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected size (or dimension structure).
        expected: String,
        /// Size (or dimension structure) actually found.
        found: String,
    },

    /// Malformed time grid or coefficient sequence.
    #[error("invalid pulse specification: {0}")]
    InvalidPulseSpec(String),

    /// Nothing to evolve: no drift and no pulses.
    #[error("generator is empty: no drift and no pulses")]
    EmptyGenerator,

    /// The numerical integrator failed within its configured limits.
    #[error("integration failed: {0}")]
    Integration(String),

    /// A noise model was given unphysical parameters.
    #[error("invalid noise model: {0}")]
    InvalidNoise(String),

    /// A state description is unusable for the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The requested solver mode cannot handle the assembled generator.
    #[error("solver mode unavailable: {0}")]
    InvalidSolverMode(String),

    /// Positional pulse index out of range.
    #[error("pulse index {index} out of range for {len} pulses")]
    PulseIndex {
        /// Offending index.
        index: usize,
        /// Number of pulses held.
        len: usize,
    },

    /// The integration was aborted through its abort flag.
    #[error("integration aborted")]
    Aborted,

    /// Pulse table I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pulse table could not be parsed.
    #[error("pulse table parse error on line {line}: {message}")]
    TableParse {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// `.npy` pulse table could not be read.
    #[error("npy read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// `.npy` pulse table could not be written.
    #[error("npy write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    /// Configuration could not be deserialized.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl SimError {
    pub(crate) fn dims<E, F>(context: &str, expected: E, found: F) -> Self
    where
        E: std::fmt::Debug,
        F: std::fmt::Debug,
    {
        Self::DimensionMismatch {
            context: context.to_string(),
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }
}

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, SimError>;
