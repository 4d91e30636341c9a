#![allow(non_snake_case)]

//! Pulse-level simulation of finite-level quantum registers.
//!
//! Control pulses and drift terms are collected by a [`Processor`], folded
//! together with noise models into a time-dependent [`Generator`] plus
//! dissipators, and evolved with one of the [`SolverMode`]s.

pub mod error;
pub mod linalg;
pub mod hilbert;
pub mod pulse;
pub mod noise;
pub mod generator;
pub mod evolve;
pub mod processor;
pub mod table;
pub mod config;
pub mod gates;

pub use error::{ SimError, SimResult };
pub use hilbert::{ Operator, State };
pub use pulse::{ Pulse, SplineKind };
pub use noise::{
    ControlAmplitude,
    Decoherence,
    Dissipator,
    NoiseSource,
    RandomAmplitude,
    Relaxation,
};
pub use generator::Generator;
pub use evolve::{ EvolutionResult, SolverMode, SolverOptions };
pub use processor::{ Processor, PulseHandle };
pub use config::ProcessorConfig;
