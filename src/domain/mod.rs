//! Domain types for the experiment loop
//!
//! - `params`: immutable experiment parameters and proposal parsing
//! - `case`: static case descriptions and the parameter schema
//! - `transcript`: timestamped serial evidence and the line protocol
//! - `attempt`: one pass through the loop

pub mod attempt;
pub mod case;
pub mod params;
pub mod transcript;

pub use attempt::{Attempt, AttemptStatus, Stage};
pub use case::{CODE_MISMATCH, CODE_TOO_HIGH, CODE_TOO_LOW, CaseSpec, SearchSpace, builtin_cases};
pub use params::{ExperimentParams, ParamValue, parse_proposals};
pub use transcript::{LineKind, Transcript, TranscriptLine, classify, is_run_end_for};
