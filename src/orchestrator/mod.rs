//! Run orchestrator module - the experiment loop and its artifacts.
//!
//! - `run`: the attempt state machine and stop conditions
//! - `build`: firmware build stage (placeholder or shell command)
//! - `bundle`: write-once evidence directory per attempt
//! - `triage`: human-readable notes written into each bundle

pub mod build;
pub mod bundle;
mod run;
pub mod triage;

pub use build::{ArtifactRef, BuildArtifacts, BuildRequest, CommandBuilder, FirmwareBuilder, PlaceholderBuilder};
pub use bundle::{Manifest, RunBundle};
pub use run::{AttemptSummary, ProgressFn, RunFailure, RunMode, RunOrchestrator, RunOutcome, StopReason};
