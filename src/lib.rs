//! hilloop - a hardware-in-the-loop bring-up loop
//!
//! Each attempt builds firmware, flashes the target, captures its serial
//! output, analyzes the evidence and asks a five-role decision panel for the
//! next experiment, until a configuration passes or attempts run out.

pub mod analysis;
pub mod config;
pub mod domain;
pub mod error;
pub mod flash;
pub mod id;
pub mod orchestrator;
pub mod panel;
pub mod serial;

pub use error::{HilError, Result};
