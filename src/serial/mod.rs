//! Serial truth capture
//!
//! - `discovery`: finding the device endpoint and waiting out re-enumeration
//! - `capture`: deadline-bounded, timestamped line acquisition
//! - `simulator`: the protocol-exact stand-in used in mock mode

pub mod capture;
pub mod discovery;
pub mod simulator;

pub use capture::{
    CaptureReport, CaptureRequest, DeviceLineSource, LineSource, ScriptedLines, SerialPortCapture, TruthCapture,
    capture, handshake,
};
pub use discovery::PortDiscovery;
pub use simulator::DeviceSimulator;
