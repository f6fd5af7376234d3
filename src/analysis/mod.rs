//! Evidence analysis - pass/fail and metrics derived from a transcript.

mod analyzer;
pub mod signature;

pub use analyzer::{AnalysisResult, Analyzer, EVIDENCE_TIMEOUT_CODE, SemanticCheck, analyze};
pub use signature::{SignatureEvidence, check_signature, crc32, expected_crc};
