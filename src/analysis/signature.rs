//! Signature contract shared with the signature-check firmware.
//!
//! The firmware prints `MAGIC=0x%08X` and `CRC=0x%08X`, where the CRC is the
//! IEEE CRC-32 (reflected, poly 0xEDB88320) of `"<payload>|0x%08X"` formatted
//! with the magic. The analyzer recomputes the same value from the expected
//! parameters so a pass is a property of the evidence itself.

use serde::{Deserialize, Serialize};

use crate::domain::TranscriptLine;

const CRC32_POLY: u32 = 0xEDB8_8320;

/// Bitwise CRC-32, identical to the firmware's `crc32_bytes`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (CRC32_POLY & mask);
        }
    }
    !crc
}

/// The message the firmware signs for a given magic.
pub fn signed_message(payload: &str, magic: u32) -> String {
    format!("{}|0x{:08X}", payload, magic)
}

/// Expected CRC for `magic` under the firmware contract.
pub fn expected_crc(payload: &str, magic: u32) -> u32 {
    crc32(signed_message(payload, magic).as_bytes())
}

/// What the transcript reported versus what the parameters predict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEvidence {
    pub expected_magic: Option<u32>,
    pub expected_crc: Option<u32>,
    pub reported_magic: Option<u32>,
    pub reported_crc: Option<u32>,
    /// Reported CRC matches the reported magic (the device is internally consistent)
    pub self_consistent: bool,
    pub valid: bool,
}

fn parse_hex_field(line: &str, prefix: &str) -> Option<u32> {
    let value = line.trim().strip_prefix(prefix)?;
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).ok()
}

/// Evaluate the signature lines of a transcript against an expected magic.
pub fn check_signature(lines: &[TranscriptLine], payload: &str, expected_magic: Option<u32>) -> SignatureEvidence {
    let mut reported_magic = None;
    let mut reported_crc = None;
    for l in lines {
        if let Some(v) = parse_hex_field(&l.line, "MAGIC=") {
            reported_magic = Some(v);
        } else if let Some(v) = parse_hex_field(&l.line, "CRC=") {
            reported_crc = Some(v);
        }
    }

    let expected_crc = expected_magic.map(|m| self::expected_crc(payload, m));
    let self_consistent = match (reported_magic, reported_crc) {
        (Some(m), Some(c)) => self::expected_crc(payload, m) == c,
        _ => false,
    };
    let valid = expected_magic.is_some()
        && reported_magic.is_some()
        && reported_crc.is_some()
        && reported_magic == expected_magic
        && reported_crc == expected_crc;

    SignatureEvidence {
        expected_magic,
        expected_crc,
        reported_magic,
        reported_crc,
        self_consistent,
        valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lines(raw: &[&str]) -> Vec<TranscriptLine> {
        raw.iter()
            .map(|l| TranscriptLine {
                ts: Utc::now(),
                line: l.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_crc32_check_value() {
        // Standard CRC-32/ISO-HDLC check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_signed_message_format() {
        assert_eq!(signed_message("PING_SEQ_001", 0xC0FFEE42), "PING_SEQ_001|0xC0FFEE42");
        assert_eq!(signed_message("P", 0x2a), "P|0x0000002A");
    }

    #[test]
    fn test_check_signature_valid() {
        let crc = expected_crc("PING_SEQ_001", 0xC0FFEE42);
        let magic_line = "MAGIC=0xC0FFEE42".to_string();
        let crc_line = format!("CRC=0x{:08X}", crc);
        let ev = check_signature(
            &lines(&["RUN_START s", &magic_line, &crc_line, "RUN_END s"]),
            "PING_SEQ_001",
            Some(0xC0FFEE42),
        );
        assert!(ev.valid);
        assert!(ev.self_consistent);
        assert_eq!(ev.reported_magic, Some(0xC0FFEE42));
    }

    #[test]
    fn test_check_signature_wrong_expectation() {
        let crc = expected_crc("PING_SEQ_001", 0xC0FFEE42);
        let crc_line = format!("CRC=0x{:08X}", crc);
        let ev = check_signature(
            &lines(&["MAGIC=0xC0FFEE42", &crc_line]),
            "PING_SEQ_001",
            Some(0xDEADBEEF),
        );
        assert!(!ev.valid);
        assert!(ev.self_consistent);
    }

    #[test]
    fn test_check_signature_missing_lines() {
        let ev = check_signature(&lines(&["RUN_START s", "RUN_END s"]), "PING_SEQ_001", Some(1));
        assert!(!ev.valid);
        assert!(!ev.self_consistent);
        assert_eq!(ev.reported_crc, None);
    }

    #[test]
    fn test_check_signature_corrupt_crc() {
        let ev = check_signature(&lines(&["MAGIC=0x00000001", "CRC=0x00000000"]), "PING_SEQ_001", Some(1));
        assert!(!ev.valid);
        assert!(!ev.self_consistent);
    }
}
