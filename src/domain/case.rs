//! Case catalogue - the static description of what each experiment searches for.
//!
//! A case names its parameter space shape, how to start, and (for mock mode)
//! the device truth the simulator reports against. `CaseSpec::validate` is the
//! one schema check shared by CLI overrides and decision-panel proposals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::params::{ExperimentParams, ParamValue};

/// Error code emitted when a ranged guess is above the device limit.
pub const CODE_TOO_HIGH: &str = "TOO_HIGH";
/// Error code emitted when a ranged guess is below the device limit.
pub const CODE_TOO_LOW: &str = "TOO_LOW";
/// Error code emitted when a discrete configuration does not match the device.
pub const CODE_MISMATCH: &str = "FRAMING_MISMATCH";

/// Shape of a case's parameter space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchSpace {
    /// Integer search over `[min, max]`; bounds travel as `<key>_lo` / `<key>_hi`.
    Range { key: String, min: i64, max: i64 },
    /// Ordered discrete options, tried in list order.
    Choice { key: String, options: Vec<ParamValue> },
    /// Firmware-reported signature over `"<payload>|0x%08X"`.
    Signature { key: String, payload: String },
}

impl SearchSpace {
    /// The primary tunable this space searches over.
    pub fn key(&self) -> &str {
        match self {
            SearchSpace::Range { key, .. } => key,
            SearchSpace::Choice { key, .. } => key,
            SearchSpace::Signature { key, .. } => key,
        }
    }

    pub fn lo_key(&self) -> String {
        format!("{}_lo", self.key())
    }

    pub fn hi_key(&self) -> String {
        format!("{}_hi", self.key())
    }

    /// Parameter names this space owns.
    pub fn owned_keys(&self) -> Vec<String> {
        match self {
            SearchSpace::Range { key, .. } => vec![key.clone(), self.lo_key(), self.hi_key()],
            _ => vec![self.key().to_string()],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SearchSpace::Range { key, min, max } => format!("{} in [{}, {}]", key, min, max),
            SearchSpace::Choice { key, options } => {
                let opts: Vec<String> = options.iter().map(|o| o.to_string()).collect();
                format!("{} in {{{}}}", key, opts.join(", "))
            }
            SearchSpace::Signature { key, payload } => {
                format!("{} (u32) signed over '{}|0x%08X'", key, payload)
            }
        }
    }
}

/// Static description of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSpec {
    /// Case identifier (filled from the config map key when loaded from YAML)
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub search: SearchSpace,

    /// Parameters applied over the derived starting point
    #[serde(default)]
    pub initial: ExperimentParams,

    /// Extra parameter names accepted alongside the search keys
    #[serde(default)]
    pub extra_keys: Vec<String>,

    /// Device truth used by the simulator in mock mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_target: Option<ParamValue>,
}

impl CaseSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>, search: SearchSpace) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            search,
            initial: ExperimentParams::new(),
            extra_keys: Vec::new(),
            mock_target: None,
        }
    }

    pub fn with_mock_target(mut self, target: impl Into<ParamValue>) -> Self {
        self.mock_target = Some(target.into());
        self
    }

    pub fn with_initial(mut self, initial: ExperimentParams) -> Self {
        self.initial = initial;
        self
    }

    /// Parameters for the first attempt.
    pub fn initial_params(&self) -> ExperimentParams {
        let derived = match &self.search {
            SearchSpace::Range { key, min, max } => ExperimentParams::new()
                .with(key.clone(), min + (max - min) / 2)
                .with(self.search.lo_key(), *min)
                .with(self.search.hi_key(), *max),
            SearchSpace::Choice { key, options } => match options.first() {
                Some(first) => ExperimentParams::new().with(key.clone(), first.clone()),
                None => ExperimentParams::new(),
            },
            SearchSpace::Signature { key, .. } => ExperimentParams::new().with(key.clone(), 0),
        };
        derived.merged(&self.initial)
    }

    /// Check a full parameter set against this case's schema.
    pub fn validate(&self, params: &ExperimentParams) -> Result<(), String> {
        let owned = self.search.owned_keys();
        for key in params.keys() {
            if !owned.contains(key) && !self.extra_keys.contains(key) {
                return Err(format!("unknown parameter '{}' for case '{}'", key, self.id));
            }
        }

        match &self.search {
            SearchSpace::Range { key, min, max } => {
                let guess = require_int(params, key)?;
                check_range(key, guess, *min, *max)?;
                let lo = params.get_int(&self.search.lo_key());
                let hi = params.get_int(&self.search.hi_key());
                if let Some(lo) = lo {
                    check_range(&self.search.lo_key(), lo, *min, *max)?;
                }
                if let Some(hi) = hi {
                    check_range(&self.search.hi_key(), hi, *min, *max)?;
                }
                if let (Some(lo), Some(hi)) = (lo, hi) {
                    if lo > hi {
                        return Err(format!("search bounds inverted: {} > {}", lo, hi));
                    }
                }
                Ok(())
            }
            SearchSpace::Choice { key, options } => {
                let value = params
                    .get(key)
                    .ok_or_else(|| format!("missing required parameter '{}'", key))?;
                if options.contains(value) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not an allowed value for '{}'", value, key))
                }
            }
            SearchSpace::Signature { key, .. } => {
                let value = require_int(params, key)?;
                check_range(key, value, 0, u32::MAX as i64)
            }
        }
    }
}

fn require_int(params: &ExperimentParams, key: &str) -> Result<i64, String> {
    match params.get(key) {
        Some(ParamValue::Int(v)) => Ok(*v),
        Some(other) => Err(format!("parameter '{}' must be an integer, got '{}'", key, other)),
        None => Err(format!("missing required parameter '{}'", key)),
    }
}

fn check_range(key: &str, value: i64, min: i64, max: i64) -> Result<(), String> {
    if value < min || value > max {
        Err(format!("parameter '{}'={} outside [{}, {}]", key, value, min, max))
    } else {
        Ok(())
    }
}

/// Cases known without any configuration.
pub fn builtin_cases() -> BTreeMap<String, CaseSpec> {
    let bauds: Vec<ParamValue> = [1_000_000, 921_600, 460_800, 230_400, 115_200, 57_600, 38_400, 19_200, 9_600]
        .into_iter()
        .map(ParamValue::Int)
        .collect();
    let frames: Vec<ParamValue> = ["8N1", "8E1", "8O1", "7E1", "7O1", "8N2"]
        .into_iter()
        .map(ParamValue::from)
        .collect();
    let parities: Vec<ParamValue> = ["none", "even", "odd"].into_iter().map(ParamValue::from).collect();

    let cases = vec![
        CaseSpec::new(
            "rate_hunt",
            "Find the highest stable link rate; device reports TOO_HIGH/TOO_LOW",
            SearchSpace::Range {
                key: "guess_rate".into(),
                min: 1,
                max: 100,
            },
        )
        .with_mock_target(42),
        CaseSpec::new(
            "baud_hunt",
            "Find the UART baud rate the firmware was built with",
            SearchSpace::Choice {
                key: "guess_baud".into(),
                options: bauds,
            },
        )
        .with_mock_target(115_200),
        CaseSpec::new(
            "framing_hunt",
            "Find the data/parity/stop framing the firmware emits",
            SearchSpace::Choice {
                key: "guess_frame".into(),
                options: frames,
            },
        )
        .with_mock_target("7E1"),
        CaseSpec::new(
            "parity_hunt",
            "Find the parity setting the firmware emits",
            SearchSpace::Choice {
                key: "guess_parity".into(),
                options: parities,
            },
        )
        .with_mock_target("even"),
        CaseSpec::new(
            "signature_check",
            "Verify the firmware's MAGIC/CRC signature against the expected magic",
            SearchSpace::Signature {
                key: "guess_magic".into(),
                payload: "PING_SEQ_001".into(),
            },
        )
        .with_mock_target(0xC0FF_EE42_i64),
    ];

    cases.into_iter().map(|c| (c.id.clone(), c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_case() -> CaseSpec {
        builtin_cases().remove("rate_hunt").unwrap()
    }

    #[test]
    fn test_builtin_cases_present() {
        let cases = builtin_cases();
        for id in ["rate_hunt", "baud_hunt", "framing_hunt", "parity_hunt", "signature_check"] {
            let case = cases.get(id).unwrap();
            assert_eq!(case.id, id);
            assert!(case.mock_target.is_some());
        }
    }

    #[test]
    fn test_range_initial_params_midpoint() {
        let params = rate_case().initial_params();
        assert_eq!(params.get_int("guess_rate"), Some(50));
        assert_eq!(params.get_int("guess_rate_lo"), Some(1));
        assert_eq!(params.get_int("guess_rate_hi"), Some(100));
    }

    #[test]
    fn test_initial_override_applies() {
        let case = rate_case().with_initial(ExperimentParams::new().with("guess_rate", 10));
        assert_eq!(case.initial_params().get_int("guess_rate"), Some(10));
    }

    #[test]
    fn test_validate_range() {
        let case = rate_case();
        assert!(case.validate(&case.initial_params()).is_ok());
        assert!(case.validate(&ExperimentParams::new().with("guess_rate", 0)).is_err());
        assert!(case.validate(&ExperimentParams::new().with("guess_rate", "fast")).is_err());
        assert!(case.validate(&ExperimentParams::new()).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let case = rate_case();
        let params = case.initial_params().with("buffer_size", 64);
        let err = case.validate(&params).unwrap_err();
        assert!(err.contains("unknown parameter 'buffer_size'"));
    }

    #[test]
    fn test_validate_inverted_bounds() {
        let case = rate_case();
        let params = case.initial_params().with("guess_rate_lo", 60).with("guess_rate_hi", 40);
        assert!(case.validate(&params).is_err());
    }

    #[test]
    fn test_validate_choice() {
        let case = builtin_cases().remove("framing_hunt").unwrap();
        assert!(case.validate(&ExperimentParams::new().with("guess_frame", "8E1")).is_ok());
        assert!(case.validate(&ExperimentParams::new().with("guess_frame", "9X9")).is_err());
    }

    #[test]
    fn test_validate_signature_range() {
        let case = builtin_cases().remove("signature_check").unwrap();
        assert!(case.validate(&ExperimentParams::new().with("guess_magic", 0xC0FFEE42_i64)).is_ok());
        assert!(case.validate(&ExperimentParams::new().with("guess_magic", -1)).is_err());
        assert!(case.validate(&ExperimentParams::new().with("guess_magic", 1_i64 << 33)).is_err());
    }

    #[test]
    fn test_case_spec_from_yaml() {
        let yaml = r#"
description: custom
search:
  kind: range
  key: buffer_size
  min: 16
  max: 512
mock_target: 128
"#;
        let case: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(case.search.key(), "buffer_size");
        assert_eq!(case.mock_target, Some(ParamValue::Int(128)));
        assert_eq!(case.initial_params().get_int("buffer_size"), Some(264));
    }
}
