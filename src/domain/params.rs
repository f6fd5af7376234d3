//! Experiment parameters
//!
//! An immutable, ordered mapping of named tunables for one attempt. Updates
//! never mutate in place; `with`/`merged` hand back a new set so an attempt's
//! parameters stay exactly as they were when it started.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single tunable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Text(String),
}

impl ParamValue {
    /// Parse an override/proposal token: decimal, `0x` hex, or free text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let unquoted = raw.trim_matches(|c| c == '\'' || c == '"');
        if unquoted.len() != raw.len() {
            return ParamValue::Text(unquoted.to_string());
        }
        if let Ok(v) = raw.parse::<i64>() {
            return ParamValue::Int(v);
        }
        let hex = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"));
        match hex.map(|h| i64::from_str_radix(h, 16)) {
            Some(Ok(v)) => ParamValue::Int(v),
            _ => ParamValue::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            ParamValue::Int(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Named tunables for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentParams(BTreeMap<String, ParamValue>);

impl ExperimentParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let mut next = self.0.clone();
        next.insert(key.into(), value.into());
        Self(next)
    }

    /// Return a copy where every key in `other` replaces ours.
    pub fn merged(&self, other: &ExperimentParams) -> Self {
        let mut next = self.0.clone();
        for (k, v) in &other.0 {
            next.insert(k.clone(), v.clone());
        }
        Self(next)
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(ParamValue::as_int)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ParamValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `key=value` override arguments.
    pub fn from_overrides<S: AsRef<str>>(pairs: &[S]) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("override '{}' is not of the form key=value", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("override '{}' has an empty key", pair));
            }
            map.insert(key.to_string(), ParamValue::parse(value));
        }
        Ok(Self(map))
    }
}

impl FromIterator<(String, ParamValue)> for ExperimentParams {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ExperimentParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", body.join(", "))
    }
}

/// Extract every dict-literal proposal from bullet lines such as
/// `- {'guess_rate': 42, 'mode': "fast"}`.
///
/// Lines that are not bullets, or whose braces do not parse, are skipped.
pub fn parse_proposals(text: &str) -> Vec<ExperimentParams> {
    let mut out = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        let Some(body) = stripped.strip_prefix('-').or_else(|| stripped.strip_prefix('*')) else {
            continue;
        };
        let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
            continue;
        };
        if end <= start {
            continue;
        }
        if let Some(params) = parse_dict_literal(&body[start + 1..end]) {
            out.push(params);
        }
    }
    out
}

fn parse_dict_literal(inner: &str) -> Option<ExperimentParams> {
    let mut map = BTreeMap::new();
    for entry in inner.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry.split_once(':')?;
        let key = key.trim().trim_matches(|c| c == '\'' || c == '"').trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        map.insert(key.to_string(), ParamValue::parse(value));
    }
    if map.is_empty() { None } else { Some(ExperimentParams(map)) }
}
