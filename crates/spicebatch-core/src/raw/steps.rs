//! Step information for stepped (`.step`) runs
//!
//! The simulator records the parameter values of each step in the log file
//! written next to the raw file, one `.step` line per step. The raw file only
//! carries the concatenated samples, so step boundaries are recovered from
//! the points where the axis restarts at its first value.

use crate::types::{Result, SpiceError};
use indexmap::IndexMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Value of a stepped parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    /// Values that are not plain numbers, e.g. `25°C` for temperature steps
    Text(String),
}

impl ParamValue {
    pub fn parse(s: &str) -> Self {
        match s.parse::<f64>() {
            Ok(v) => ParamValue::Number(v),
            Err(_) => ParamValue::Text(s.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::parse(s)
    }
}

/// Parameters of one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    pub index: usize,
    pub params: IndexMap<String, ParamValue>,
}

impl StepInfo {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            params: IndexMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Placeholder information for a step with no recorded parameters
    pub(crate) fn run(index: usize) -> Self {
        Self::new(index).with_param("run", (index + 1) as f64)
    }

    fn matches(&self, query: &[(&str, ParamValue)]) -> bool {
        query
            .iter()
            .all(|(key, value)| self.params.get(*key) == Some(value))
    }
}

/// Companion log path of a raw file
pub fn log_path_for(raw: &Path) -> PathBuf {
    raw.with_extension("log")
}

/// Decode log bytes, which are UTF-16LE on recent simulator versions
pub(crate) fn decode_log(bytes: &[u8]) -> String {
    let utf16 = bytes.starts_with(&[0xFF, 0xFE])
        || (bytes.len() >= 4 && bytes[1] == 0 && bytes[3] == 0);
    if utf16 {
        let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Parse every `.step` line of a log
pub fn parse_step_log(text: &str) -> Result<Vec<StepInfo>> {
    let mut steps = Vec::new();

    for line in text.lines() {
        let line = line.trim_end();
        let Some(rest) = line.strip_prefix(".step") else {
            continue;
        };

        let mut info = StepInfo::new(steps.len());
        for token in rest.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                SpiceError::Parse(format!("malformed step token '{}' in '{}'", token, line))
            })?;
            info.params
                .insert(key.to_string(), ParamValue::parse(value.trim()));
        }
        steps.push(info);
    }

    if steps.is_empty() {
        return Err(SpiceError::Parse("log has no .step lines".into()));
    }

    Ok(steps)
}

/// Read step information from a log file
pub fn read_step_log(path: &Path) -> Result<Vec<StepInfo>> {
    let bytes = fs::read(path)?;
    let steps = parse_step_log(&decode_log(&bytes))?;
    debug!(path = %path.display(), steps = steps.len(), "Step log loaded");
    Ok(steps)
}

/// Render step information as log lines
pub fn render_step_log(title: &str, steps: &[StepInfo]) -> String {
    let mut out = format!("Circuit: {}\n\n", title);
    for step in steps {
        let params: Vec<String> = step
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(".step ");
        out.push_str(&params.join(" "));
        out.push('\n');
    }
    out
}

/// Start offsets of each step: positions where the axis equals its first value
pub fn detect_step_offsets(axis: &[f64]) -> Vec<usize> {
    let Some(&first) = axis.first() else {
        return vec![0];
    };
    let mut offsets = vec![0];
    offsets.extend(
        axis.iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &v)| v == first)
            .map(|(i, _)| i),
    );
    offsets
}

/// Indices of the steps matching every `(parameter, value)` pair
pub fn find_steps(steps: &[StepInfo], query: &[(&str, ParamValue)]) -> Vec<usize> {
    steps
        .iter()
        .filter(|s| s.matches(query))
        .map(|s| s.index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_lines() {
        let log = "Circuit: * test\n\n.step r1=1000 temp=25°C\n.step r1=2000 temp=25°C\nDate: x\n";
        let steps = parse_step_log(log).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].get("r1"), Some(&ParamValue::Number(2000.0)));
        assert_eq!(
            steps[0].get("temp"),
            Some(&ParamValue::Text("25°C".to_string()))
        );
    }

    #[test]
    fn test_no_step_lines_is_error() {
        assert!(parse_step_log("Circuit: nothing here\n").is_err());
    }

    #[test]
    fn test_malformed_token_is_error() {
        assert!(parse_step_log(".step r1\n").is_err());
    }

    #[test]
    fn test_decode_utf16_log() {
        let bytes: Vec<u8> = ".step a=1\n"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let steps = parse_step_log(&decode_log(&bytes)).unwrap();
        assert_eq!(steps[0].get("a"), Some(&ParamValue::Number(1.0)));
    }

    #[test]
    fn test_detect_offsets() {
        let axis = [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.5];
        assert_eq!(detect_step_offsets(&axis), vec![0, 3, 6]);
        assert_eq!(detect_step_offsets(&[]), vec![0]);
    }

    #[test]
    fn test_find_steps() {
        let steps = vec![
            StepInfo::new(0).with_param("r1", 1.0).with_param("c1", 2.0),
            StepInfo::new(1).with_param("r1", 1.0).with_param("c1", 3.0),
            StepInfo::new(2).with_param("r1", 5.0).with_param("c1", 3.0),
        ];
        assert_eq!(find_steps(&steps, &[("r1", 1.0.into())]), vec![0, 1]);
        assert_eq!(find_steps(&steps, &[("c1", 3.0.into()), ("r1", 5.0.into())]), vec![2]);
        assert!(find_steps(&steps, &[("l1", 1.0.into())]).is_empty());
    }

    #[test]
    fn test_render_round_trip() {
        let steps = vec![StepInfo::run(0), StepInfo::run(1)];
        let parsed = parse_step_log(&render_step_log("* t", &steps)).unwrap();
        assert_eq!(parsed, steps);
    }
}
