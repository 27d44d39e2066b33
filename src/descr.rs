//! Descriptor records
//!
//! The descriptor is the single source of truth for a job across runner
//! invocations: one self-describing record per `results/<hsh>/descr` file,
//! newline-terminated. Value types are bounded (strings, integers, floats,
//! ordered sequences, string sets, mappings); unknown fields are rejected
//! and nothing in a descriptor is ever executed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Name of the descriptor file inside a results directory
pub const DESCR_FILE: &str = "descr";

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Virgin,
    Running,
    Success,
    Fail,
}

impl RunState {
    /// Terminal states are never left without an explicit rerun
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Success | RunState::Fail)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Virgin => "VIRGIN",
            RunState::Running => "RUNNING",
            RunState::Success => "SUCCESS",
            RunState::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// A typed parameter value
///
/// Stringification (for command substitution) follows `Display`; numeric
/// equality is used when matching `desc:k=v` references, so `2` and `2.0`
/// compare equal there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Numeric view, for value comparisons in reference filters
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Str(s) => s.parse().ok(),
            ParamValue::List(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Parameter mapping, ordered by key for stable serialization
pub type Params = BTreeMap<String, ParamValue>;

/// Persisted metadata for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    pub description: String,
    pub working_dir: String,
    /// Hashes of every experiment this one reads from
    pub deps: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Command after template expansion, output-slot substitution and the
    /// log tee suffix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_code: Option<String>,
    pub commit: String,
    /// Submission time, float epoch seconds
    pub date: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_end: Option<f64>,
    pub params: Params,
    pub run_state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    /// Hash of the result tree this job was imported from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<String>,
}

impl Descriptor {
    /// Fresh VIRGIN descriptor stamped with the current time
    pub fn new(
        description: impl Into<String>,
        working_dir: impl Into<String>,
        commit: impl Into<String>,
        params: Params,
    ) -> Self {
        Descriptor {
            description: description.into(),
            working_dir: working_dir.into(),
            deps: BTreeSet::new(),
            command: None,
            code: None,
            final_command: None,
            final_code: None,
            commit: commit.into(),
            date: now(),
            date_end: None,
            params,
            run_state: RunState::Virgin,
            return_code: None,
            import: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.run_state == RunState::Success
    }

    pub fn is_failure(&self) -> bool {
        self.run_state == RunState::Fail
    }
}

/// Current time as float epoch seconds, the descriptor date format
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
