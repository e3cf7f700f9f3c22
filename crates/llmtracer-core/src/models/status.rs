//! Lifecycle status shared by traces and spans

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle status of a trace or span.
///
/// Transitions only move forward: `Open` to `Completed` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Started, no completion received yet
    #[default]
    Open,
    /// Completed normally
    Completed,
    /// Completed with an error
    Error,
}

impl RecordStatus {
    /// Storage/wire representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether a completion has already been applied
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(Error::validation(format!("unknown status '{other}'"))),
        }
    }
}
