use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dispatch priority of an issue. The scheduler orders ready issues by
/// priority descending, then identifier ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    /// Work that unblocks other issues; always dispatched first.
    Unblocker = 100,
}

impl Priority {
    pub fn value(self) -> u32 {
        self as u32
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "unblocker" => Ok(Priority::Unblocker),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Unblocker => "unblocker",
        })
    }
}
