use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a cluster record.
///
/// The set is closed: every status a record can carry is one of these
/// variants, and parsing anything else fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    New,
    Deploying,
    Created,
    CreationFailed,
    Terminating,
    Terminated,
    TerminationFailed,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 7] = [
        Self::New,
        Self::Deploying,
        Self::Created,
        Self::CreationFailed,
        Self::Terminating,
        Self::Terminated,
        Self::TerminationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Deploying => "Deploying",
            Self::Created => "Created",
            Self::CreationFailed => "CreationFailed",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::TerminationFailed => "TerminationFailed",
        }
    }

    /// `Deploying` or `Terminating`.
    pub fn is_in_transition(&self) -> bool {
        matches!(self, Self::Deploying | Self::Terminating)
    }

    /// The cluster exists on the provider side and is serving.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Created)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::CreationFailed | Self::TerminationFailed)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    /// Case-insensitive. `running` is accepted as the provider-side spelling
    /// of `Created`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "");
        match normalized.as_str() {
            "new" => Ok(Self::New),
            "deploying" => Ok(Self::Deploying),
            "created" | "running" => Ok(Self::Created),
            "creationfailed" => Ok(Self::CreationFailed),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "terminationfailed" => Ok(Self::TerminationFailed),
            _ => Err(format!("Invalid cluster status: {}", s)),
        }
    }
}
