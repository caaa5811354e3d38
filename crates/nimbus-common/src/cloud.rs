use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The cloud backend that owns a cluster record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudKind {
    /// Self-managed control plane on EC2.
    Aws,
    /// Self-managed control plane on Azure VMs.
    Azure,
    /// Self-managed control plane on Compute Engine.
    Gcp,
    /// Amazon Elastic Kubernetes Service.
    Eks,
    /// Azure Kubernetes Service.
    Aks,
    /// Google Kubernetes Engine.
    Gke,
}

impl CloudKind {
    pub const ALL: [CloudKind; 6] = [
        Self::Aws,
        Self::Azure,
        Self::Gcp,
        Self::Eks,
        Self::Aks,
        Self::Gke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::Eks => "eks",
            Self::Aks => "aks",
            Self::Gke => "gke",
        }
    }
}

impl std::fmt::Display for CloudKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "eks" => Ok(Self::Eks),
            "aks" => Ok(Self::Aks),
            "gke" => Ok(Self::Gke),
            _ => Err(format!("Invalid cloud kind: {}", s)),
        }
    }
}
