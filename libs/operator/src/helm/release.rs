use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored release revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
    Uninstalling,
    Uninstalled,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }

    pub fn is_deployed(&self) -> bool {
        matches!(self, ReleaseStatus::Deployed)
    }
}

impl Display for ReleaseStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, versioned deployment of a chart.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub version: i32,
    pub chart_name: String,
    pub chart_version: String,
    /// The rendered, post-rendered multi-document manifest.
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_serializes_in_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ReleaseStatus::PendingInstall).unwrap(),
            "\"pending-install\""
        );
        assert_eq!(ReleaseStatus::PendingUpgrade.as_str(), "pending-upgrade");
        assert!(ReleaseStatus::Deployed.is_deployed());
        assert!(!ReleaseStatus::Superseded.is_deployed());
    }
}
