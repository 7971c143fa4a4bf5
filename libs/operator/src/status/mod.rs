pub mod updater;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};

pub const REASON_INSTALL_SUCCESSFUL: &str = "InstallSuccessful";
pub const REASON_UPGRADE_SUCCESSFUL: &str = "UpgradeSuccessful";
pub const REASON_UNINSTALL_SUCCESSFUL: &str = "UninstallSuccessful";
pub const REASON_INSTALL_ERROR: &str = "InstallError";
pub const REASON_UPGRADE_ERROR: &str = "UpgradeError";
pub const REASON_UNINSTALL_ERROR: &str = "UninstallError";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

/// Recognized condition types. At most one condition per type is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Initialized,
    Deployed,
    ReleaseFailed,
    Irreconcilable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<Option<String>>,
        message: impl Into<Option<String>>,
    ) -> Self {
        Condition {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn initialized() -> Self {
        Condition::new(ConditionType::Initialized, ConditionStatus::True, None, None)
    }

    pub fn deployed(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Condition::new(
            ConditionType::Deployed,
            status,
            Some(reason.to_string()),
            Some(message.into()),
        )
    }

    pub fn release_failed(reason: &str, message: impl Into<String>) -> Self {
        Condition::new(
            ConditionType::ReleaseFailed,
            ConditionStatus::True,
            Some(reason.to_string()),
            Some(message.into()),
        )
    }

    pub fn release_succeeded() -> Self {
        Condition::new(
            ConditionType::ReleaseFailed,
            ConditionStatus::False,
            None,
            None,
        )
    }

    pub fn irreconcilable(message: impl Into<String>) -> Self {
        Condition::new(
            ConditionType::Irreconcilable,
            ConditionStatus::True,
            Some(REASON_RECONCILE_ERROR.to_string()),
            Some(message.into()),
        )
    }

    pub fn reconciled() -> Self {
        Condition::new(
            ConditionType::Irreconcilable,
            ConditionStatus::False,
            None,
            None,
        )
    }
}

/// The last release recorded as deployed for a CR.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedRelease {
    pub name: String,
    pub manifest: String,
}

/// Structured view over the free-form `status` of a watched CR.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmAppStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_release: Option<DeployedRelease>,
}

impl HelmAppStatus {
    /// Insert or update the condition of `cond.type_`.
    ///
    /// `lastTransitionTime` advances only when the status field changes;
    /// reason/message updates alone keep the previous transition time.
    /// Returns whether anything changed.
    pub fn set_condition(&mut self, mut cond: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status
                    && existing.reason == cond.reason
                    && existing.message == cond.message
                {
                    return false;
                }
                cond.last_transition_time = if existing.status == cond.status {
                    existing.last_transition_time
                } else {
                    Some(Utc::now())
                };
                *existing = cond;
                true
            }
            None => {
                cond.last_transition_time = Some(Utc::now());
                self.conditions.push(cond);
                true
            }
        }
    }

    pub fn remove_condition(&mut self, type_: ConditionType) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.type_ != type_);
        self.conditions.len() != before
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Extract the status view from a schemaless CR.
///
/// Tolerates an absent, malformed, or wrongly-typed `status`; callers
/// always get a usable value.
pub fn status_for(obj: &DynamicObject) -> HelmAppStatus {
    match obj.data.get("status") {
        Some(status) => serde_json::from_value(status.clone()).unwrap_or_default(),
        None => HelmAppStatus::default(),
    }
}
