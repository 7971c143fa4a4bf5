use kube::api::DynamicObject;
use kube::Resource;

/// What the reconciler has to do for a CR this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseState {
    AlreadyUninstalled,
    NeedsInstall,
    NeedsUpgrade,
    NeedsUninstall,
    Unchanged,
}

/// Deletion handling is decided purely from the CR: a deletion timestamp
/// with our finalizer still present means the release must be
/// uninstalled; without it, cleanup already happened (or never applied).
pub fn deletion_state(cr: &DynamicObject, finalizer: &str) -> Option<ReleaseState> {
    if cr.meta().deletion_timestamp.is_none() {
        return None;
    }
    if has_finalizer(cr, finalizer) {
        Some(ReleaseState::NeedsUninstall)
    } else {
        Some(ReleaseState::AlreadyUninstalled)
    }
}

pub fn has_finalizer(cr: &DynamicObject, finalizer: &str) -> bool {
    cr.meta()
        .finalizers
        .as_ref()
        .map(|fs| fs.iter().any(|f| f == finalizer))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    const FINALIZER: &str = "helm.sdk.operatorframework.io/uninstall-release";

    fn cr(deleted: bool, finalizers: &[&str]) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "demo.helmop.dev/v1alpha1",
            "kind": "Nginx",
            "metadata": {"name": "test", "namespace": "default"},
        }))
        .unwrap();
        if deleted {
            obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        if !finalizers.is_empty() {
            obj.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        obj
    }

    #[test]
    fn live_resources_have_no_deletion_state() {
        assert_eq!(deletion_state(&cr(false, &[]), FINALIZER), None);
        assert_eq!(deletion_state(&cr(false, &[FINALIZER]), FINALIZER), None);
    }

    #[test]
    fn deleted_with_finalizer_needs_uninstall() {
        assert_eq!(
            deletion_state(&cr(true, &[FINALIZER]), FINALIZER),
            Some(ReleaseState::NeedsUninstall)
        );
        assert_eq!(
            deletion_state(&cr(true, &["other", FINALIZER]), FINALIZER),
            Some(ReleaseState::NeedsUninstall)
        );
    }

    #[test]
    fn deleted_without_finalizer_is_already_uninstalled() {
        assert_eq!(
            deletion_state(&cr(true, &[]), FINALIZER),
            Some(ReleaseState::AlreadyUninstalled)
        );
        assert_eq!(
            deletion_state(&cr(true, &["other"]), FINALIZER),
            Some(ReleaseState::AlreadyUninstalled)
        );
    }
}
