use crate::error::{is_not_found, Error, Result};
use crate::helm::chart::{Chart, RenderContext};
use crate::helm::config::{ActionConfig, GvkResolver, ResolvedResource};
use crate::helm::release::{Release, ReleaseStatus};
use crate::helm::storage::ReleaseStorage;
use crate::helm::{gvk_of, parse_manifest, serialize_manifest};
use crate::values::Values;

use std::sync::Arc;

use chrono::Utc;
use json_patch::PatchOperation;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, trace, warn};

/// Field manager for server-side applied rendered objects.
pub const FIELD_MANAGER: &str = "helmop";

/// Knobs of the install action, mutated by options.
#[derive(Debug, Default)]
pub struct Install {
    pub disable_hooks: bool,
    pub description: Option<String>,
}

/// Knobs of the upgrade action, mutated by options.
#[derive(Debug, Default)]
pub struct Upgrade {
    pub disable_hooks: bool,
    pub force: bool,
    /// Render and return the candidate release without persisting or
    /// applying anything. Used for drift detection.
    pub dry_run: bool,
    pub description: Option<String>,
}

/// Knobs of the uninstall action, mutated by options.
#[derive(Debug, Default)]
pub struct Uninstall {
    pub disable_hooks: bool,
    pub description: Option<String>,
}

pub type InstallOption = Box<dyn Fn(&mut Install) + Send + Sync>;
pub type UpgradeOption = Box<dyn Fn(&mut Upgrade) + Send + Sync>;
pub type UninstallOption = Box<dyn Fn(&mut Uninstall) + Send + Sync>;

/// Per-CR facade over the release actions.
///
/// Every rendered manifest is post-rendered before it reaches the
/// cluster: namespace-scoped objects get an owner reference pointing at
/// the CR, cluster-scoped objects pass through unchanged (Kubernetes
/// forbids namespace→cluster ownership).
pub struct ActionClient {
    client: Client,
    resolver: Arc<GvkResolver>,
    storage: ReleaseStorage,
    namespace: String,
    owner: Option<OwnerReference>,
}

impl ActionClient {
    pub fn from_config(config: ActionConfig) -> Self {
        ActionClient {
            client: config.client,
            resolver: config.resolver,
            storage: config.storage,
            namespace: config.namespace,
            owner: config.owner,
        }
    }

    /// The current release, or [`Error::ReleaseNotFound`].
    pub async fn get(&self, name: &str) -> Result<Release> {
        let release = self.storage.latest(name).await?;
        if release.status == ReleaseStatus::Uninstalled {
            return Err(Error::ReleaseNotFound(name.to_string()));
        }
        Ok(release)
    }

    pub async fn install(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        options: &[InstallOption],
    ) -> Result<Release> {
        let mut action = Install::default();
        for opt in options {
            opt(&mut action);
        }
        match self.run_install(name, namespace, chart, values, &action).await {
            Ok(release) => Ok(release),
            Err(install_err) => {
                // A recorded partial release blocks any further install;
                // take the stricter cleanup path before surfacing the error.
                if self.storage.latest(name).await.is_ok() {
                    warn!(msg = "install failed with recorded release, uninstalling", release = %name);
                    match self.run_uninstall(name, &Uninstall::default()).await {
                        Ok(_) => Err(install_err),
                        Err(e) if e.is_release_not_found() => Err(install_err),
                        Err(e) => Err(Error::InstallCleanupError {
                            uninstall: e.to_string(),
                            install: install_err.to_string(),
                        }),
                    }
                } else {
                    Err(install_err)
                }
            }
        }
    }

    async fn run_install(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        action: &Install,
    ) -> Result<Release> {
        let version = self
            .storage
            .history(name)
            .await?
            .first()
            .map(|r| r.version)
            .unwrap_or(0)
            + 1;
        let context = RenderContext::install(name, namespace, version);
        let (manifest, notes) = self.render(chart, &context, values).await?;

        let now = Utc::now();
        let mut release = Release {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version,
            chart_name: chart.metadata.name.clone(),
            chart_version: chart.metadata.version.clone(),
            manifest,
            notes,
            status: ReleaseStatus::PendingInstall,
            description: action.description.clone(),
            first_deployed: now,
            last_deployed: now,
        };
        self.storage.create(&release).await?;

        match self.apply_manifest(&release.manifest, false).await {
            Ok(()) => {
                release.status = ReleaseStatus::Deployed;
                if release.description.is_none() {
                    release.description = Some("Install complete".to_string());
                }
                self.storage.update(&release).await?;
                Ok(release)
            }
            Err(e) => {
                release.status = ReleaseStatus::Failed;
                if let Err(update_err) = self.storage.update(&release).await {
                    warn!(msg = "failed to record failed install", release = %name, error = %update_err);
                }
                Err(e)
            }
        }
    }

    pub async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        options: &[UpgradeOption],
    ) -> Result<Release> {
        let mut action = Upgrade::default();
        for opt in options {
            opt(&mut action);
        }
        let existing = self.get(name).await?;
        let version = existing.version + 1;
        let context = RenderContext::upgrade(name, namespace, version);
        let (manifest, notes) = self.render(chart, &context, values).await?;

        let now = Utc::now();
        let mut release = Release {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version,
            chart_name: chart.metadata.name.clone(),
            chart_version: chart.metadata.version.clone(),
            manifest,
            notes,
            status: ReleaseStatus::PendingUpgrade,
            description: action.description.clone(),
            first_deployed: existing.first_deployed,
            last_deployed: now,
        };
        if action.dry_run {
            return Ok(release);
        }
        self.storage.create(&release).await?;

        match self.apply_manifest(&release.manifest, action.force).await {
            Ok(()) => {
                let mut superseded = existing;
                superseded.status = ReleaseStatus::Superseded;
                if let Err(e) = self.storage.update(&superseded).await {
                    warn!(msg = "failed to mark release superseded", release = %name, error = %e);
                }
                release.status = ReleaseStatus::Deployed;
                if release.description.is_none() {
                    release.description = Some("Upgrade complete".to_string());
                }
                self.storage.update(&release).await?;
                Ok(release)
            }
            Err(upgrade_err) => {
                release.status = ReleaseStatus::Failed;
                if let Err(e) = self.storage.update(&release).await {
                    warn!(msg = "failed to record failed upgrade", release = %name, error = %e);
                }
                // The attempt was recorded; roll the cluster back to the
                // last good revision.
                warn!(msg = "upgrade failed, rolling back", release = %name);
                match self.rollback(name).await {
                    Ok(_) => Err(upgrade_err),
                    Err(e) => Err(Error::RollbackError {
                        rollback: e.to_string(),
                        upgrade: upgrade_err.to_string(),
                    }),
                }
            }
        }
    }

    /// Re-apply the last good revision's manifest and record it as a new
    /// deployed revision.
    pub async fn rollback(&self, name: &str) -> Result<Release> {
        let history = self.storage.history(name).await?;
        let current = history
            .first()
            .ok_or_else(|| Error::ReleaseNotFound(name.to_string()))?;
        let target = history
            .iter()
            .find(|r| {
                r.version < current.version
                    && matches!(
                        r.status,
                        ReleaseStatus::Deployed | ReleaseStatus::Superseded
                    )
            })
            .ok_or_else(|| {
                Error::StorageError(format!("release {name} has no revision to roll back to"))
            })?;

        self.apply_manifest(&target.manifest, true).await?;

        let mut release = target.clone();
        release.version = current.version + 1;
        release.status = ReleaseStatus::Deployed;
        release.description = Some(format!("Rollback to {}", target.version));
        release.last_deployed = Utc::now();
        self.storage.create(&release).await?;

        let mut superseded = target.clone();
        superseded.status = ReleaseStatus::Superseded;
        if let Err(e) = self.storage.update(&superseded).await {
            warn!(msg = "failed to mark rolled-back release superseded", release = %name, error = %e);
        }
        Ok(release)
    }

    pub async fn uninstall(&self, name: &str, options: &[UninstallOption]) -> Result<Release> {
        let mut action = Uninstall::default();
        for opt in options {
            opt(&mut action);
        }
        self.run_uninstall(name, &action).await
    }

    async fn run_uninstall(&self, name: &str, action: &Uninstall) -> Result<Release> {
        let mut release = self.storage.latest(name).await?;
        if release.status == ReleaseStatus::Uninstalled {
            return Err(Error::ReleaseNotFound(name.to_string()));
        }
        release.status = ReleaseStatus::Uninstalling;
        if let Err(e) = self.storage.update(&release).await {
            warn!(msg = "failed to mark release uninstalling", release = %name, error = %e);
        }

        self.delete_manifest(&release.manifest).await?;

        release.status = ReleaseStatus::Uninstalled;
        release.description = action
            .description
            .clone()
            .or_else(|| Some("Uninstallation complete".to_string()));
        self.storage.delete_all(name).await?;
        Ok(release)
    }

    /// Bring live objects back to the stored manifest.
    ///
    /// Missing objects are created; for existing ones the JSON patch from
    /// live to expected is computed, `remove` operations are dropped
    /// (Kubernetes and users legitimately add fields the chart does not
    /// own), and the remainder applied. Idempotent.
    pub async fn reconcile(&self, release: &Release) -> Result<()> {
        for expected in parse_manifest(&release.manifest)? {
            let gvk = gvk_of(&expected)?;
            let resolved = self.resolver.resolve(&gvk).await?;
            let api = self.api_for(&resolved, expected.namespace().as_deref());
            let name = expected.name_any();
            match api.get_opt(&name).await.map_err(Error::KubeError)? {
                None => {
                    debug!(msg = "recreating missing object", kind = %gvk.kind, %name);
                    api.create(&PostParams::default(), &expected)
                        .await
                        .map_err(Error::KubeError)?;
                }
                Some(live) => {
                    let patch = pruned_patch(&live, &expected)?;
                    if patch.0.is_empty() {
                        continue;
                    }
                    debug!(msg = "patching drifted object", kind = %gvk.kind, %name, operations = patch.0.len());
                    api.patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
                        .await
                        .map_err(Error::KubeError)?;
                }
            }
        }
        Ok(())
    }

    /// Render chart templates and run the owner-reference post-renderer.
    async fn render(
        &self,
        chart: &Chart,
        context: &RenderContext,
        values: &Values,
    ) -> Result<(String, Option<String>)> {
        let rendered = chart.render(context, values)?;
        let mut objects = parse_manifest(&rendered.manifest)?;
        if let Some(owner) = &self.owner {
            for obj in &mut objects {
                let gvk = gvk_of(obj)?;
                let resolved = self.resolver.resolve(&gvk).await?;
                if resolved.namespaced {
                    append_owner_reference(obj, owner);
                }
            }
        }
        Ok((serialize_manifest(&objects)?, rendered.notes))
    }

    async fn apply_manifest(&self, manifest: &str, force: bool) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for obj in parse_manifest(manifest)? {
            let gvk = gvk_of(&obj)?;
            let resolved = self.resolver.resolve(&gvk).await?;
            let api = self.api_for(&resolved, obj.namespace().as_deref());
            let name = obj.name_any();
            trace!(msg = "applying object", kind = %gvk.kind, %name);
            match api.patch(&name, &params, &Patch::Apply(&obj)).await {
                Ok(_) => {}
                Err(e) if force => {
                    // forced upgrades fall back to replace semantics
                    warn!(msg = "apply failed, replacing object", kind = %gvk.kind, %name, error = %e);
                    match api.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => {}
                        Err(de) if is_not_found(&de) => {}
                        Err(de) => return Err(Error::KubeError(de)),
                    }
                    api.create(&PostParams::default(), &obj)
                        .await
                        .map_err(Error::KubeError)?;
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }

    async fn delete_manifest(&self, manifest: &str) -> Result<()> {
        for obj in parse_manifest(manifest)? {
            let gvk = gvk_of(&obj)?;
            let resolved = self.resolver.resolve(&gvk).await?;
            let api = self.api_for(&resolved, obj.namespace().as_deref());
            let name = obj.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }

    fn api_for(&self, resolved: &ResolvedResource, namespace: Option<&str>) -> Api<DynamicObject> {
        if resolved.namespaced {
            Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or(&self.namespace),
                &resolved.resource,
            )
        } else {
            Api::all_with(self.client.clone(), &resolved.resource)
        }
    }
}

fn append_owner_reference(obj: &mut DynamicObject, owner: &OwnerReference) {
    let refs = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if !refs.iter().any(|r| r.uid == owner.uid) {
        refs.push(owner.clone());
    }
}

/// JSON patch from `live` to `expected` with `remove` operations dropped.
fn pruned_patch(live: &DynamicObject, expected: &DynamicObject) -> Result<json_patch::Patch> {
    let live = serde_json::to_value(live).map_err(Error::SerializationError)?;
    let expected = serde_json::to_value(expected).map_err(Error::SerializationError)?;
    let diff = json_patch::diff(&live, &expected);
    Ok(json_patch::Patch(
        diff.0
            .into_iter()
            .filter(|op| !matches!(op, PatchOperation::Remove(_)))
            .collect(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::helm::config::owner_reference_for;

    use http::{Request, Response};
    use kube::api::{ApiResource, GroupVersionKind};
    use kube::client::Body;
    use serde_json::json;

    fn parse_obj(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn pruned_patch_drops_remove_operations() {
        let live = parse_obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "test",
                "namespace": "default",
                "uid": "live-uid",
                "labels": {"app.kubernetes.io/managed-by": "Unmanaged"},
            },
            "data": {"key": "live"},
        }));
        let expected = parse_obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "test",
                "namespace": "default",
                "labels": {"app.kubernetes.io/managed-by": "Helm"},
            },
            "data": {"key": "expected"},
        }));

        let patch = pruned_patch(&live, &expected).unwrap();
        assert!(!patch.0.is_empty());
        // uid exists only live-side; the diff must not try to remove it
        assert!(patch
            .0
            .iter()
            .all(|op| !matches!(op, PatchOperation::Remove(_))));
        let rendered = serde_json::to_value(&patch).unwrap();
        assert!(
            rendered.to_string().contains("managed-by"),
            "expected the drifted label in {rendered}"
        );
    }

    #[test]
    fn pruned_patch_is_empty_for_cluster_added_fields_only() {
        let live = parse_obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "test",
                "namespace": "default",
                "uid": "live-uid",
                "resourceVersion": "42",
            },
            "data": {"key": "v"},
        }));
        let expected = parse_obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "test", "namespace": "default"},
            "data": {"key": "v"},
        }));
        let patch = pruned_patch(&live, &expected).unwrap();
        assert!(patch.0.is_empty(), "got {patch:?}");
    }

    fn test_cr() -> DynamicObject {
        parse_obj(json!({
            "apiVersion": "demo.helmop.dev/v1alpha1",
            "kind": "Nginx",
            "metadata": {"name": "test", "namespace": "default", "uid": "uid-1234"},
            "spec": {},
        }))
    }

    async fn client_with_preloaded_scopes() -> ActionClient {
        let (mock_service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let resolver = Arc::new(GvkResolver::new(client.clone()));
        let deployment = GroupVersionKind::gvk("apps", "v1", "Deployment");
        resolver
            .preload(&deployment, ApiResource::from_gvk(&deployment), true)
            .await;
        let cluster_role = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
        resolver
            .preload(&cluster_role, ApiResource::from_gvk(&cluster_role), false)
            .await;

        let owner = owner_reference_for(&test_cr()).unwrap();
        ActionClient {
            storage: ReleaseStorage::new(client.clone(), "default", Some(owner.clone())),
            client,
            resolver,
            namespace: "default".to_string(),
            owner: Some(owner),
        }
    }

    #[tokio::test]
    async fn post_render_stamps_namespaced_objects_only() {
        let action_client = client_with_preloaded_scopes().await;
        let chart = Chart {
            metadata: crate::helm::chart::ChartMetadata {
                name: "test-chart".to_string(),
                version: "0.1.0".to_string(),
                description: None,
                app_version: None,
            },
            templates: vec![
                crate::helm::chart::ChartTemplate {
                    name: "templates/deployment.yaml".to_string(),
                    contents: "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ release.name }}\n  namespace: {{ release.namespace }}\n".to_string(),
                },
                crate::helm::chart::ChartTemplate {
                    name: "templates/clusterrole.yaml".to_string(),
                    contents: "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: {{ release.name }}\n".to_string(),
                },
            ],
            notes_template: None,
            default_values: Values::new(),
        };

        let (manifest, _) = action_client
            .render(
                &chart,
                &RenderContext::install("test", "default", 1),
                &Values::new(),
            )
            .await
            .unwrap();

        let objects = parse_manifest(&manifest).unwrap();
        assert_eq!(objects.len(), 2);
        for obj in &objects {
            let refs = obj.metadata.owner_references.clone().unwrap_or_default();
            match obj.types.as_ref().map(|t| t.kind.as_str()) {
                Some("Deployment") => {
                    assert_eq!(refs.len(), 1, "namespaced object must be owned");
                    assert_eq!(refs[0].uid, "uid-1234");
                }
                Some("ClusterRole") => {
                    assert!(refs.is_empty(), "cluster-scoped object must not be owned");
                }
                other => panic!("unexpected kind {other:?}"),
            }
        }
    }

    #[test]
    fn owner_references_are_not_duplicated() {
        let owner = owner_reference_for(&test_cr()).unwrap();
        let mut obj = parse_obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "test", "namespace": "default"},
        }));
        append_owner_reference(&mut obj, &owner);
        append_owner_reference(&mut obj, &owner);
        assert_eq!(obj.metadata.owner_references.unwrap().len(), 1);
    }
}
