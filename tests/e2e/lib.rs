//! Cluster scenarios for the demo `Nginx` GVK.
//!
//! Requires a cluster with the demo CRD applied and the operator running
//! with `demos/watches.yaml`:
//!
//! ```sh
//! kubectl apply -f demos/crd.yaml
//! cargo run --bin helmop -- --watches-file demos/watches.yaml &
//! cargo test -p tests --features e2e-tests
//! ```
#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use helmop_operator::reconciler::UNINSTALL_FINALIZER;
    use helmop_operator::status::{status_for, ConditionStatus, ConditionType};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::{
        Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
        PostParams,
    };
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;

    fn nginx_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("demo.helmop.dev", "v1alpha1", "Nginx"),
            "nginxes",
        )
    }

    fn nginx(name: &str, replicas: i32) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "demo.helmop.dev/v1alpha1",
            "kind": "Nginx",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"replicaCount": replicas},
        }))
        .unwrap()
    }

    fn is_deployed(reason: &'static str) -> impl Condition<DynamicObject> {
        move |obj: Option<&DynamicObject>| {
            obj.map(|o| {
                let status = status_for(o);
                status
                    .condition(ConditionType::Deployed)
                    .map(|c| {
                        c.status == ConditionStatus::True
                            && c.reason.as_deref() == Some(reason)
                    })
                    .unwrap_or(false)
            })
            .unwrap_or(false)
        }
    }

    fn deployment_has_replicas(replicas: i32) -> impl Condition<Deployment> {
        move |obj: Option<&Deployment>| {
            obj.and_then(|d| d.spec.as_ref())
                .and_then(|s| s.replicas)
                .map(|r| r == replicas)
                .unwrap_or(false)
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        tokio::time::timeout(
            Duration::from_secs(60),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn setup(name: &str, replicas: i32) -> (Api<DynamicObject>, Api<Deployment>) {
        let client = Client::try_default().await.unwrap();
        let nginx_api =
            Api::<DynamicObject>::namespaced_with(client.clone(), "default", &nginx_resource());
        nginx_api
            .create(&PostParams::default(), &nginx(name, replicas))
            .await
            .unwrap();

        let deployment_api = Api::<Deployment>::namespaced(client, "default");
        wait_for(nginx_api.clone(), name, is_deployed("InstallSuccessful")).await;
        (nginx_api, deployment_api)
    }

    async fn release_secrets(name: &str) -> Vec<Secret> {
        let client = Client::try_default().await.unwrap();
        let secrets = Api::<Secret>::namespaced(client, "default");
        secrets
            .list(&ListParams::default().labels(&format!("owner=helm,name={name}")))
            .await
            .unwrap()
            .items
    }

    #[tokio::test]
    async fn nginx_install() {
        let name = "test-install";
        let (nginx_api, deployment_api) = setup(name, 2).await;

        let cr = nginx_api.get(name).await.unwrap();
        assert!(
            cr.finalizers().contains(&UNINSTALL_FINALIZER.to_string()),
            "uninstall finalizer must be present after install"
        );
        let status = status_for(&cr);
        assert!(status.deployed_release.is_some());
        for (type_, expected) in [
            (ConditionType::Initialized, ConditionStatus::True),
            (ConditionType::Deployed, ConditionStatus::True),
            (ConditionType::ReleaseFailed, ConditionStatus::False),
            (ConditionType::Irreconcilable, ConditionStatus::False),
        ] {
            assert_eq!(
                status.condition(type_).map(|c| c.status),
                Some(expected),
                "condition {type_:?}"
            );
        }

        let deployment_name = format!("{name}-test-chart");
        wait_for(
            deployment_api.clone(),
            &deployment_name,
            deployment_has_replicas(2),
        )
        .await;
        let deployment = deployment_api.get(&deployment_name).await.unwrap();
        let owners = deployment.metadata.owner_references.unwrap_or_default();
        assert_eq!(owners.len(), 1, "rendered object owned by exactly the CR");
        assert_eq!(owners[0].kind, "Nginx");

        assert_eq!(release_secrets(name).await.len(), 1, "release at version 1");

        nginx_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn nginx_upgrade_on_spec_change() {
        let name = "test-upgrade";
        let (nginx_api, deployment_api) = setup(name, 2).await;

        let patch = json!({"spec": {"replicaCount": 3}});
        nginx_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .unwrap();

        wait_for(nginx_api.clone(), name, is_deployed("UpgradeSuccessful")).await;
        wait_for(
            deployment_api,
            &format!("{name}-test-chart"),
            deployment_has_replicas(3),
        )
        .await;
        assert_eq!(release_secrets(name).await.len(), 2, "release at version 2");

        nginx_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn nginx_drift_is_reconciled_without_upgrade() {
        let name = "test-drift";
        let (nginx_api, deployment_api) = setup(name, 1).await;
        let deployment_name = format!("{name}-test-chart");

        let drift = json!({"metadata": {"labels": {"app.kubernetes.io/managed-by": "Unmanaged"}}});
        deployment_api
            .patch(&deployment_name, &PatchParams::default(), &Patch::Merge(&drift))
            .await
            .unwrap();

        fn label_restored() -> impl Condition<Deployment> {
            |obj: Option<&Deployment>| {
                obj.and_then(|d| d.metadata.labels.as_ref())
                    .and_then(|l| l.get("app.kubernetes.io/managed-by"))
                    .map(|v| v == "Helm")
                    .unwrap_or(false)
            }
        }
        wait_for(deployment_api.clone(), &deployment_name, label_restored()).await;

        assert_eq!(
            release_secrets(name).await.len(),
            1,
            "drift repair must not create a new release version"
        );

        nginx_api.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn nginx_uninstall_on_delete() {
        let name = "test-uninstall";
        let (nginx_api, deployment_api) = setup(name, 1).await;
        let deployment_name = format!("{name}-test-chart");
        let deployment = deployment_api.get(&deployment_name).await.unwrap();
        let cr = nginx_api.get(name).await.unwrap();

        nginx_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            nginx_api.clone(),
            name,
            conditions::is_deleted(&cr.uid().unwrap()),
        )
        .await;
        wait_for(
            deployment_api,
            &deployment_name,
            conditions::is_deleted(&deployment.uid().unwrap()),
        )
        .await;
        assert!(
            release_secrets(name).await.is_empty(),
            "release secrets must be removed"
        );
    }
}
