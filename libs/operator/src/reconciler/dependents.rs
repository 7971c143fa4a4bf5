use crate::error::Result;
use crate::helm::config::GvkResolver;
use crate::helm::{gvk_of, parse_manifest};
use crate::metrics::{Metrics, TriggerAction};

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::pin::pin;
use std::sync::{Arc, RwLock};

use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, warn};

/// Ensures that a change to any object rendered by a release re-enqueues
/// its owning CR.
///
/// The registry of watched GVKs lives for the whole process: the runtime
/// rejects duplicate watches on the same source, so registration must
/// survive across reconciles. Each registered GVK gets one spawned
/// watcher task whose events are reverse-mapped through owner references
/// into reconcile requests on the trigger channels. One channel feeds
/// each controller of the owner GVK (one per watched namespace); a
/// controller whose store does not hold the referenced owner drops the
/// request.
pub struct DependentWatchManager {
    client: Client,
    resolver: Arc<GvkResolver>,
    owner_resource: ApiResource,
    owner_namespaced: bool,
    registry: RwLock<HashSet<String>>,
    triggers: Vec<mpsc::Sender<ObjectRef<DynamicObject>>>,
    metrics: Arc<Metrics>,
}

fn registry_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

impl DependentWatchManager {
    pub fn new(
        client: Client,
        resolver: Arc<GvkResolver>,
        owner_resource: ApiResource,
        owner_namespaced: bool,
        triggers: Vec<mpsc::Sender<ObjectRef<DynamicObject>>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        DependentWatchManager {
            client,
            resolver,
            owner_resource,
            owner_namespaced,
            registry: RwLock::new(HashSet::new()),
            triggers,
            metrics,
        }
    }

    /// Register a watch for every previously-unseen GVK in the manifest.
    pub async fn watch_dependents(&self, manifest: &str) -> Result<()> {
        for obj in parse_manifest(manifest)? {
            let gvk = gvk_of(&obj)?;
            let key = registry_key(&gvk);
            if self.is_registered(&key) {
                continue;
            }
            let resolved = self.resolver.resolve(&gvk).await?;
            if self.owner_namespaced && !resolved.namespaced {
                // register it anyway so the warning fires once, not per
                // reconcile
                self.register(&key);
                warn!(
                    msg = "cannot watch cluster-scoped dependent of a namespace-scoped owner",
                    dependent = %key,
                    owner = %self.owner_resource.kind,
                );
                continue;
            }
            if !self.register(&key) {
                // raced with a concurrent reconcile; the winner spawned it
                continue;
            }
            debug!(msg = "watching dependent kind", dependent = %key);
            self.spawn_watcher(gvk, resolved.resource);
        }
        Ok(())
    }

    fn is_registered(&self, key: &str) -> bool {
        // lock held only to probe
        self.registry
            .read()
            .map(|registry| registry.contains(key))
            .unwrap_or(false)
    }

    /// Insert the key; false when another writer beat us to it.
    fn register(&self, key: &str) -> bool {
        self.registry
            .write()
            .map(|mut registry| registry.insert(key.to_string()))
            .unwrap_or(false)
    }

    fn spawn_watcher(&self, gvk: GroupVersionKind, resource: ApiResource) {
        let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource);
        let owner_resource = self.owner_resource.clone();
        let triggers = self.triggers.clone();
        let metrics = self.metrics.clone();
        let kind = gvk.kind.clone();
        tokio::spawn(async move {
            // last-seen hash per object uid, minus fields the dependent
            // predicate ignores
            let mut seen: HashMap<String, u64> = HashMap::new();
            let mut events =
                pin!(watcher(api, watcher::Config::default().any_semantic()).default_backoff());
            while let Some(event) = events.next().await {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        let Some(uid) = obj.uid() else { continue };
                        let hash = dependent_hash(&obj);
                        if seen.insert(uid, hash) == Some(hash) {
                            // status-only or resourceVersion-only change
                            continue;
                        }
                        notify_owners(
                            &obj,
                            &owner_resource,
                            &triggers,
                            &metrics,
                            TriggerAction::Apply,
                            &kind,
                        );
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        if let Some(uid) = obj.uid() {
                            seen.remove(&uid);
                        }
                        notify_owners(
                            &obj,
                            &owner_resource,
                            &triggers,
                            &metrics,
                            TriggerAction::Delete,
                            &kind,
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(msg = "unexpected error watching dependent kind", %kind, %e);
                        metrics.watch_failures_inc();
                    }
                }
            }
        });
    }
}

/// Reverse lookup from a dependent to its owning CRs; each match becomes
/// a reconcile request, broadcast to every controller of the owner GVK.
fn notify_owners(
    obj: &DynamicObject,
    owner_resource: &ApiResource,
    triggers: &[mpsc::Sender<ObjectRef<DynamicObject>>],
    metrics: &Metrics,
    action: TriggerAction,
    kind: &str,
) {
    let namespace = obj.namespace();
    for owner in obj.owner_references() {
        let Some(reference) = ObjectRef::<DynamicObject>::from_owner_ref(
            namespace.as_deref(),
            owner,
            owner_resource.clone(),
        ) else {
            continue;
        };
        debug!(
            msg = "dependent event",
            dependent = %obj.name_any(),
            owner = %owner.name,
        );
        for trigger in triggers {
            let _ignore_errors = trigger
                .clone()
                .try_send(reference.clone())
                .map_err(|e| error!(msg = "failed to trigger owner reconcile", %e));
        }
        metrics.triggered_inc(action, kind);
    }
}

/// Hash of the fields a dependent change must touch to be interesting.
/// Ignores `status`, `resourceVersion`, and `managedFields`.
pub(crate) fn dependent_hash(obj: &DynamicObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(types) = &obj.types {
        types.api_version.hash(&mut hasher);
        types.kind.hash(&mut hasher);
    }
    let meta = obj.meta();
    meta.name.hash(&mut hasher);
    meta.namespace.hash(&mut hasher);
    meta.labels.hash(&mut hasher);
    meta.annotations.hash(&mut hasher);
    meta.owner_references.is_some().hash(&mut hasher);
    meta.deletion_timestamp.is_some().hash(&mut hasher);
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data.to_string().hash(&mut hasher);
    hasher.finish()
}
