use crate::error::{is_conflict, is_not_found, Error, Result};
use crate::status::{status_for, Condition, ConditionType, DeployedRelease, HelmAppStatus};

use kube::api::{Api, DynamicObject, PostParams};
use kube::Resource;
use kube::ResourceExt;
use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

const MAX_UPDATE_ATTEMPTS: usize = 8;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

type SpecMutation = Box<dyn FnMut(&mut DynamicObject) -> bool + Send>;
type StatusMutation = Box<dyn FnMut(&mut HelmAppStatus) -> bool + Send>;

/// Accumulates mutations to a CR and applies them in one place.
///
/// Status is written before the main resource: removing the uninstall
/// finalizer frees the object for garbage collection, so the terminal
/// status must already be persisted when that happens.
#[derive(Default)]
pub struct Updater {
    spec_mutations: Vec<SpecMutation>,
    status_mutations: Vec<StatusMutation>,
}

impl Updater {
    pub fn new() -> Self {
        Updater::default()
    }

    pub fn update_spec(&mut self, mutation: impl FnMut(&mut DynamicObject) -> bool + Send + 'static) {
        self.spec_mutations.push(Box::new(mutation));
    }

    pub fn update_status(
        &mut self,
        mutation: impl FnMut(&mut HelmAppStatus) -> bool + Send + 'static,
    ) {
        self.status_mutations.push(Box::new(mutation));
    }

    /// Apply queued mutations: status subresource first, then the main
    /// resource, each under bounded retry on write conflicts. A vanished
    /// object is terminal: a deleted CR must not be recreated.
    ///
    /// Queued mutations are consumed; a second `apply` with nothing queued
    /// is a no-op.
    pub async fn apply(&mut self, api: &Api<DynamicObject>, obj: &DynamicObject) -> Result<()> {
        let mut status_mutations = std::mem::take(&mut self.status_mutations);
        let mut spec_mutations = std::mem::take(&mut self.spec_mutations);
        let name = obj.name_any();

        let mut current = obj.clone();
        let mut delay = INITIAL_BACKOFF;
        for attempt in 0.. {
            let mut status = status_for(&current);
            let changed = status_mutations
                .iter_mut()
                .fold(false, |acc, m| m(&mut status) || acc);
            if !changed {
                break;
            }
            let mut candidate = current.clone();
            set_status(&mut candidate, &status)?;
            let body = serde_json::to_vec(&candidate).map_err(Error::SerializationError)?;
            match api
                .replace_status(&name, &PostParams::default(), body)
                .await
            {
                Ok(updated) => {
                    current = updated;
                    break;
                }
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) if is_conflict(&e) && attempt + 1 < MAX_UPDATE_ATTEMPTS => {
                    debug!(msg = "conflict updating status, retrying", %name, attempt);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    current = match api.get_opt(&name).await.map_err(Error::KubeError)? {
                        Some(o) => o,
                        None => return Ok(()),
                    };
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }

        let mut delay = INITIAL_BACKOFF;
        for attempt in 0.. {
            let mut candidate = current.clone();
            let changed = spec_mutations
                .iter_mut()
                .fold(false, |acc, m| m(&mut candidate) || acc);
            if !changed {
                break;
            }
            match api
                .replace(&name, &PostParams::default(), &candidate)
                .await
            {
                Ok(_) => break,
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) if is_conflict(&e) && attempt + 1 < MAX_UPDATE_ATTEMPTS => {
                    debug!(msg = "conflict updating resource, retrying", %name, attempt);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    current = match api.get_opt(&name).await.map_err(Error::KubeError)? {
                        Some(o) => o,
                        None => return Ok(()),
                    };
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }
}

fn set_status(obj: &mut DynamicObject, status: &HelmAppStatus) -> Result<()> {
    let value = serde_json::to_value(status).map_err(Error::SerializationError)?;
    match &mut obj.data {
        Value::Object(map) => {
            map.insert("status".to_string(), value);
        }
        other => *other = serde_json::json!({ "status": value }),
    }
    Ok(())
}

/// Add `finalizer` to the CR unless already present.
pub fn ensure_finalizer(finalizer: &str) -> impl FnMut(&mut DynamicObject) -> bool + Send {
    let finalizer = finalizer.to_string();
    move |obj| {
        let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == &finalizer) {
            false
        } else {
            finalizers.push(finalizer.clone());
            true
        }
    }
}

/// Remove `finalizer` from the CR if present.
pub fn remove_finalizer(finalizer: &str) -> impl FnMut(&mut DynamicObject) -> bool + Send {
    let finalizer = finalizer.to_string();
    move |obj| match obj.meta_mut().finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != &finalizer);
            finalizers.len() != before
        }
        None => false,
    }
}

pub fn ensure_condition(cond: Condition) -> impl FnMut(&mut HelmAppStatus) -> bool + Send {
    move |status| status.set_condition(cond.clone())
}

pub fn remove_condition(type_: ConditionType) -> impl FnMut(&mut HelmAppStatus) -> bool + Send {
    move |status| status.remove_condition(type_)
}

pub fn ensure_deployed_release(
    name: &str,
    manifest: &str,
) -> impl FnMut(&mut HelmAppStatus) -> bool + Send {
    let release = DeployedRelease {
        name: name.to_string(),
        manifest: manifest.to_string(),
    };
    move |status| {
        if status.deployed_release.as_ref() == Some(&release) {
            false
        } else {
            status.deployed_release = Some(release.clone());
            true
        }
    }
}

pub fn remove_deployed_release() -> impl FnMut(&mut HelmAppStatus) -> bool + Send {
    |status| status.deployed_release.take().is_some()
}
