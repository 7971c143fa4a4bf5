use crate::error::{Error, Result};
use crate::helm::storage::ReleaseStorage;

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Scope};
use kube::{Client, Config, ResourceExt};
use tokio::sync::RwLock;
use tracing::debug;

/// An API-discovered resource together with its scope.
#[derive(Clone, Debug)]
pub struct ResolvedResource {
    pub resource: ApiResource,
    pub namespaced: bool,
}

fn cache_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

/// Discovery-backed GVK resolver, constructed once per process and
/// shared. Lookups are cached for the process lifetime.
pub struct GvkResolver {
    client: Client,
    cache: RwLock<HashMap<String, ResolvedResource>>,
}

impl GvkResolver {
    pub fn new(client: Client) -> Self {
        GvkResolver {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource> {
        let key = cache_key(gvk);
        if let Some(resolved) = self.cache.read().await.get(&key) {
            return Ok(resolved.clone());
        }
        let (resource, capabilities) = kube::discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| Error::DiscoveryError {
                gvk: key.clone(),
                message: e.to_string(),
            })?;
        let resolved = ResolvedResource {
            resource,
            namespaced: capabilities.scope == Scope::Namespaced,
        };
        debug!(msg = "resolved kind", gvk = %key, namespaced = resolved.namespaced);
        self.cache.write().await.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Seed the cache without touching the API.
    pub async fn preload(&self, gvk: &GroupVersionKind, resource: ApiResource, namespaced: bool) {
        self.cache.write().await.insert(
            cache_key(gvk),
            ResolvedResource {
                resource,
                namespaced,
            },
        );
    }
}

pub type NamespaceMapper = Box<dyn Fn(&DynamicObject) -> Result<String> + Send + Sync>;
pub type RestConfigMapper = Box<dyn Fn(&DynamicObject, &Config) -> Result<Config> + Send + Sync>;

/// Fully-built per-CR action context: REST access, the shared resolver,
/// and a release store writing to the (possibly overridden) storage
/// namespace.
pub struct ActionConfig {
    pub client: Client,
    pub resolver: Arc<GvkResolver>,
    pub storage: ReleaseStorage,
    /// Namespace for client operations against rendered objects.
    pub namespace: String,
    pub owner: Option<OwnerReference>,
}

/// Per-CR factory for [`ActionConfig`]s.
///
/// Namespaces for client operations and storage default to the CR's
/// namespace; mappers override them. A REST-config mapper allows
/// alternative credentials per CR (e.g. impersonation). Owner-reference
/// injection into release Secrets is on unless disabled.
pub struct ActionConfigGetter {
    client: Client,
    base_config: Config,
    resolver: Arc<GvkResolver>,
    client_namespace_mapper: Option<NamespaceMapper>,
    storage_namespace_mapper: Option<NamespaceMapper>,
    rest_config_mapper: Option<RestConfigMapper>,
    inject_owner: bool,
}

impl ActionConfigGetter {
    pub fn new(client: Client, base_config: Config, resolver: Arc<GvkResolver>) -> Self {
        ActionConfigGetter {
            client,
            base_config,
            resolver,
            client_namespace_mapper: None,
            storage_namespace_mapper: None,
            rest_config_mapper: None,
            inject_owner: true,
        }
    }

    pub fn with_client_namespace_mapper(mut self, mapper: NamespaceMapper) -> Self {
        self.client_namespace_mapper = Some(mapper);
        self
    }

    pub fn with_storage_namespace_mapper(mut self, mapper: NamespaceMapper) -> Self {
        self.storage_namespace_mapper = Some(mapper);
        self
    }

    pub fn with_rest_config_mapper(mut self, mapper: RestConfigMapper) -> Self {
        self.rest_config_mapper = Some(mapper);
        self
    }

    pub fn disable_owner_ref_injection(mut self) -> Self {
        self.inject_owner = false;
        self
    }

    /// Build the action context for one CR. Nothing partial is ever
    /// returned: any mapper or client construction failure surfaces as an
    /// error.
    pub fn config_for(&self, cr: &DynamicObject) -> Result<ActionConfig> {
        let namespace = cr.namespace().ok_or_else(|| {
            Error::ConfigError(format!(
                "resource {} has no namespace; watched kinds must be namespace-scoped",
                cr.name_any()
            ))
        })?;
        let client_namespace = match &self.client_namespace_mapper {
            Some(mapper) => mapper(cr)?,
            None => namespace.clone(),
        };
        let storage_namespace = match &self.storage_namespace_mapper {
            Some(mapper) => mapper(cr)?,
            None => namespace,
        };
        let client = match &self.rest_config_mapper {
            Some(mapper) => {
                let config = mapper(cr, &self.base_config)?;
                Client::try_from(config).map_err(Error::KubeError)?
            }
            None => self.client.clone(),
        };
        let owner = if self.inject_owner {
            Some(owner_reference_for(cr)?)
        } else {
            None
        };
        let storage = ReleaseStorage::new(client.clone(), &storage_namespace, owner.clone());
        Ok(ActionConfig {
            client,
            resolver: self.resolver.clone(),
            storage,
            namespace: client_namespace,
            owner,
        })
    }
}

/// An owner reference pointing at the CR, for release Secrets and
/// rendered namespace-scoped objects.
pub fn owner_reference_for(cr: &DynamicObject) -> Result<OwnerReference> {
    let types = cr
        .types
        .as_ref()
        .ok_or_else(|| Error::ConfigError("resource has no type metadata".to_string()))?;
    let uid = cr
        .uid()
        .ok_or_else(|| Error::ConfigError("resource has no uid".to_string()))?;
    Ok(OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: cr.name_any(),
        uid,
        ..OwnerReference::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use http::{Request, Response};
    use kube::client::Body;
    use serde_json::json;

    fn test_cr() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "demo.helmop.dev/v1alpha1",
            "kind": "Nginx",
            "metadata": {
                "name": "test",
                "namespace": "app-ns",
                "uid": "uid-1234",
            },
            "spec": {},
        }))
        .unwrap()
    }

    fn getter() -> ActionConfigGetter {
        let (mock_service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let resolver = Arc::new(GvkResolver::new(client.clone()));
        ActionConfigGetter::new(client, Config::new("http://localhost:8080".parse().unwrap()), resolver)
    }

    #[tokio::test]
    async fn namespaces_default_to_the_resource() {
        let config = getter().config_for(&test_cr()).unwrap();
        assert_eq!(config.namespace, "app-ns");
        assert!(config.owner.is_some());
    }

    #[tokio::test]
    async fn namespace_mappers_override() {
        let config = getter()
            .with_client_namespace_mapper(Box::new(|_| Ok("client-ns".to_string())))
            .with_storage_namespace_mapper(Box::new(|_| Ok("storage-ns".to_string())))
            .config_for(&test_cr())
            .unwrap();
        assert_eq!(config.namespace, "client-ns");
    }

    #[tokio::test]
    async fn mapper_failures_surface() {
        let result = getter()
            .with_client_namespace_mapper(Box::new(|_| {
                Err(Error::ConfigError("no namespace for you".to_string()))
            }))
            .config_for(&test_cr());
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn owner_injection_is_optional() {
        let config = getter()
            .disable_owner_ref_injection()
            .config_for(&test_cr())
            .unwrap();
        assert!(config.owner.is_none());
    }

    #[tokio::test]
    async fn cluster_scoped_resources_are_rejected() {
        let mut cr = test_cr();
        cr.metadata.namespace = None;
        assert!(matches!(
            getter().config_for(&cr),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn owner_reference_points_at_the_resource() {
        let owner = owner_reference_for(&test_cr()).unwrap();
        assert_eq!(owner.api_version, "demo.helmop.dev/v1alpha1");
        assert_eq!(owner.kind, "Nginx");
        assert_eq!(owner.name, "test");
        assert_eq!(owner.uid, "uid-1234");
    }
}
