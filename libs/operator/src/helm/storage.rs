use crate::error::{is_not_found, Error, Result};
#[cfg(not(test))]
use crate::helm::release::Release;
#[cfg(test)]
use crate::helm::release::{Release, ReleaseStatus};

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;

pub const SECRET_TYPE: &str = "helm.sh/release.v1";
const SECRET_KEY: &str = "release";
const OWNER_LABEL: &str = "helm";

/// Secret-backed release store.
///
/// One Secret per release revision, named
/// `sh.helm.release.v1.<name>.v<version>`, labeled by owner, release
/// name, version and status, with the gzipped release record under the
/// `release` data key. When an owner reference is configured, every
/// create and update stamps the Secret with it so deleting the CR
/// garbage-collects the release history.
pub struct ReleaseStorage {
    secrets: Api<Secret>,
    owner: Option<OwnerReference>,
}

impl ReleaseStorage {
    pub fn new(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Self {
        ReleaseStorage {
            secrets: Api::namespaced(client, namespace),
            owner,
        }
    }

    /// The most recent revision, regardless of its status.
    pub async fn latest(&self, name: &str) -> Result<Release> {
        self.history(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ReleaseNotFound(name.to_string()))
    }

    /// Every stored revision, newest first.
    pub async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let params = ListParams::default().labels(&format!("owner={OWNER_LABEL},name={name}"));
        let secrets = self.secrets.list(&params).await.map_err(Error::KubeError)?;
        let mut releases = secrets
            .items
            .iter()
            .map(decode_secret)
            .collect::<Result<Vec<_>>>()?;
        releases.sort_by_key(|r| std::cmp::Reverse(r.version));
        Ok(releases)
    }

    pub async fn create(&self, release: &Release) -> Result<()> {
        let secret = self.secret_for(release)?;
        self.secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    /// Rewrite the revision's Secret, e.g. after a status change.
    pub async fn update(&self, release: &Release) -> Result<()> {
        let name = secret_name(&release.name, release.version);
        let existing = self.secrets.get(&name).await.map_err(Error::KubeError)?;
        let mut secret = self.secret_for(release)?;
        secret.metadata.resource_version = existing.metadata.resource_version;
        self.secrets
            .replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    /// Remove every revision of the release. Missing Secrets are fine.
    pub async fn delete_all(&self, name: &str) -> Result<()> {
        let params = ListParams::default().labels(&format!("owner={OWNER_LABEL},name={name}"));
        let secrets = self.secrets.list(&params).await.map_err(Error::KubeError)?;
        for secret in secrets {
            let secret_name = secret.metadata.name.unwrap_or_default();
            match self
                .secrets
                .delete(&secret_name, &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }

    fn secret_for(&self, release: &Release) -> Result<Secret> {
        let labels = BTreeMap::from([
            ("owner".to_string(), OWNER_LABEL.to_string()),
            ("name".to_string(), release.name.clone()),
            ("version".to_string(), release.version.to_string()),
            ("status".to_string(), release.status.as_str().to_string()),
        ]);
        let data = BTreeMap::from([(SECRET_KEY.to_string(), ByteString(encode(release)?))]);
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(secret_name(&release.name, release.version)),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Secret::default()
        })
    }
}

fn secret_name(name: &str, version: i32) -> String {
    format!("sh.helm.release.v1.{name}.v{version}")
}

fn encode(release: &Release) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(release).map_err(Error::SerializationError)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::StorageError(format!("cannot compress release record: {e}")))
}

fn decode_secret(secret: &Secret) -> Result<Release> {
    let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SECRET_KEY))
        .ok_or_else(|| {
            Error::StorageError(format!("secret {secret_name} has no release payload"))
        })?;
    let mut json = Vec::new();
    GzDecoder::new(payload.0.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| Error::StorageError(format!("corrupt release payload in {secret_name}: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::StorageError(format!("corrupt release record in {secret_name}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Utc;
    use http::{Request, Response};
    use kube::client::Body;

    fn release(status: ReleaseStatus) -> Release {
        Release {
            name: "test".to_string(),
            namespace: "default".to_string(),
            version: 2,
            chart_name: "test-chart".to_string(),
            chart_version: "0.1.0".to_string(),
            manifest: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: test\n".to_string(),
            notes: Some("installed".to_string()),
            status,
            description: None,
            first_deployed: Utc::now(),
            last_deployed: Utc::now(),
        }
    }

    fn storage(owner: Option<OwnerReference>) -> ReleaseStorage {
        let (mock_service, _handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        ReleaseStorage::new(client, "default", owner)
    }

    #[tokio::test]
    async fn secrets_follow_the_release_v1_layout() {
        let owner = OwnerReference {
            api_version: "demo.helmop.dev/v1alpha1".to_string(),
            kind: "Nginx".to_string(),
            name: "test".to_string(),
            uid: "uid-1234".to_string(),
            ..OwnerReference::default()
        };
        let secret = storage(Some(owner.clone()))
            .secret_for(&release(ReleaseStatus::Deployed))
            .unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("sh.helm.release.v1.test.v2")
        );
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE));
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels.get("owner").map(String::as_str), Some("helm"));
        assert_eq!(labels.get("name").map(String::as_str), Some("test"));
        assert_eq!(labels.get("version").map(String::as_str), Some("2"));
        assert_eq!(labels.get("status").map(String::as_str), Some("deployed"));
        assert_eq!(secret.metadata.owner_references, Some(vec![owner]));
    }

    #[tokio::test]
    async fn owner_injection_can_be_disabled() {
        let secret = storage(None)
            .secret_for(&release(ReleaseStatus::PendingInstall))
            .unwrap();
        assert_eq!(secret.metadata.owner_references, None);
    }

    #[tokio::test]
    async fn payload_decodes_to_the_original_record() {
        let original = release(ReleaseStatus::Superseded);
        let secret = storage(None).secret_for(&original).unwrap();
        let decoded = decode_secret(&secret).unwrap();
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.status, original.status);
        assert_eq!(decoded.manifest, original.manifest);
    }

    #[test]
    fn secrets_without_payload_are_rejected() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("sh.helm.release.v1.test.v1".to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        assert!(matches!(
            decode_secret(&secret),
            Err(Error::StorageError(_))
        ));
    }
}
