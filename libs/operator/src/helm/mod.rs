pub mod chart;
pub mod client;
pub mod config;
pub mod release;
pub mod storage;

use crate::error::{Error, Result};

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::Deserialize;

/// Split a rendered multi-document YAML manifest into dynamic objects.
/// Empty documents are skipped.
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let value =
            serde_yaml::Value::deserialize(doc).map_err(|e| Error::ManifestError(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value).map_err(Error::SerializationError)?;
        let obj: DynamicObject =
            serde_json::from_value(json).map_err(|e| Error::ManifestError(e.to_string()))?;
        objects.push(obj);
    }
    Ok(objects)
}

/// Re-serialize objects into one multi-document manifest.
pub fn serialize_manifest(objects: &[DynamicObject]) -> Result<String> {
    let docs = objects
        .iter()
        .map(|o| serde_yaml::to_string(o).map_err(|e| Error::ManifestError(e.to_string())))
        .collect::<Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// The GVK of a manifest object, from its `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::ManifestError("object is missing apiVersion/kind".to_string()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || types.kind.is_empty() {
        return Err(Error::ManifestError(format!(
            "invalid apiVersion/kind: {}/{}",
            types.api_version, types.kind
        )));
    }
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

#[cfg(test)]
mod test {
    use super::*;

    use kube::ResourceExt;

    const MANIFEST: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: test-nginx
  namespace: default
spec:
  replicas: 2
---
apiVersion: v1
kind: Service
metadata:
  name: test-nginx
  namespace: default
---
"#;

    #[test]
    fn manifests_split_into_objects() {
        let objects = parse_manifest(MANIFEST).unwrap();
        assert_eq!(objects.len(), 2);
        let gvk = gvk_of(&objects[0]).unwrap();
        assert_eq!(
            (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()),
            ("apps", "v1", "Deployment")
        );
        let gvk = gvk_of(&objects[1]).unwrap();
        assert_eq!(
            (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()),
            ("", "v1", "Service")
        );
    }

    #[test]
    fn serialization_round_trips() {
        let objects = parse_manifest(MANIFEST).unwrap();
        let rendered = serialize_manifest(&objects).unwrap();
        let reparsed = parse_manifest(&rendered).unwrap();
        assert_eq!(objects.len(), reparsed.len());
        assert_eq!(objects[0].name_any(), reparsed[0].name_any());
    }

    #[test]
    fn empty_manifest_yields_nothing() {
        assert!(parse_manifest("").unwrap().is_empty());
        assert!(parse_manifest("---\n---\n").unwrap().is_empty());
    }
}
