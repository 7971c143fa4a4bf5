use crate::error::{Error, Result};
use crate::helm::chart::Chart;
use crate::values;

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::GroupVersionKind;
use serde::Deserialize;
use tokio::time::Duration;

/// One entry of the watches file: a GVK bound to an immutable chart.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Watch {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub chart: PathBuf,
    #[serde(default = "default_watch_dependents")]
    pub watch_dependent_resources: bool,
    #[serde(default)]
    pub override_values: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub reconcile_period: Option<Duration>,
    #[serde(default)]
    pub max_concurrent_reconciles: Option<u16>,
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    #[serde(skip)]
    chart_tree: Option<Arc<Chart>>,
}

fn default_watch_dependents() -> bool {
    true
}

impl Watch {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// The chart tree, present after [`load_watches`].
    pub fn chart_tree(&self) -> Option<Arc<Chart>> {
        self.chart_tree.clone()
    }
}

/// Load and validate the watches file.
///
/// Validation: `version` and `kind` non-empty, GVKs unique, every chart
/// loads. Override-value literals are environment-expanded here, exactly
/// once.
pub fn load_watches(path: impl AsRef<Path>) -> Result<Vec<Watch>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::WatchesError(format!("cannot read {}: {e}", path.display())))?;
    let mut watches: Vec<Watch> = serde_yaml::from_str(&contents)
        .map_err(|e| Error::WatchesError(format!("cannot parse {}: {e}", path.display())))?;

    let mut seen = HashSet::new();
    for watch in &mut watches {
        if watch.version.is_empty() || watch.kind.is_empty() {
            return Err(Error::WatchesError(
                "version and kind are required".to_string(),
            ));
        }
        let gvk = watch.gvk();
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if !seen.insert(key.clone()) {
            return Err(Error::WatchesError(format!("duplicate GVK {key}")));
        }
        watch.override_values = watch
            .override_values
            .iter()
            .map(|(k, v)| (k.clone(), values::expand_env(v)))
            .collect();
        let chart = Chart::load(&watch.chart).map_err(|e| {
            Error::WatchesError(format!("chart for {key} failed to load: {e}"))
        })?;
        watch.chart_tree = Some(Arc::new(chart));
    }
    Ok(watches)
}

/// Namespaces to watch from `WATCH_NAMESPACE` / `WATCH_NAMESPACES`
/// (comma-separated). Empty means all namespaces.
pub fn watch_namespaces_from_env() -> Vec<String> {
    for var in ["WATCH_NAMESPACE", "WATCH_NAMESPACES"] {
        if let Ok(value) = env::var(var) {
            return value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    fn write_chart(dir: &Path) {
        fs::create_dir_all(dir.join("templates")).unwrap();
        fs::write(dir.join("Chart.yaml"), "name: test-chart\nversion: 0.1.0\n").unwrap();
        fs::write(dir.join("values.yaml"), "replicaCount: 1\n").unwrap();
        fs::write(
            dir.join("templates/cm.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ release.name }}\n",
        )
        .unwrap();
    }

    fn watches_yaml(chart: &Path) -> String {
        format!(
            r#"- group: demo.helmop.dev
  version: v1alpha1
  kind: Nginx
  chart: {chart}
  overrideValues:
    image.repository: $HELMOP_TEST_REPOSITORY
  reconcilePeriod: 2m
  maxConcurrentReconciles: 4
  selector:
    matchLabels:
      app: nginx
- group: demo.helmop.dev
  version: v1alpha1
  kind: Redis
  chart: {chart}
  watchDependentResources: false
"#,
            chart = chart.display()
        )
    }

    #[test]
    fn watches_load_and_expand_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = dir.path().join("chart");
        write_chart(&chart_dir);
        let watches_path = dir.path().join("watches.yaml");
        env::set_var("HELMOP_TEST_REPOSITORY", "custom-nginx");
        fs::write(&watches_path, watches_yaml(&chart_dir)).unwrap();

        let watches = load_watches(&watches_path).unwrap();
        assert_eq!(watches.len(), 2);

        let nginx = &watches[0];
        assert_eq!(nginx.gvk().kind, "Nginx");
        assert_eq!(
            nginx.override_values.get("image.repository").map(String::as_str),
            Some("custom-nginx")
        );
        assert_eq!(nginx.reconcile_period, Some(Duration::from_secs(120)));
        assert_eq!(nginx.max_concurrent_reconciles, Some(4));
        assert!(nginx.selector.is_some());
        assert!(nginx.watch_dependent_resources);
        assert!(nginx.chart_tree().is_some());

        let redis = &watches[1];
        assert!(!redis.watch_dependent_resources);
        assert_eq!(redis.reconcile_period, None);
    }

    #[test]
    fn duplicate_gvks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = dir.path().join("chart");
        write_chart(&chart_dir);
        let watches_path = dir.path().join("watches.yaml");
        let yaml = format!(
            "- version: v1\n  kind: A\n  chart: {c}\n- version: v1\n  kind: A\n  chart: {c}\n",
            c = chart_dir.display()
        );
        fs::write(&watches_path, yaml).unwrap();
        assert!(matches!(
            load_watches(&watches_path),
            Err(Error::WatchesError(_))
        ));
    }

    #[test]
    fn missing_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = dir.path().join("chart");
        write_chart(&chart_dir);
        let watches_path = dir.path().join("watches.yaml");
        let yaml = format!("- version: v1\n  kind: \"\"\n  chart: {}\n", chart_dir.display());
        fs::write(&watches_path, yaml).unwrap();
        assert!(load_watches(&watches_path).is_err());
    }

    #[test]
    fn unloadable_chart_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let watches_path = dir.path().join("watches.yaml");
        let yaml = format!(
            "- version: v1\n  kind: A\n  chart: {}\n",
            dir.path().join("missing").display()
        );
        fs::write(&watches_path, yaml).unwrap();
        assert!(matches!(
            load_watches(&watches_path),
            Err(Error::WatchesError(_))
        ));
    }

    #[test]
    fn namespaces_parse_from_env() {
        env::remove_var("WATCH_NAMESPACE");
        env::remove_var("WATCH_NAMESPACES");
        assert!(watch_namespaces_from_env().is_empty());

        env::set_var("WATCH_NAMESPACE", "");
        assert!(watch_namespaces_from_env().is_empty());

        env::set_var("WATCH_NAMESPACE", "one");
        assert_eq!(watch_namespaces_from_env(), vec!["one"]);

        env::set_var("WATCH_NAMESPACE", "one, two");
        assert_eq!(watch_namespaces_from_env(), vec!["one", "two"]);
        env::remove_var("WATCH_NAMESPACE");
    }
}
