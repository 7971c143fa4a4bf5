use crate::error::{Error, Result};
use crate::values::Values;

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tera::Tera;

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIR: &str = "templates/";
const NOTES_FILE: &str = "templates/NOTES.txt";

/// `Chart.yaml` contents.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ChartTemplate {
    /// Path relative to the chart root, e.g. `templates/deployment.yaml`.
    pub name: String,
    pub contents: String,
}

/// A parsed chart tree. Immutable after load; shared by reference.
///
/// Templates use Tera syntax with a `values` / `release` / `chart`
/// context; the tree keeps the usual `Chart.yaml`, `values.yaml`,
/// `templates/` layout.
#[derive(Clone, Debug)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub templates: Vec<ChartTemplate>,
    pub notes_template: Option<String>,
    pub default_values: Values,
}

/// Release identity exposed to templates while rendering.
#[derive(Clone, Debug, Serialize)]
pub struct RenderContext {
    pub name: String,
    pub namespace: String,
    pub revision: i32,
    pub is_install: bool,
    pub is_upgrade: bool,
    pub service: &'static str,
}

impl RenderContext {
    pub fn install(name: &str, namespace: &str, revision: i32) -> Self {
        RenderContext {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: true,
            is_upgrade: false,
            service: "Helm",
        }
    }

    pub fn upgrade(name: &str, namespace: &str, revision: i32) -> Self {
        RenderContext {
            is_install: false,
            is_upgrade: true,
            ..RenderContext::install(name, namespace, revision)
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderedChart {
    pub manifest: String,
    pub notes: Option<String>,
}

impl Chart {
    /// Load a chart from a directory or a gzipped tar archive.
    pub fn load(path: impl AsRef<Path>) -> Result<Chart> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            read_dir_files(path)?
        } else if path.is_file() {
            read_archive_files(path)?
        } else {
            return Err(Error::ChartError(format!(
                "chart path {} does not exist",
                path.display()
            )));
        };
        Chart::from_files(files)
    }

    fn from_files(files: Vec<(String, String)>) -> Result<Chart> {
        let mut metadata = None;
        let mut default_values = Values::new();
        let mut templates = Vec::new();
        let mut notes_template = None;

        for (name, contents) in files {
            if name == CHART_FILE {
                metadata = Some(
                    serde_yaml::from_str::<ChartMetadata>(&contents)
                        .map_err(|e| Error::ChartError(format!("invalid {CHART_FILE}: {e}")))?,
                );
            } else if name == VALUES_FILE {
                let value: serde_json::Value = serde_yaml::from_str(&contents)
                    .map_err(|e| Error::ChartError(format!("invalid {VALUES_FILE}: {e}")))?;
                default_values = match value {
                    serde_json::Value::Object(map) => map,
                    serde_json::Value::Null => Values::new(),
                    _ => {
                        return Err(Error::ChartError(format!(
                            "{VALUES_FILE} must be a mapping"
                        )))
                    }
                };
            } else if name == NOTES_FILE {
                notes_template = Some(contents);
            } else if name.starts_with(TEMPLATES_DIR) {
                templates.push(ChartTemplate { name, contents });
            }
        }

        let metadata =
            metadata.ok_or_else(|| Error::ChartError(format!("chart has no {CHART_FILE}")))?;
        if metadata.name.is_empty() || metadata.version.is_empty() {
            return Err(Error::ChartError(
                "chart name and version must be set".to_string(),
            ));
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Chart {
            metadata,
            templates,
            notes_template,
            default_values,
        })
    }

    /// Render every template against the final values and join the
    /// non-empty outputs into one multi-document manifest. Files whose
    /// basename starts with `_` are registered for inclusion but render
    /// no document of their own.
    pub fn render(&self, release: &RenderContext, values: &Values) -> Result<RenderedChart> {
        let mut tera = Tera::default();
        for t in &self.templates {
            tera.add_raw_template(&t.name, &t.contents)
                .map_err(Error::TemplateError)?;
        }
        if let Some(notes) = &self.notes_template {
            tera.add_raw_template(NOTES_FILE, notes)
                .map_err(Error::TemplateError)?;
        }

        let context = tera::Context::from_serialize(serde_json::json!({
            "values": values,
            "release": release,
            "chart": {
                "name": self.metadata.name,
                "version": self.metadata.version,
                "appVersion": self.metadata.app_version,
            },
        }))
        .map_err(Error::TemplateError)?;

        let mut docs = Vec::new();
        for t in &self.templates {
            if is_partial(&t.name) {
                continue;
            }
            let out = tera.render(&t.name, &context).map_err(Error::TemplateError)?;
            if !out.trim().is_empty() {
                docs.push(out.trim().to_string());
            }
        }
        let notes = self
            .notes_template
            .as_ref()
            .map(|_| tera.render(NOTES_FILE, &context).map_err(Error::TemplateError))
            .transpose()?
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Ok(RenderedChart {
            manifest: docs.join("\n---\n"),
            notes,
        })
    }
}

fn is_partial(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map(|base| base.starts_with('_'))
        .unwrap_or(false)
}

fn read_dir_files(root: &Path) -> Result<Vec<(String, String)>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::ChartError(format!("cannot read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::ChartError(format!("cannot read chart entry: {e}")))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else {
                // safe unwrap: path is inside root by construction
                let rel = path.strip_prefix(root).unwrap();
                let contents = fs::read_to_string(&path)
                    .map_err(|e| Error::ChartError(format!("cannot read {}: {e}", path.display())))?;
                out.push((rel.to_string_lossy().replace('\\', "/"), contents));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    Ok(files)
}

fn read_archive_files(path: &Path) -> Result<Vec<(String, String)>> {
    let file = fs::File::open(path)
        .map_err(|e| Error::ChartError(format!("cannot open {}: {e}", path.display())))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| Error::ChartError(format!("invalid chart archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::ChartError(format!("invalid chart archive entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = {
            let path = entry
                .path()
                .map_err(|e| Error::ChartError(format!("invalid archive path: {e}")))?;
            // archives nest everything under the chart directory
            let mut components = path.components();
            components.next();
            components.as_path().to_string_lossy().replace('\\', "/")
        };
        if name.is_empty() {
            continue;
        }
        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| Error::ChartError(format!("cannot read archived {name}: {e}")))?;
        files.push((name, contents));
    }
    Ok(files)
}
