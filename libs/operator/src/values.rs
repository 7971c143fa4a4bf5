use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::env;
use std::sync::OnceLock;

use kube::api::DynamicObject;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// The values mapping handed to chart rendering.
pub type Values = Map<String, Value>;

/// Optional user-supplied translation from the full CR to a values mapping.
///
/// When configured, the translator replaces the `spec`-derived mapping
/// wholesale; override values are applied on top of its output.
pub trait Translator: Send + Sync {
    fn translate(&self, cr: &DynamicObject) -> Result<Values>;
}

impl<F> Translator for F
where
    F: Fn(&DynamicObject) -> Result<Values> + Send + Sync,
{
    fn translate(&self, cr: &DynamicObject) -> Result<Values> {
        self(cr)
    }
}

/// Read the CR `spec` as a values mapping.
pub fn from_resource(cr: &DynamicObject) -> Result<Values> {
    match cr.data.get("spec") {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(Error::ValuesError(
            "spec must be a mapping of chart values".to_string(),
        )),
        None => Err(Error::ValuesError("spec is missing".to_string())),
    }
}

/// Write each `dot.path=literal` override into `values`.
///
/// Literals are expected to already be environment-expanded; expansion
/// happens once, when the watches file is loaded.
pub fn apply_overrides(values: &mut Values, overrides: &BTreeMap<String, String>) -> Result<()> {
    for (path, literal) in overrides {
        set_path(values, path, parse_literal(literal))?;
    }
    Ok(())
}

/// Deep-merge chart defaults under CR-derived values. CR values win on
/// conflict; nested mappings merge recursively.
pub fn coalesce(mut values: Values, defaults: &Values) -> Values {
    for (k, dv) in defaults {
        match values.get_mut(k) {
            None => {
                values.insert(k.clone(), dv.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(dm) = dv {
                    let merged = coalesce(std::mem::take(existing), dm);
                    *existing = merged;
                }
            }
            Some(_) => {}
        }
    }
    values
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| {
        // safe unwrap: the pattern is a constant
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
    });
    re.replace_all(input, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a `dot.path` with optional `[n]` list indices into segments.
fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let err = |msg: &str| Error::ValuesError(format!("invalid override path {path:?}: {msg}"));

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(err("empty key"));
        }
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        let key = &rest[..key_end];
        if key.is_empty() {
            return Err(err("empty key before index"));
        }
        segments.push(PathSegment::Key(key.to_string()));
        rest = &rest[key_end..];
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(err("unexpected characters after index"));
            }
            let close = rest.find(']').ok_or_else(|| err("unterminated index"))?;
            let idx: usize = rest[1..close]
                .parse()
                .map_err(|_| err("index is not a number"))?;
            segments.push(PathSegment::Index(idx));
            rest = &rest[close + 1..];
        }
    }
    if segments.is_empty() {
        return Err(err("empty path"));
    }
    Ok(segments)
}

/// Parse an override literal as a YAML scalar, falling back to a plain
/// string for anything non-scalar.
fn parse_literal(literal: &str) -> Value {
    if literal.is_empty() {
        return Value::String(String::new());
    }
    match serde_yaml::from_str::<Value>(literal) {
        Ok(v) if !v.is_object() && !v.is_array() => v,
        _ => Value::String(literal.to_string()),
    }
}

fn set_path(values: &mut Values, path: &str, literal: Value) -> Result<()> {
    let segments = parse_path(path)?;
    let mut slot: &mut Value = {
        let PathSegment::Key(first) = &segments[0] else {
            return Err(Error::ValuesError(format!(
                "invalid override path {path:?}: must start with a key"
            )));
        };
        values.entry(first.clone()).or_insert(Value::Null)
    };
    for seg in &segments[1..] {
        slot = match seg {
            PathSegment::Key(k) => {
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                // safe unwrap: just coerced to an object
                slot.as_object_mut()
                    .unwrap()
                    .entry(k.clone())
                    .or_insert(Value::Null)
            }
            PathSegment::Index(i) => {
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                // safe unwrap: just coerced to an array
                let arr = slot.as_array_mut().unwrap();
                while arr.len() <= *i {
                    arr.push(Value::Null);
                }
                &mut arr[*i]
            }
        };
    }
    *slot = literal;
    Ok(())
}
