//! File → resource decoding.
//!
//! Accepts JSON and YAML files holding either a Kubernetes-style manifest
//! (`apiVersion`/`kind`/`metadata`/`spec`) or a classic dashboard body. A
//! leading UTF-8 BOM and any U+FEFF inside string values are removed before
//! the content is interpreted.

use std::str::FromStr;

use serde_json::{Map, Value};

use provisioning_core::{path, ResourceKind};

use crate::checksum::{sha256_hex, short_hash};
use crate::error::ParseError;
use crate::resources::{DashboardSpec, ResourceObject};

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// A decoded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResource {
    pub path: String,
    /// Checksum of the raw file bytes.
    pub checksum: String,
    pub obj: ResourceObject,
    /// `true` for a bare dashboard body without a manifest envelope.
    pub classic: bool,
}

/// Files the planner treats as resources. Everything else is ignored.
pub fn is_content_path(p: &str) -> bool {
    if path::is_dir(p) || path::is_hidden(p) {
        return false;
    }
    matches!(
        path::extension(p).as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}

/// Decode `data` read from `file_path`.
pub fn parse(file_path: &str, data: &[u8]) -> Result<ParsedResource, ParseError> {
    if !is_content_path(file_path) {
        return Err(ParseError::Unsupported(file_path.to_owned()));
    }
    let checksum = sha256_hex(data);
    let mut value = decode(file_path, strip_bom(data))?;
    strip_bom_values(&mut value);

    let Value::Object(mut root) = value else {
        return Err(ParseError::NotAResource);
    };

    if is_manifest(&root) {
        let obj = from_manifest(file_path, &mut root)?;
        return Ok(ParsedResource {
            path: file_path.to_owned(),
            checksum,
            obj,
            classic: false,
        });
    }

    if is_classic_dashboard(&root) {
        let name = match root.remove("uid") {
            Some(Value::String(uid)) if !uid.trim().is_empty() => uid,
            _ => name_from_path(file_path),
        };
        // Numeric ids are instance-local.
        root.remove("id");
        let spec: DashboardSpec = serde_json::from_value(Value::Object(root))
            .map_err(|e| ParseError::Json(e.to_string()))?;
        return Ok(ParsedResource {
            path: file_path.to_owned(),
            checksum,
            obj: ResourceObject::dashboard(name, spec),
            classic: true,
        });
    }

    Err(ParseError::NotAResource)
}

/// Stable resource name for a file without one.
pub fn name_from_path(file_path: &str) -> String {
    let stem = path::base(file_path);
    let stem = stem.rsplit_once('.').map(|(s, _)| s).unwrap_or(stem);
    let slug = slugify(stem);
    let hash = short_hash(file_path);
    if slug.is_empty() {
        hash
    } else {
        let mut slug = slug;
        slug.truncate(30);
        format!("{}-{hash}", slug.trim_end_matches('-'))
    }
}

/// Lowercase, `[a-z0-9-]` only, no repeated or edge dashes.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    out.trim_end_matches('-').to_owned()
}

fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(BOM).unwrap_or(data)
}

fn decode(file_path: &str, data: &[u8]) -> Result<Value, ParseError> {
    match path::extension(file_path).as_deref() {
        Some("json") => serde_json::from_slice(data).map_err(|e| ParseError::Json(e.to_string())),
        _ => serde_yaml::from_slice(data).map_err(|e| ParseError::Yaml(e.to_string())),
    }
}

/// Remove U+FEFF from every string value, recursively.
pub fn strip_bom_values(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains('\u{feff}') {
                *s = s.replace('\u{feff}', "");
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_bom_values),
        Value::Object(map) => map.values_mut().for_each(strip_bom_values),
        _ => {}
    }
}

fn is_manifest(root: &Map<String, Value>) -> bool {
    root.contains_key("apiVersion") && root.contains_key("kind")
}

fn is_classic_dashboard(root: &Map<String, Value>) -> bool {
    ["title", "panels", "schemaVersion", "uid"]
        .iter()
        .any(|k| root.contains_key(*k))
}

fn from_manifest(
    file_path: &str,
    root: &mut Map<String, Value>,
) -> Result<ResourceObject, ParseError> {
    let api_version = root
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let kind_name = root
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let group = api_version.split('/').next().unwrap_or_default();

    let kind = ResourceKind::from_str(&kind_name)
        .map_err(|_| ParseError::UnsupportedKind(format!("{api_version} {kind_name}")))?;
    if group != kind.group() {
        return Err(ParseError::UnsupportedKind(format!("{api_version} {kind_name}")));
    }
    if kind == ResourceKind::Folder {
        return Err(ParseError::FolderFile);
    }

    let metadata = root.get("metadata").and_then(Value::as_object);
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty());
    let generate_name = metadata
        .and_then(|m| m.get("generateName"))
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty());
    let name = match (name, generate_name) {
        (Some(name), _) => name.to_owned(),
        (None, Some(prefix)) => format!("{prefix}{}", short_hash(file_path)),
        (None, None) => return Err(ParseError::MissingName),
    };

    let spec = root
        .remove("spec")
        .unwrap_or_else(|| Value::Object(Map::new()));
    ResourceObject::from_spec(kind, name, spec)
}
