//! Values composition for a release: the ordered `valuesFrom` list, then the
//! inline values on top.

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::BuildError;
use crate::release::HelmRelease;
use crate::release::helm_release::ValuesReference;
use crate::resource::document::{CONFIG_MAP_KIND, SECRET_KIND};
use crate::resource::store::ResourceStore;

const DEFAULT_VALUES_KEY: &str = "values.yaml";

/// Composes the effective values tree for a release. References are applied
/// in declared order with later ones overriding earlier ones; inline values
/// override everything.
pub fn compose(store: &ResourceStore, release: &HelmRelease) -> Result<Value, BuildError> {
    let mut composed = Value::Mapping(Mapping::new());

    for reference in &release.spec.values_from {
        if reference.kind != CONFIG_MAP_KIND && reference.kind != SECRET_KIND {
            return Err(BuildError::InvalidPolicy(
                release.key().clone(),
                format!("values reference of kind `{}` is not supported", reference.kind),
            ));
        }
        let key = release.values_reference_key(reference);
        let Some(document) = store.get(&key) else {
            if reference.optional {
                debug!(reference = %key, "optional values reference missing, skipped");
                continue;
            }
            return Err(BuildError::UnresolvedReference {
                referrer: release.key().clone(),
                reference: key,
            });
        };

        let entry = reference.values_key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);
        let content = document
            .data_entry(entry)
            .map_err(|err| BuildError::RenderFailure(release.key().clone(), err.to_string()))?;
        let Some(content) = content else {
            if reference.optional {
                debug!(reference = %key, entry, "optional values key missing, skipped");
                continue;
            }
            return Err(BuildError::UnresolvedReference {
                referrer: release.key().clone(),
                reference: key,
            });
        };

        apply_reference(&mut composed, release, reference, &content)?;
    }

    if let Some(inline) = &release.spec.values {
        deep_merge(&mut composed, inline.clone());
    }
    Ok(composed)
}

fn apply_reference(
    composed: &mut Value,
    release: &HelmRelease,
    reference: &ValuesReference,
    content: &str,
) -> Result<(), BuildError> {
    match reference.target_path.as_deref() {
        None => {
            let parsed: Value = serde_yaml::from_str(content).map_err(|err| {
                BuildError::InvalidPolicy(
                    release.key().clone(),
                    format!("values reference `{}` is not a values document: {err}", reference.name),
                )
            })?;
            if !matches!(parsed, Value::Mapping(_)) {
                return Err(BuildError::InvalidPolicy(
                    release.key().clone(),
                    format!("values reference `{}` is not a values document", reference.name),
                ));
            }
            deep_merge(composed, parsed);
        }
        Some(path) => {
            let scalar = strip_quotes(content.trim_end_matches('\n'));
            set_at_path(composed, path, Value::String(scalar.to_string())).map_err(|err| {
                BuildError::InvalidPolicy(
                    release.key().clone(),
                    format!("values reference `{}`: {err}", reference.name),
                )
            })?;
        }
    }
    Ok(())
}

/// Recursively merges `overlay` into `base`. Mappings merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Strips one matched pair of surrounding single or double quotes.
fn strip_quotes(content: &str) -> &str {
    let bytes = content.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &content[1..content.len() - 1];
        }
    }
    content
}

/// Assigns `value` at the dot-separated `path`, creating intermediate
/// mappings as needed. Intermediate non-mapping values are replaced.
fn set_at_path(root: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("malformed target path `{path}`"));
    }

    let mut cursor = root;
    for segment in &segments[..segments.len() - 1] {
        if !matches!(cursor, Value::Mapping(_)) {
            *cursor = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = cursor else { unreachable!() };
        cursor = map
            .entry(Value::String(segment.to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    if !matches!(cursor, Value::Mapping(_)) {
        *cursor = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = cursor else { unreachable!() };
    map.insert(
        Value::String(segments[segments.len() - 1].to_string()),
        value,
    );
    Ok(())
}
