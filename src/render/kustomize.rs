//! Fuses the renderer's output directory into the final YAML stream,
//! applying the release's Kustomize overlay when one is declared. Without an
//! overlay this is the identity transform up to YAML normalization.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::RenderedOutput;
use super::values::deep_merge;
use crate::error::BuildError;
use crate::release::HelmRelease;
use crate::resource::key::ResourceKey;
use crate::resource::store::ResourceStore;

pub const KUSTOMIZATION_KIND: &str = "Kustomization";

// A `Kustomization` overlay may be declared through either API surface.
const KUSTOMIZATION_GROUPS: &[&str] = &["kustomize.toolkit.fluxcd.io", "kustomize.config.k8s.io"];

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct KustomizationSpec {
    name_prefix: Option<String>,
    name_suffix: Option<String>,
    common_labels: BTreeMap<String, String>,
    common_annotations: BTreeMap<String, String>,
    patches: Vec<PatchEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PatchEntry {
    patch: String,
    target: Option<PatchTarget>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PatchTarget {
    kind: Option<String>,
    name: Option<String>,
}

/// Reads the materialized render output back, applies the overlay declared
/// for the release (a `Kustomization` document sharing its name and
/// namespace), and emits one normalized YAML stream.
pub fn fuse(
    store: &ResourceStore,
    release: &HelmRelease,
    output: &RenderedOutput,
) -> Result<String, BuildError> {
    let render_failure =
        |err: String| BuildError::RenderFailure(release.key().clone(), err);

    let mut documents = Vec::new();
    for path in output.files() {
        let text = std::fs::read_to_string(&path)
            .map_err(|err| render_failure(format!("reading `{}`: {err}", path.display())))?;
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = Value::deserialize(document)
                .map_err(|err| render_failure(format!("decoding rendered output: {err}")))?;
            if matches!(value, Value::Mapping(_)) {
                documents.push(value);
            }
        }
    }

    if let Some(spec) = overlay_for(store, release, &render_failure)? {
        debug!(release = %release.key(), "applying kustomize overlay");
        for document in &mut documents {
            apply_overlay(document, &spec);
        }
    }

    let mut stream = String::new();
    for document in &documents {
        let text = serde_yaml::to_string(document)
            .map_err(|err| render_failure(format!("encoding output: {err}")))?;
        stream.push_str("---\n");
        stream.push_str(&text);
    }
    Ok(stream)
}

fn overlay_for(
    store: &ResourceStore,
    release: &HelmRelease,
    render_failure: &impl Fn(String) -> BuildError,
) -> Result<Option<KustomizationSpec>, BuildError> {
    for group in KUSTOMIZATION_GROUPS {
        let key = ResourceKey::new(
            *group,
            KUSTOMIZATION_KIND,
            release.key().namespace.clone(),
            release.key().name.clone(),
        );
        if let Some(document) = store.get(&key) {
            let spec_value = document
                .body()
                .get("spec")
                .cloned()
                .unwrap_or(Value::Mapping(Mapping::new()));
            let spec: KustomizationSpec = serde_yaml::from_value(spec_value)
                .map_err(|err| render_failure(format!("decoding overlay {key}: {err}")))?;
            return Ok(Some(spec));
        }
    }
    Ok(None)
}

fn apply_overlay(document: &mut Value, spec: &KustomizationSpec) {
    rename(document, spec);
    merge_metadata_map(document, "labels", &spec.common_labels);
    merge_metadata_map(document, "annotations", &spec.common_annotations);
    for patch in &spec.patches {
        apply_patch(document, patch);
    }
}

fn rename(document: &mut Value, spec: &KustomizationSpec) {
    let Some(name) = document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
    else {
        return;
    };
    let renamed = format!(
        "{}{}{}",
        spec.name_prefix.as_deref().unwrap_or(""),
        name,
        spec.name_suffix.as_deref().unwrap_or(""),
    );
    if let Some(Value::Mapping(metadata)) = document.get_mut("metadata") {
        metadata.insert(Value::String("name".to_string()), Value::String(renamed));
    }
}

fn merge_metadata_map(document: &mut Value, field: &str, entries: &BTreeMap<String, String>) {
    if entries.is_empty() {
        return;
    }
    let Some(Value::Mapping(metadata)) = document.get_mut("metadata") else {
        return;
    };
    let map = metadata
        .entry(Value::String(field.to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if let Value::Mapping(map) = map {
        for (key, value) in entries {
            map.insert(
                Value::String(key.clone()),
                Value::String(value.clone()),
            );
        }
    }
}

/// Strategic-merge patch, matched by the target selector when given and by
/// the patch document's own kind/name otherwise.
fn apply_patch(document: &mut Value, patch: &PatchEntry) {
    let Ok(patch_value) = serde_yaml::from_str::<Value>(&patch.patch) else {
        return;
    };
    let target_kind = patch
        .target
        .as_ref()
        .and_then(|t| t.kind.clone())
        .or_else(|| string_at(&patch_value, &["kind"]));
    let target_name = patch
        .target
        .as_ref()
        .and_then(|t| t.name.clone())
        .or_else(|| string_at(&patch_value, &["metadata", "name"]));

    let matches_kind = target_kind.is_none_or(|k| string_at(document, &["kind"]) == Some(k));
    let matches_name =
        target_name.is_none_or(|n| string_at(document, &["metadata", "name"]) == Some(n));
    if matches_kind && matches_name {
        deep_merge(document, patch_value);
    }
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |cursor, segment| cursor.get(segment))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
