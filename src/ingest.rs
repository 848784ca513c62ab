//! Walks input trees and populates the resource database.
//!
//! Every `.yaml`/`.yml` file is read, passed through environment-variable
//! substitution, split into its documents and recorded under its reference
//! key. Ingestion is idempotent and order-insensitive; duplicate keys abort.

pub mod envsubst;

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::error::BuildError;
use crate::resource::document::Document;
use crate::resource::key::ResourceKey;
use crate::resource::store::ResourceStore;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading `{path}`: {err}")]
    Io { path: PathBuf, err: std::io::Error },
    #[error("decoding `{path}`: {err}")]
    Decode {
        path: PathBuf,
        err: serde_yaml::Error,
    },
    /// Always [`BuildError::DuplicateResource`]; ingestion is where that
    /// error of the build taxonomy is detected and surfaced.
    #[error(transparent)]
    Duplicate(BuildError),
}

/// Ingests every YAML document under the given paths into a fresh store.
pub fn ingest_paths(paths: &[PathBuf]) -> Result<ResourceStore, IngestError> {
    let mut store = ResourceStore::default();
    for path in paths {
        ingest_path(path, &mut store)?;
    }
    debug!(documents = store.len(), "ingestion finished");
    Ok(store)
}

fn ingest_path(path: &Path, store: &mut ResourceStore) -> Result<(), IngestError> {
    let io_err = |err| IngestError::Io {
        path: path.to_path_buf(),
        err,
    };
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for entry in entries {
            if entry.is_dir() || is_yaml(&entry) {
                ingest_path(&entry, store)?;
            }
        }
        return Ok(());
    }

    let raw = fs::read_to_string(path).map_err(io_err)?;
    let substituted = envsubst::expand_env(&raw);
    for chunk in split_documents(&substituted) {
        let value: serde_yaml::Value =
            serde_yaml::from_str(&chunk).map_err(|err| IngestError::Decode {
                path: path.to_path_buf(),
                err,
            })?;
        let Some(key) = extract_key(&value) else {
            debug!(path = %path.display(), "skipping document without kind or name");
            continue;
        };
        store
            .insert(Document::new(key, value, chunk))
            .map_err(|err| IngestError::Duplicate(BuildError::DuplicateResource(err.0)))?;
    }
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Splits a multi-document stream on `---` separator lines, preserving the
/// text of each document exactly as written.
fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            push_document(&mut documents, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_document(&mut documents, &mut current);
    documents
}

fn push_document(documents: &mut Vec<String>, current: &mut String) {
    if !current.trim().is_empty() {
        documents.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

fn extract_key(value: &serde_yaml::Value) -> Option<ResourceKey> {
    let kind = value.get("kind")?.as_str()?;
    let api_version = value.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let metadata = value.get("metadata")?;
    let name = metadata.get("name")?.as_str()?;
    let namespace = metadata
        .get("namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    Some(ResourceKey::from_api_version(
        api_version,
        kind,
        namespace,
        name,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const TWO_DOCS: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: values
  namespace: team-a
data:
  values.yaml: "replicas: 2"
---
apiVersion: source.toolkit.fluxcd.io/v1
kind: HelmRepository
metadata:
  name: charts
  namespace: team-a
spec:
  url: https://charts.example/
"#;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        write!(file, "{content}").unwrap();
    }

    #[test]
    fn test_ingest_multi_document_file() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "input.yaml", TWO_DOCS);

        let store = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(store.len(), 2);

        let repo = store
            .get(&ResourceKey::new(
                "source.toolkit.fluxcd.io",
                "HelmRepository",
                "team-a",
                "charts",
            ))
            .unwrap();
        assert!(repo.source().contains("https://charts.example/"));
    }

    #[test]
    fn test_non_yaml_files_are_skipped() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "README.md", "# not yaml");
        write_file(dir.path(), "input.yml", TWO_DOCS);

        let store = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_keys_abort() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.yaml", TWO_DOCS);
        write_file(dir.path(), "b.yaml", TWO_DOCS);

        let result = ingest_paths(&[dir.path().to_path_buf()]);
        assert_matches!(
            result,
            Err(IngestError::Duplicate(BuildError::DuplicateResource(key))) => {
                assert_eq!(key.name, "values");
            }
        );
    }

    #[test]
    fn test_ingestion_is_idempotent() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "nested_dir_placeholder.yaml", TWO_DOCS);

        let first = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        let second = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_documents_without_identity_are_skipped() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "input.yaml", "just: a fragment\n");

        let store = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_env_substitution_applies_before_decoding() {
        let dir = tempdir().unwrap();
        // NAMESPACE_FOR_INGEST_TEST is unset, the default applies.
        write_file(
            dir.path(),
            "input.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: values\n  namespace: ${NAMESPACE_FOR_INGEST_TEST:-defaulted}\n",
        );

        let store = ingest_paths(&[dir.path().to_path_buf()]).unwrap();
        assert!(
            store
                .get(&ResourceKey::new("", "ConfigMap", "defaulted", "values"))
                .is_some()
        );
    }
}
