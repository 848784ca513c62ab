//! Dependency graph over the resource database: releases depend on their
//! chart source (and transitively on its secrets) and on every document named
//! by their values references. The relation must be a DAG; a cycle would
//! otherwise deadlock the artifact cache.

use std::collections::HashMap;

use crate::error::BuildError;
use crate::release::{HELM_RELEASE_KIND, HELM_REPOSITORY_KIND, HelmRelease, HelmRepository};
use crate::resource::key::ResourceKey;
use crate::resource::store::ResourceStore;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Rejects cyclic reference chains with [`BuildError::CyclicDependency`].
/// Missing references are not an error here; they surface later as
/// `UnresolvedReference` from the stage that needs them.
pub fn verify_acyclic(store: &ResourceStore, releases: &[HelmRelease]) -> Result<(), BuildError> {
    let mut marks: HashMap<ResourceKey, Mark> = HashMap::new();
    for release in releases {
        let mut trail = Vec::new();
        visit(store, release.key().clone(), &mut marks, &mut trail)?;
    }
    Ok(())
}

fn visit(
    store: &ResourceStore,
    key: ResourceKey,
    marks: &mut HashMap<ResourceKey, Mark>,
    trail: &mut Vec<ResourceKey>,
) -> Result<(), BuildError> {
    match marks.get(&key) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = trail.iter().position(|k| *k == key).unwrap_or(0);
            let mut cycle: Vec<ResourceKey> = trail[start..].to_vec();
            cycle.push(key);
            return Err(BuildError::CyclicDependency(cycle));
        }
        None => {}
    }

    marks.insert(key.clone(), Mark::Visiting);
    trail.push(key.clone());
    for dependency in dependencies(store, &key) {
        visit(store, dependency, marks, trail)?;
    }
    trail.pop();
    marks.insert(key, Mark::Done);
    Ok(())
}

fn dependencies(store: &ResourceStore, key: &ResourceKey) -> Vec<ResourceKey> {
    let Some(document) = store.get(key) else {
        return Vec::new();
    };
    match key.kind.as_str() {
        HELM_RELEASE_KIND => {
            let Ok(release) = HelmRelease::from_document(document) else {
                return Vec::new();
            };
            let mut deps = vec![release.source_key()];
            deps.extend(
                release
                    .spec
                    .values_from
                    .iter()
                    .map(|r| release.values_reference_key(r)),
            );
            deps
        }
        HELM_REPOSITORY_KIND => {
            let Ok(repository) = HelmRepository::from_document(document) else {
                return Vec::new();
            };
            [repository.secret_key(), repository.cert_secret_key()]
                .into_iter()
                .flatten()
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::document::Document;
    use assert_matches::assert_matches;

    fn store_from(docs: &[&str]) -> (ResourceStore, Vec<HelmRelease>) {
        let mut store = ResourceStore::default();
        for yaml in docs {
            let body: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
            let kind = body.get("kind").unwrap().as_str().unwrap().to_string();
            let api_version = body
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let metadata = body.get("metadata").unwrap();
            let name = metadata.get("name").unwrap().as_str().unwrap().to_string();
            let namespace = metadata
                .get("namespace")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let key = ResourceKey::from_api_version(api_version, kind, namespace, name);
            store
                .insert(Document::new(key, body, yaml.to_string()))
                .unwrap();
        }
        let releases = store
            .by_kind(HELM_RELEASE_KIND)
            .into_iter()
            .map(|d| HelmRelease::from_document(d).unwrap())
            .collect();
        (store, releases)
    }

    const RELEASE: &str = r#"
apiVersion: helm.toolkit.fluxcd.io/v2
kind: HelmRelease
metadata:
  name: app
  namespace: team-a
spec:
  chart:
    spec:
      chart: podinfo
      sourceRef:
        kind: HelmRepository
        name: charts
  valuesFrom:
    - kind: ConfigMap
      name: base-values
"#;

    const REPOSITORY: &str = r#"
apiVersion: source.toolkit.fluxcd.io/v1
kind: HelmRepository
metadata:
  name: charts
  namespace: team-a
spec:
  url: https://charts.example/
  secretRef:
    name: creds
"#;

    #[test]
    fn test_acyclic_graph_passes() {
        let (store, releases) = store_from(&[
            RELEASE,
            REPOSITORY,
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n  namespace: team-a\n",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: base-values\n  namespace: team-a\n",
        ]);
        verify_acyclic(&store, &releases).unwrap();
    }

    #[test]
    fn test_missing_references_are_not_a_graph_error() {
        let (store, releases) = store_from(&[RELEASE]);
        verify_acyclic(&store, &releases).unwrap();
    }

    #[test]
    fn test_values_reference_back_at_release_is_a_cycle() {
        // A values reference whose kind loops back to the release itself.
        let cyclic_release = r#"
apiVersion: helm.toolkit.fluxcd.io/v2
kind: HelmRelease
metadata:
  name: app
  namespace: team-a
spec:
  chart:
    spec:
      chart: podinfo
      sourceRef:
        kind: HelmRepository
        name: charts
  valuesFrom:
    - kind: HelmRelease
      name: app
"#;
        // The self-edge only exists if the referenced key resolves to the
        // release document, which lives in the helm group. Emulate that with
        // a core-group HelmRelease document.
        let core_release = cyclic_release.replace("apiVersion: helm.toolkit.fluxcd.io/v2\n", "");
        let (store, releases) = store_from(&[&core_release]);
        assert_matches!(
            verify_acyclic(&store, &releases),
            Err(BuildError::CyclicDependency(cycle)) => {
                assert!(cycle.len() >= 2);
                assert_eq!(cycle.first(), cycle.last());
            }
        );
    }
}
